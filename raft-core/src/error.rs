use anyerror::AnyError;

/// Errors surfaced by the engine and its ports.
///
/// Each variant maps to one user-observable failure mode; port
/// implementations fold their own failures into [`Error::Io`].
#[derive(Debug, Clone, thiserror::Error)]
#[derive(PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum Error {
    /// An allocation was refused. Never retried internally.
    #[error("out of memory")]
    OutOfMemory,

    /// A storage or transport operation failed.
    #[error("i/o failure: {0}")]
    Io(AnyError),

    /// A connection to a peer could not be established or reused.
    ///
    /// Replication drops the affected send and carries on; the peer will be
    /// probed again on the next heartbeat.
    #[error("cannot connect to peer")]
    Connect,

    /// The engine is shutting down; the pending operation was abandoned.
    #[error("operation canceled")]
    Canceled,

    /// A state invariant was violated, e.g. a conflict at a committed index
    /// was detected. The engine becomes unavailable and must be re-loaded.
    #[error("invariant violated, engine requires re-load")]
    Shutdown,

    /// A membership change is already in flight.
    #[error("a configuration change is already in progress")]
    Busy,

    /// The operation requires leadership.
    #[error("server is not the leader")]
    NotLeader,

    /// The operation is not valid in the engine's current state.
    #[error("operation not valid in current state")]
    BadState,

    /// Caller-supplied configuration input was rejected.
    #[error("invalid configuration: {0}")]
    BadConfig(String),
}

impl Error {
    /// Wrap a free-form message as a generic I/O failure.
    pub fn io(msg: impl ToString) -> Self {
        Error::Io(AnyError::error(msg))
    }
}
