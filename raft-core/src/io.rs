//! The ports through which the engine reaches the outside world.
//!
//! Everything the engine cannot compute deterministically (durable state,
//! the transport, time and randomness) lives behind [`Io`]; the caller's
//! replicated state machine lives behind [`Fsm`]. Submissions return
//! immediately. The driver that owns the port (a production event loop, or
//! the in-memory cluster in [`testing`](crate::testing)) later feeds each
//! outcome back through [`Raft::io_completed`](crate::Raft::io_completed) as
//! an [`IoCompletion`].
//!
//! Completions for a given engine must be delivered on the engine's thread,
//! and storage-append completions in submission order.

use bytes::Bytes;

use crate::configuration::Configuration;
use crate::entry::Entry;
use crate::error::Error;
use crate::message::Message;
use crate::snapshot::Snapshot;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

/// Everything [`Io::load`] recovers from durable storage.
#[derive(Debug, Clone, Default)]
pub struct InitialState {
    pub term: Term,

    /// Who this server voted for in `term`; `0` if nobody.
    pub voted_for: ServerId,

    /// The most recent snapshot, if one was taken.
    pub snapshot: Option<Snapshot>,

    /// Index of the first entry in `entries`. Meaningful only when `entries`
    /// is non-empty; the tail follows contiguously.
    pub start_index: LogIndex,

    pub entries: Vec<Entry>,
}

/// The storage, transport and clock port.
///
/// `set_term`, `set_vote`, `bootstrap` and `truncate` are durable before
/// they return. `append`, `snapshot_put` and `snapshot_get` only submit;
/// their outcome arrives later as an [`IoCompletion`]. `send` likewise
/// completes asynchronously, identified by the sequence number it returns.
pub trait Io {
    fn load(&mut self) -> Result<InitialState, Error>;

    /// Write the initial configuration entry at index 1, term 1. Fails with
    /// [`Error::BadState`] if any state exists already.
    fn bootstrap(&mut self, configuration: &Configuration) -> Result<(), Error>;

    fn set_term(&mut self, term: Term) -> Result<(), Error>;

    fn set_vote(&mut self, id: ServerId) -> Result<(), Error>;

    /// Submit `entries` for durable storage starting at `first_index`.
    /// At most one append is in flight per engine.
    fn append(&mut self, first_index: LogIndex, entries: Vec<Entry>) -> Result<(), Error>;

    /// Durably discard all entries at and after `from_index`.
    fn truncate(&mut self, from_index: LogIndex) -> Result<(), Error>;

    /// Submit a snapshot for durable storage. Entries it covers may be
    /// discarded from storage once it is durable.
    fn snapshot_put(&mut self, snapshot: Snapshot) -> Result<(), Error>;

    /// Request the most recent durable snapshot.
    fn snapshot_get(&mut self) -> Result<(), Error>;

    /// Submit a message for delivery. Returns a sequence number identifying
    /// the matching [`IoCompletion::Send`].
    fn send(&mut self, to: ServerId, to_address: &str, message: Message) -> Result<u64, Error>;

    /// Monotonic milliseconds.
    fn time(&mut self) -> u64;

    /// A value in `[min, max)`, from this engine's random source.
    fn random(&mut self, min: u64, max: u64) -> u64;
}

/// Outcome of an asynchronous [`Io`] submission, delivered back into the
/// engine by the driver.
#[derive(Debug)]
pub enum IoCompletion {
    /// The in-flight storage append finished.
    Append { status: Result<(), Error> },

    /// The send identified by `seq` finished; its buffers can be released.
    Send { seq: u64, status: Result<(), Error> },

    /// The in-flight snapshot write finished.
    SnapshotPut { status: Result<(), Error> },

    /// The snapshot read finished.
    SnapshotGet { result: Result<Snapshot, Error> },
}

/// The caller-supplied replicated state machine.
pub trait Fsm {
    /// Apply one committed command payload.
    fn apply(&mut self, payload: &Bytes) -> Result<(), Error>;

    /// Materialize the current state for snapshotting.
    fn snapshot(&mut self) -> Result<Bytes, Error>;

    /// Replace the current state with a snapshot's content.
    fn restore(&mut self, data: Bytes) -> Result<(), Error>;
}
