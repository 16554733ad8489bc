//! Leader-side replication bookkeeping, one record per server in the
//! configuration.

use crate::LogIndex;

/// How the leader is currently feeding a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgressState {
    /// Searching for the follower's match point, one request at a time.
    Probe,

    /// The match point is known; entries stream from `next_index`.
    Pipeline,

    /// The follower is too far behind the compacted log; a snapshot is on
    /// its way. Reset to probe on the next response.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Progress {
    /// Index of the next entry to send.
    pub(crate) next_index: LogIndex,

    /// Highest index known to be replicated on the follower.
    pub(crate) match_index: LogIndex,

    /// Monotonic ms timestamp of the last message received from the
    /// follower; feeds the leader's step-down check.
    pub(crate) last_contact: u64,

    pub(crate) state: ProgressState,
}

impl Progress {
    pub(crate) fn new(next_index: LogIndex, now: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            last_contact: now,
            state: ProgressState::Probe,
        }
    }
}
