use bytes::Bytes;

use crate::configuration::Configuration;
use crate::LogIndex;
use crate::Term;

/// A persisted snapshot: the state machine's content at `index`, replacing
/// the log prefix up to and including it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    /// Index of the last entry the snapshot covers.
    pub index: LogIndex,

    /// Term of that entry.
    pub term: Term,

    /// The configuration as of `index`, and the index it was committed at.
    pub configuration: Configuration,
    pub configuration_index: LogIndex,

    /// The serialized state machine.
    pub data: Bytes,
}
