use bytes::Bytes;

use crate::Term;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum EntryType {
    /// An opaque command for the user state machine.
    Command,
    /// An encoded cluster [`Configuration`](crate::Configuration).
    Configuration,
    /// Carries no payload; used to flush the commit pipeline.
    Barrier,
}

/// A single replicated log entry.
///
/// Cloning an entry is cheap: the payload is a shared [`Bytes`] buffer.
/// Entries that were materialized together (e.g. decoded from one network
/// read) can hold slices of a single allocation, which is freed when the
/// last of them is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Entry {
    /// Term in which the entry was created.
    pub term: Term,

    pub typ: EntryType,

    /// Opaque payload bytes. Empty for barrier entries.
    pub payload: Bytes,
}

impl Entry {
    pub fn new_command(term: Term, payload: Bytes) -> Self {
        Self {
            term,
            typ: EntryType::Command,
            payload,
        }
    }

    pub fn new_barrier(term: Term) -> Self {
        Self {
            term,
            typ: EntryType::Barrier,
            payload: Bytes::new(),
        }
    }
}
