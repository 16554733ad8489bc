//! The RPC messages exchanged between engines.
//!
//! Wire encoding is the transport's business; the engine only requires that
//! these types round-trip losslessly, which the serde derives provide.

use bytes::Bytes;

use crate::configuration::Configuration;
use crate::entry::Entry;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct VoteResponse {
    /// The responder's term, so a stale candidate can catch up.
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ServerId,

    /// Index and term of the entry immediately preceding `entries`; both `0`
    /// when replicating from the very beginning of the log.
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,

    pub entries: Vec<Entry>,

    /// The leader's commit index, so followers learn what to apply.
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,

    /// On success, the index of the last entry the follower has durably
    /// stored; on rejection, a hint for the leader's `next_index` backoff.
    pub last_log_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: ServerId,

    /// Index and term of the last entry the snapshot replaces.
    pub last_index: LogIndex,
    pub last_term: Term,

    /// The configuration as of the snapshot, and the index it was committed
    /// at.
    pub configuration_index: LogIndex,
    pub configuration: Configuration,

    pub data: Bytes,
}

/// Any message an engine can receive, tagged with nothing but itself: sender
/// identity travels alongside in the transport envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum Message {
    RequestVote(VoteRequest),
    RequestVoteResult(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResult(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
}

/// Discriminant of [`Message`], used by the test fixture's drop filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RequestVote,
    RequestVoteResult,
    AppendEntries,
    AppendEntriesResult,
    InstallSnapshot,
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResult(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResult(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RequestVote(_) => MessageKind::RequestVote,
            Message::RequestVoteResult(_) => MessageKind::RequestVoteResult,
            Message::AppendEntries(_) => MessageKind::AppendEntries,
            Message::AppendEntriesResult(_) => MessageKind::AppendEntriesResult,
            Message::InstallSnapshot(_) => MessageKind::InstallSnapshot,
        }
    }
}
