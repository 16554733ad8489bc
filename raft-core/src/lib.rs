//! A deterministic Raft consensus engine.
//!
//! This crate implements the core of the Raft protocol as described in Diego
//! Ongaro's dissertation: leader election, log replication, one-at-a-time
//! membership change and log-based snapshotting. The engine is a plain value
//! that runs to completion on the calling thread; everything slow or fallible
//! (disk writes, network sends, state machine snapshots) is delegated to a
//! pair of ports:
//!
//! - [`Io`]: durable state, timers, randomness and the transport;
//! - [`Fsm`]: the caller's replicated state machine.
//!
//! Submissions to the [`Io`] port return immediately. The driver delivers
//! their outcomes back into the engine as [`IoCompletion`] values, so the
//! whole protocol can be driven under simulated time. The [`testing`] module
//! contains such a driver: an in-memory cluster that advances a virtual
//! clock, delivers RPC messages with configurable latency and checks the
//! classic Raft safety properties on every step.
//!
//! ```no_run
//! use raft_core::testing::Cluster;
//!
//! let mut cluster = Cluster::bootstrapped(3, 3);
//! cluster.elect(0);
//! assert_eq!(Some(0), cluster.leader_index());
//! ```

pub mod config;
pub mod configuration;
pub mod entry;
pub mod error;
pub mod io;
pub mod log;
pub mod message;
mod progress;
pub mod raft;
pub mod snapshot;
pub mod testing;

pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::configuration::Configuration;
pub use crate::configuration::Server;
pub use crate::entry::Entry;
pub use crate::entry::EntryType;
pub use crate::error::Error;
pub use crate::io::Fsm;
pub use crate::io::InitialState;
pub use crate::io::Io;
pub use crate::io::IoCompletion;
pub use crate::log::Log;
pub use crate::message::AppendEntriesRequest;
pub use crate::message::AppendEntriesResponse;
pub use crate::message::InstallSnapshotRequest;
pub use crate::message::Message;
pub use crate::message::MessageKind;
pub use crate::message::VoteRequest;
pub use crate::message::VoteResponse;
pub use crate::raft::Raft;
pub use crate::raft::State;
pub use crate::snapshot::Snapshot;

/// An election epoch. A leader's authority is bounded to its term.
pub type Term = u64;

/// A 1-based position in the replicated log. `0` means "none".
pub type LogIndex = u64;

/// Identifies a server in the cluster. `0` is reserved and never assigned.
pub type ServerId = u64;
