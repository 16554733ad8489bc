//! The role engine: a deterministic value implementing the Raft protocol.
//!
//! All methods run to completion on the calling thread. Slow work goes
//! through the [`Io`] port and comes back as [`IoCompletion`] values; see
//! the crate docs for the driving contract.

mod client;
mod election;
mod membership;
mod replication;
mod snapshot;
mod tick;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::error::Error as StdError;

use tokio::sync::oneshot;
use validit::Valid;
use validit::Validate;

use crate::config::Config;
use crate::configuration::Configuration;
use crate::entry::Entry;
use crate::error::Error;
use crate::io::Fsm;
use crate::io::Io;
use crate::io::IoCompletion;
use crate::log::Log;
use crate::message::Message;
use crate::progress::Progress;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

pub(crate) use crate::progress::ProgressState;

/// The externally visible role of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not started, or shut down after a fatal error.
    Unavailable,
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Default)]
pub(crate) struct FollowerState {
    /// The leader we last heard from, if any.
    pub(crate) current_leader: Option<(ServerId, String)>,
}

#[derive(Debug)]
pub(crate) struct CandidateState {
    /// One slot per voting server, in configuration order; `true` once that
    /// voter granted us its vote.
    pub(crate) votes: Vec<bool>,
}

pub(crate) type Responder = oneshot::Sender<Result<(), Error>>;

#[derive(Debug, Default)]
pub(crate) struct LeaderState {
    /// Replication progress, parallel to the configuration's server list.
    pub(crate) progress: Vec<Progress>,

    /// Server being promoted to voter; 0 when no promotion is in flight.
    pub(crate) promotee_id: ServerId,
    pub(crate) round_number: u32,
    /// The leader's last index when the current catch-up round started.
    pub(crate) round_index: LogIndex,
    /// Time spent in the current catch-up round.
    pub(crate) round_duration: u64,
    /// Time spent in the whole catch-up.
    pub(crate) catch_up_duration: u64,

    /// Pending apply/barrier requests, keyed by the index their entry took.
    pub(crate) apply_reqs: BTreeMap<LogIndex, Responder>,
}

#[derive(Debug)]
pub(crate) enum RoleState {
    Unavailable,
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

/// Why a batch of entries was submitted to storage; decides what happens
/// when the write completes.
#[derive(Debug)]
pub(crate) enum AppendOrigin {
    /// The leader persisting its own entries.
    Leader,

    /// A follower persisting entries received via AppendEntries; the reply
    /// to the leader is deferred until the write is durable.
    Follower {
        leader_id: ServerId,
        leader_address: String,
        leader_commit: LogIndex,
    },
}

#[derive(Debug)]
pub(crate) struct AppendRequest {
    pub(crate) first_index: LogIndex,
    /// The borrowed entries; released when the write completes.
    pub(crate) entries: Vec<Entry>,
    pub(crate) origin: AppendOrigin,
}

/// Storage appends are serialized: one in flight, the rest queued behind it
/// in submission order.
#[derive(Debug, Default)]
pub(crate) struct AppendPipeline {
    pub(crate) inflight: Option<AppendRequest>,
    pub(crate) queued: VecDeque<AppendRequest>,
}

/// An AppendEntries send whose entries stay borrowed from the log until the
/// transport reports the send complete.
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub(crate) seq: u64,
    pub(crate) first_index: LogIndex,
    pub(crate) entries: Vec<Entry>,
}

/// Snapshot bookkeeping: the last snapshot's metadata plus the single
/// snapshot-put and snapshot-get operations that may be in flight.
#[derive(Debug, Default)]
pub(crate) struct SnapshotTracker {
    /// Metadata of the most recent durable snapshot; (0, 0) means none.
    pub(crate) index: LogIndex,
    pub(crate) term: Term,

    /// A snapshot of our own state machine being persisted.
    pub(crate) pending: Option<crate::snapshot::Snapshot>,

    /// A snapshot received from the leader being persisted.
    pub(crate) installing: Option<crate::snapshot::Snapshot>,

    /// Follower a snapshot-get was issued for; 0 when idle.
    pub(crate) get_target: ServerId,
}

impl SnapshotTracker {
    pub(crate) fn busy(&self) -> bool {
        self.pending.is_some() || self.installing.is_some()
    }
}

/// A single Raft engine.
///
/// Construct with [`Raft::new`], optionally [`Raft::bootstrap`] the very
/// first configuration, then [`Raft::start`]. From then on drive it with
/// [`Raft::tick`], [`Raft::recv`] and [`Raft::io_completed`].
pub struct Raft<IO: Io, F: Fsm> {
    pub(crate) id: ServerId,
    pub(crate) address: String,

    pub(crate) io: IO,
    pub(crate) fsm: F,
    pub(crate) config: Config,

    pub(crate) role: RoleState,

    pub(crate) current_term: Term,
    /// Candidate voted for in the current term; 0 if none.
    pub(crate) voted_for: ServerId,

    pub(crate) log: Valid<Log>,

    /// The active configuration: the committed one, or an uncommitted one
    /// that is already effective for voting and replication.
    pub(crate) configuration: Configuration,
    /// The last committed configuration, kept for rollback on truncation.
    pub(crate) committed_configuration: Configuration,
    pub(crate) configuration_index: LogIndex,
    /// Index of the uncommitted configuration entry; 0 if none.
    pub(crate) configuration_uncommitted_index: LogIndex,

    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    /// Highest log index known durable in storage.
    pub(crate) last_stored: LogIndex,

    /// Milliseconds accumulated since the timer was last reset.
    pub(crate) timer: u64,
    /// The randomized election timeout currently in effect.
    pub(crate) election_timeout_rand: u64,
    pub(crate) last_tick: u64,

    pub(crate) snapshot: SnapshotTracker,
    pub(crate) appends: AppendPipeline,
    pub(crate) sends: Vec<PendingSend>,
}

impl<IO: Io, F: Fsm> Raft<IO, F> {
    /// Create an engine in the [`State::Unavailable`] state.
    pub fn new(id: ServerId, address: impl Into<String>, io: IO, fsm: F, config: Config) -> Result<Self, Error> {
        if id == 0 {
            return Err(Error::BadConfig("server id must not be 0".to_string()));
        }
        Ok(Self {
            id,
            address: address.into(),
            io,
            fsm,
            config,
            role: RoleState::Unavailable,
            current_term: 0,
            voted_for: 0,
            log: Valid::new(Log::new()),
            configuration: Configuration::new(),
            committed_configuration: Configuration::new(),
            configuration_index: 0,
            configuration_uncommitted_index: 0,
            commit_index: 0,
            last_applied: 0,
            last_stored: 0,
            timer: 0,
            election_timeout_rand: 0,
            last_tick: 0,
            snapshot: SnapshotTracker::default(),
            appends: AppendPipeline::default(),
            sends: Vec::new(),
        })
    }

    /// Persist the very first configuration entry, exactly once across the
    /// cluster's life. Must be called before [`Raft::start`].
    pub fn bootstrap(&mut self, configuration: &Configuration) -> Result<(), Error> {
        if !matches!(self.role, RoleState::Unavailable) {
            return Err(Error::BadState);
        }
        if configuration.get(self.id).is_none() {
            return Err(Error::BadConfig(format!(
                "bootstrap configuration does not contain local server {}",
                self.id
            )));
        }
        self.io.bootstrap(configuration)
    }

    /// Load persisted state and become a follower.
    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id))]
    pub fn start(&mut self) -> Result<(), Error> {
        if !matches!(self.role, RoleState::Unavailable) {
            return Err(Error::BadState);
        }

        let state = self.io.load()?;
        self.current_term = state.term;
        self.voted_for = state.voted_for;

        if let Some(snapshot) = state.snapshot {
            self.log.set_offset(snapshot.index);
            self.snapshot.index = snapshot.index;
            self.snapshot.term = snapshot.term;
            self.configuration = snapshot.configuration.clone();
            self.committed_configuration = snapshot.configuration;
            self.configuration_index = snapshot.configuration_index;
            self.commit_index = snapshot.index;
            self.last_applied = snapshot.index;
            self.fsm.restore(snapshot.data)?;
        }

        if !state.entries.is_empty() && state.start_index != self.log.next_index() {
            return Err(Error::io(format!(
                "loaded entries start at {} but the log resumes at {}",
                state.start_index,
                self.log.next_index()
            )));
        }
        for (k, entry) in state.entries.iter().enumerate() {
            let index = state.start_index + k as LogIndex;
            if entry.typ == crate::entry::EntryType::Configuration {
                self.configuration = Configuration::decode(&entry.payload)?;
                self.committed_configuration = self.configuration.clone();
                self.configuration_index = index;
            }
            self.log.append(entry.term, entry.typ, entry.payload.clone());
        }
        self.last_stored = self.local_last_index();

        self.last_tick = self.io.time();
        self.role = RoleState::Follower(FollowerState::default());
        self.reset_election_timer();

        tracing::info!(
            id = self.id,
            term = self.current_term,
            last_index = self.local_last_index(),
            "started"
        );
        Ok(())
    }

    /// Shut the engine down.
    ///
    /// Pending apply requests fail with [`Error::Canceled`]; outstanding
    /// entry borrows are returned to the log. Completions for I/O that is
    /// still in flight are accepted (and ignored) afterwards.
    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id))]
    pub fn close(&mut self) {
        if let RoleState::Leader(leader) = &mut self.role {
            for (_, responder) in std::mem::take(&mut leader.apply_reqs) {
                let _ = responder.send(Err(Error::Canceled));
            }
        }

        if let Some(request) = self.appends.inflight.take() {
            self.log.release(request.first_index, &request.entries);
        }
        while let Some(request) = self.appends.queued.pop_front() {
            self.log.release(request.first_index, &request.entries);
        }
        for send in std::mem::take(&mut self.sends) {
            self.log.release(send.first_index, &send.entries);
        }

        self.role = RoleState::Unavailable;
    }

    /// Shut the engine down and hand its ports back, e.g. to build a new
    /// engine over the same storage after a simulated crash.
    pub fn into_parts(mut self) -> (IO, F) {
        self.close();
        (self.io, self.fsm)
    }

    /// Deliver an inbound RPC message from `from`.
    pub fn recv(&mut self, from: ServerId, message: Message) {
        if matches!(self.role, RoleState::Unavailable) {
            return;
        }
        match message {
            Message::RequestVote(req) => self.handle_vote_request(from, req),
            Message::RequestVoteResult(res) => self.handle_vote_response(from, res),
            Message::AppendEntries(req) => self.handle_append_entries(from, req),
            Message::AppendEntriesResult(res) => self.handle_append_entries_result(from, res),
            Message::InstallSnapshot(req) => self.handle_install_snapshot(from, req),
        }
    }

    /// Deliver the outcome of an asynchronous [`Io`] submission.
    pub fn io_completed(&mut self, completion: IoCompletion) {
        match completion {
            IoCompletion::Append { status } => self.handle_append_flushed(status),
            IoCompletion::Send { seq, status } => self.handle_send_flushed(seq, status),
            IoCompletion::SnapshotPut { status } => self.handle_snapshot_put_done(status),
            IoCompletion::SnapshotGet { result } => self.handle_snapshot_got(result),
        }
    }

    // --- Accessors ---

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> State {
        match self.role {
            RoleState::Unavailable => State::Unavailable,
            RoleState::Follower(_) => State::Follower,
            RoleState::Candidate(_) => State::Candidate,
            RoleState::Leader(_) => State::Leader,
        }
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> ServerId {
        self.voted_for
    }

    /// The leader this server currently recognizes: itself when leading,
    /// the sender of recent AppendEntries when following.
    pub fn current_leader(&self) -> Option<ServerId> {
        match &self.role {
            RoleState::Leader(_) => Some(self.id),
            RoleState::Follower(f) => f.current_leader.as_ref().map(|(id, _)| *id),
            _ => None,
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_stored(&self) -> LogIndex {
        self.last_stored
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Index of the last committed configuration entry.
    pub fn configuration_index(&self) -> LogIndex {
        self.configuration_index
    }

    /// Index of the pending configuration entry; 0 when none is in flight.
    pub fn configuration_uncommitted_index(&self) -> LogIndex {
        self.configuration_uncommitted_index
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot.index
    }

    pub fn fsm(&self) -> &F {
        &self.fsm
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    /// The local last index, falling back to the snapshot when the
    /// in-memory log was fully compacted.
    pub fn local_last_index(&self) -> LogIndex {
        let index = self.log.last_index();
        if index == 0 && self.snapshot.index != 0 {
            self.snapshot.index
        } else {
            index
        }
    }

    pub(crate) fn local_last_term(&self) -> Term {
        let term = self.log.last_term();
        if term == 0 && self.snapshot.term != 0 {
            self.snapshot.term
        } else {
            term
        }
    }

    pub(crate) fn address_of(&self, id: ServerId) -> String {
        self.configuration.get(id).map(|s| s.address.clone()).unwrap_or_default()
    }

    // --- Role transitions ---

    /// Become a follower of `term`. A term strictly greater than the
    /// current one is persisted and clears the recorded vote.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn convert_to_follower(&mut self, term: Term) {
        debug_assert!(term >= self.current_term);

        if term > self.current_term {
            if let Err(e) = self.io.set_term(term) {
                tracing::warn!(error = %e, "failed to persist term; stepping down with old term");
            } else {
                self.current_term = term;
                self.voted_for = 0;
            }
        }

        self.leave_current_role(Error::NotLeader);
        self.role = RoleState::Follower(FollowerState::default());
        self.reset_election_timer();
    }

    pub(crate) fn convert_to_candidate(&mut self) {
        self.leave_current_role(Error::NotLeader);
        let n_voting = self.configuration.n_voting();
        self.role = RoleState::Candidate(CandidateState {
            votes: vec![false; n_voting],
        });
        if let Err(e) = self.start_election() {
            tracing::warn!(error = %e, "failed to start election; will retry on timeout");
        }
    }

    pub(crate) fn convert_to_leader(&mut self) {
        self.leave_current_role(Error::NotLeader);

        let now = self.io.time();
        let next_index = self.local_last_index() + 1;
        let progress = self.configuration.servers().iter().map(|_| Progress::new(next_index, now)).collect();

        self.role = RoleState::Leader(LeaderState {
            progress,
            ..LeaderState::default()
        });
        self.timer = 0;

        tracing::info!(id = self.id, term = self.current_term, "converted to leader");

        // Send the initial empty AppendEntries round right away, both to
        // assert authority and to learn every follower's match point. This
        // bypasses the idle-round send suppression: nobody has been
        // contacted yet.
        let targets: Vec<usize> = (0..self.configuration.len()).collect();
        for i in targets {
            if self.configuration.servers()[i].id == self.id {
                continue;
            }
            if let Err(e) = self.send_append_entries(i) {
                if e != Error::Connect {
                    tracing::warn!(error = %e, "failed to send initial heartbeat");
                }
            }
        }
    }

    /// Tear down role-specific state before switching roles.
    fn leave_current_role(&mut self, pending_error: Error) {
        if let RoleState::Leader(leader) = &mut self.role {
            for (_, responder) in std::mem::take(&mut leader.apply_reqs) {
                let _ = responder.send(Err(pending_error.clone()));
            }
        }
    }

    /// A violated invariant was detected; the engine refuses all further
    /// work until re-loaded.
    pub(crate) fn fatal(&mut self, error: Error) {
        tracing::error!(error = %error, "fatal error, engine is now unavailable");
        self.leave_current_role(Error::Shutdown);
        self.role = RoleState::Unavailable;
    }
}

impl<IO: Io, F: Fsm> Validate for Raft<IO, F> {
    fn validate(&self) -> Result<(), Box<dyn StdError>> {
        if matches!(self.role, RoleState::Unavailable) {
            return Ok(());
        }
        validit::less_equal!(self.last_applied, self.commit_index);
        if self.snapshot.index != 0 {
            validit::less_equal!(self.snapshot.index, self.commit_index);
        }
        // While a received snapshot is being persisted the log is
        // transiently empty and the index checks do not apply.
        if self.snapshot.installing.is_none() {
            validit::less_equal!(self.commit_index, self.local_last_index());
            validit::less_equal!(self.last_stored, self.local_last_index());
        }
        self.log.validate()?;
        Ok(())
    }
}
