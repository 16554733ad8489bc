//! Log replication: the leader's sending side, the follower's receiving
//! side, quorum tracking and the apply loop.

use crate::entry::Entry;
use crate::entry::EntryType;
use crate::error::Error;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::Message;
use crate::raft::AppendOrigin;
use crate::raft::AppendRequest;
use crate::raft::PendingSend;
use crate::raft::ProgressState;
use crate::raft::RoleState;
use crate::Fsm;
use crate::Io;
use crate::LogIndex;
use crate::Raft;
use crate::ServerId;

/// After this much silence from a follower, stop re-sending the log tail
/// and fall back to pure heartbeats until it answers again.
const PROBE_AFTER_SILENCE_MS: u64 = 5000;

/// Outcome of the log-matching check on an inbound AppendEntries.
enum PrevCheck {
    Ok,
    Reject,
    /// The mismatch falls at or below the commit index; the cluster is
    /// inconsistent.
    Fatal,
}

impl<IO: Io, F: Fsm> Raft<IO, F> {
    /// Persist new entries starting at `index` (0 for none) and send
    /// AppendEntries to every other server. Also serves as the heartbeat.
    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id, index = index))]
    pub(crate) fn trigger_replication(&mut self, index: LogIndex) {
        debug_assert!(matches!(self.role, RoleState::Leader(_)));

        self.leader_append(index);

        // This was not an idle period; hold heartbeats for a full interval.
        self.timer = 0;

        let now = self.io.time();
        let targets: Vec<(usize, ServerId)> =
            self.configuration.servers().iter().enumerate().map(|(i, s)| (i, s.id)).collect();

        for (i, id) in targets {
            if id == self.id {
                continue;
            }
            if index == 0 {
                let RoleState::Leader(leader) = &self.role else {
                    return;
                };
                let Some(progress) = leader.progress.get(i) else {
                    continue;
                };
                if now.saturating_sub(progress.last_contact) < self.config.heartbeat_timeout / 2 {
                    // Heard from it recently; skip this idle round.
                    continue;
                }
            }
            if let Err(e) = self.send_append_entries(i) {
                if e != Error::Connect {
                    tracing::warn!(target = id, error = %e, "failed to send append entries");
                }
            }
        }
    }

    /// Submit the leader's own entries from `index` for durable storage.
    fn leader_append(&mut self, index: LogIndex) {
        if index == 0 {
            return;
        }
        let entries = self.log.acquire(index);
        if entries.is_empty() {
            return;
        }
        self.appends.queued.push_back(AppendRequest {
            first_index: index,
            entries,
            origin: AppendOrigin::Leader,
        });
        self.pump_appends();
    }

    /// Submit the next queued storage append if none is in flight.
    pub(crate) fn pump_appends(&mut self) {
        if self.appends.inflight.is_some() {
            return;
        }
        let Some(request) = self.appends.queued.pop_front() else {
            return;
        };
        let result = self.io.append(request.first_index, request.entries.clone());
        self.appends.inflight = Some(request);
        if let Err(e) = result {
            tracing::warn!(error = %e, "storage append submission failed");
            self.handle_append_flushed(Err(e));
        }
    }

    /// The in-flight storage append completed.
    pub(crate) fn handle_append_flushed(&mut self, status: Result<(), Error>) {
        let Some(request) = self.appends.inflight.take() else {
            return;
        };

        let stored = if status.is_ok() {
            self.update_last_stored(request.first_index, &request.entries)
        } else {
            0
        };
        self.log.release(request.first_index, &request.entries);

        match request.origin {
            AppendOrigin::Leader => self.leader_append_flushed(&status),
            AppendOrigin::Follower {
                leader_id,
                leader_address,
                leader_commit,
            } => {
                self.follower_append_flushed(&status, &request.entries, request.first_index, stored, leader_id, &leader_address, leader_commit);
            }
        }

        self.pump_appends();
    }

    /// Count how many entries of a completed write are still present in the
    /// in-memory log (a truncation may have raced the write) and advance
    /// the durable watermark past them.
    fn update_last_stored(&mut self, first_index: LogIndex, entries: &[Entry]) -> usize {
        let mut n = 0;
        for (k, entry) in entries.iter().enumerate() {
            let local_term = self.log.term_of(first_index + k as LogIndex);
            if local_term == 0 || local_term != entry.term {
                break;
            }
            n = k + 1;
        }
        if n > 0 {
            self.last_stored = first_index + n as LogIndex - 1;
        }
        n
    }

    fn leader_append_flushed(&mut self, status: &Result<(), Error>) {
        if !matches!(self.role, RoleState::Leader(_)) {
            tracing::debug!("no longer leader, ignoring write result");
            return;
        }
        if status.is_err() {
            // The entries stay in the log; replication to followers can
            // still commit them. Nothing sensible to do locally.
            return;
        }

        // Count ourselves only while we are part of the configuration
        // (§4.2.2: a leader that was asked to remove itself replicates
        // entries but is not counted in majorities).
        let self_index = self.configuration.index_of(self.id);
        let last_stored = self.last_stored;
        if let (Some(i), RoleState::Leader(leader)) = (self_index, &mut self.role) {
            if let Some(progress) = leader.progress.get_mut(i) {
                progress.match_index = last_stored;
                progress.next_index = last_stored + 1;
            }
        }

        self.try_commit();
    }

    #[allow(clippy::too_many_arguments)]
    fn follower_append_flushed(
        &mut self,
        status: &Result<(), Error>,
        entries: &[Entry],
        first_index: LogIndex,
        stored: usize,
        leader_id: ServerId,
        leader_address: &str,
        leader_commit: LogIndex,
    ) {
        if !matches!(self.role, RoleState::Follower(_)) {
            tracing::debug!("no longer follower, ignoring write result");
            return;
        }

        if status.is_err() {
            // Drop the unstored suffix, and any queued write built on top
            // of it, so the leader's retry starts from a clean log.
            let queued = std::mem::take(&mut self.appends.queued);
            for request in queued {
                if request.first_index >= first_index {
                    self.log.release(request.first_index, &request.entries);
                } else {
                    self.appends.queued.push_back(request);
                }
            }
            if self.log.last_index() >= first_index {
                self.log.truncate(first_index);
            }
            self.last_stored = self.last_stored.min(first_index.saturating_sub(1));

            self.respond_append_entries(leader_id, leader_address, false);
            return;
        }

        // Entries that were truncated while the write was in flight are
        // nobody's business anymore; without any survivor there is nothing
        // to report either.
        if stored == 0 {
            return;
        }

        for (k, entry) in entries.iter().take(stored).enumerate() {
            if entry.typ == EntryType::Configuration {
                self.store_uncommitted_configuration(first_index + k as LogIndex, entry);
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(self.last_stored);
            self.apply_committed();
        }

        self.respond_append_entries(leader_id, leader_address, true);
    }

    pub(crate) fn respond_append_entries(&mut self, to: ServerId, address: &str, success: bool) {
        let last_log_index = if success {
            self.last_stored
        } else {
            self.local_last_index()
        };
        let response = Message::AppendEntriesResult(AppendEntriesResponse {
            term: self.current_term,
            success,
            last_log_index,
        });
        if let Err(e) = self.io.send(to, address, response) {
            tracing::debug!(error = %e, "failed to send append entries result");
        }
    }

    /// Send one AppendEntries request to the `i`-th server of the
    /// configuration.
    pub(crate) fn send_append_entries(&mut self, i: usize) -> Result<(), Error> {
        let (target, address) = match self.configuration.servers().get(i) {
            Some(s) => (s.id, s.address.clone()),
            None => return Ok(()),
        };
        debug_assert_ne!(target, self.id);

        let now = self.io.time();
        let (in_snapshot, last_contact, progress_next) = {
            let RoleState::Leader(leader) = &self.role else {
                return Ok(());
            };
            let Some(progress) = leader.progress.get(i) else {
                return Ok(());
            };
            (
                progress.state == ProgressState::Snapshot,
                progress.last_contact,
                progress.next_index,
            )
        };

        // A follower that is receiving a snapshot, or that has been silent
        // for a long time, only gets pure heartbeats: re-sending a long log
        // tail to an unreachable server is wasted work.
        let next_index = if in_snapshot || now.saturating_sub(last_contact) > PROBE_AFTER_SILENCE_MS {
            self.local_last_index() + 1
        } else {
            progress_next
        };

        let mut prev_log_index = 0;
        let mut prev_log_term = 0;
        if next_index == 1 {
            // Replicating from the very beginning: prevIndex and prevTerm
            // are null, unless even the first entry was compacted away.
            if self.log.term_of(1) == 0 && self.snapshot.index > 0 {
                return self.send_snapshot(i);
            }
        } else {
            prev_log_index = next_index - 1;
            prev_log_term = self.log.term_of(prev_log_index);

            // §5.4.1 fallback: the entry preceding next_index is gone from
            // the log. If it sits behind the snapshot we know nothing about
            // that part of the log anymore and must send the snapshot; if
            // it is exactly the snapshot's last entry, the snapshot
            // metadata supplies the term.
            if prev_log_term == 0 {
                if prev_log_index < self.snapshot.index {
                    tracing::info!(target = target, index = prev_log_index, "entry compacted, sending snapshot");
                    return self.send_snapshot(i);
                }
                if prev_log_index == self.snapshot.index {
                    prev_log_term = self.snapshot.term;
                }
            }
        }

        let entries = self.log.acquire(next_index);
        let n = entries.len();

        let message = Message::AppendEntries(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: entries.clone(),
            leader_commit: self.commit_index,
        });

        tracing::debug!(target = target, n = n, next_index = next_index, "sending append entries");

        match self.io.send(target, &address, message) {
            Ok(seq) => {
                if n > 0 {
                    self.sends.push(PendingSend {
                        seq,
                        first_index: next_index,
                        entries,
                    });
                }
                Ok(())
            }
            Err(e) => {
                if n > 0 {
                    self.log.release(next_index, &entries);
                }
                Err(e)
            }
        }
    }

    /// A transport send completed; return the entries it borrowed.
    pub(crate) fn handle_send_flushed(&mut self, seq: u64, _status: Result<(), Error>) {
        if let Some(pos) = self.sends.iter().position(|s| s.seq == seq) {
            let send = self.sends.swap_remove(pos);
            self.log.release(send.first_index, &send.entries);
        }
    }

    // --- Receiver side ---

    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id, from = from))]
    pub(crate) fn handle_append_entries(&mut self, from: ServerId, req: AppendEntriesRequest) {
        let _ = from;

        if req.term < self.current_term {
            tracing::debug!(term = req.term, "stale term, rejecting append entries");
            let address = self.address_of(req.leader_id);
            self.respond_append_entries(req.leader_id, &address, false);
            return;
        }

        if req.term > self.current_term || !matches!(self.role, RoleState::Follower(_)) {
            if req.term == self.current_term && matches!(self.role, RoleState::Leader(_)) {
                // Never: Election Safety guarantees one leader per term.
                tracing::error!(term = req.term, other = req.leader_id, "second leader in the same term");
                return;
            }
            self.convert_to_follower(req.term);
        }

        let leader_address = self.address_of(req.leader_id);
        if let RoleState::Follower(follower) = &mut self.role {
            follower.current_leader = Some((req.leader_id, leader_address.clone()));
        }
        self.timer = 0;

        match self.check_prev_log_entry(&req) {
            PrevCheck::Ok => {}
            PrevCheck::Reject => {
                self.respond_append_entries(req.leader_id, &leader_address, false);
                return;
            }
            PrevCheck::Fatal => {
                tracing::error!("previous index conflicts with a committed entry");
                self.fatal(Error::Shutdown);
                return;
            }
        }

        // Figure 3.1, receiver step 3: delete conflicting entries. `first_new`
        // ends up at the first entry we do not already have.
        let mut first_new = req.entries.len();
        for (j, entry) in req.entries.iter().enumerate() {
            let index = req.prev_log_index + 1 + j as LogIndex;
            let local_term = self.log.term_of(index);
            if local_term == 0 {
                first_new = j;
                break;
            }
            if local_term != entry.term {
                if index <= self.commit_index {
                    tracing::error!(index = index, "conflict with a committed entry");
                    self.fatal(Error::Shutdown);
                    return;
                }

                tracing::debug!(index = index, "log mismatch, truncating");

                // An uncommitted configuration that is about to be wiped
                // must stop being effective first.
                self.rollback_uncommitted_configuration(index);

                if let Err(e) = self.io.truncate(index) {
                    tracing::warn!(error = %e, "storage truncate failed");
                    self.respond_append_entries(req.leader_id, &leader_address, false);
                    return;
                }
                self.log.truncate(index);
                self.last_stored = self.last_stored.min(index - 1);

                first_new = j;
                break;
            }
        }

        let n_new = req.entries.len() - first_new;
        if n_new == 0 {
            // Nothing to write; possibly still something to commit
            // (receiver step 5).
            if req.leader_commit > self.commit_index {
                self.commit_index = req.leader_commit.min(self.local_last_index());
                self.apply_committed();
            }
            self.respond_append_entries(req.leader_id, &leader_address, true);
            return;
        }

        let append_from = req.prev_log_index + 1 + first_new as LogIndex;
        debug_assert_eq!(append_from, self.log.next_index());

        for entry in &req.entries[first_new..] {
            self.log.append(entry.term, entry.typ, entry.payload.clone());
        }

        // The reply is deferred until the entries are durable.
        let entries = self.log.acquire(append_from);
        debug_assert_eq!(n_new, entries.len());
        self.appends.queued.push_back(AppendRequest {
            first_index: append_from,
            entries,
            origin: AppendOrigin::Follower {
                leader_id: req.leader_id,
                leader_address,
                leader_commit: req.leader_commit,
            },
        });
        self.pump_appends();
    }

    /// Figure 3.1, receiver step 2: the entry preceding the new ones must
    /// match, consulting the snapshot when the log was compacted up to it.
    fn check_prev_log_entry(&self, req: &AppendEntriesRequest) -> PrevCheck {
        if req.prev_log_index == 0 {
            return PrevCheck::Ok;
        }

        let local_prev_term = if self.snapshot.index == req.prev_log_index {
            self.snapshot.term
        } else {
            self.log.term_of(req.prev_log_index)
        };

        if local_prev_term == 0 {
            tracing::debug!(prev = req.prev_log_index, "no entry at previous index, rejecting");
            return PrevCheck::Reject;
        }
        if local_prev_term != req.prev_log_term {
            if req.prev_log_index <= self.commit_index {
                return PrevCheck::Fatal;
            }
            tracing::debug!(prev = req.prev_log_index, "previous term mismatch, rejecting");
            return PrevCheck::Reject;
        }
        PrevCheck::Ok
    }

    /// A follower answered an AppendEntries request.
    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id, from = from))]
    pub(crate) fn handle_append_entries_result(&mut self, from: ServerId, res: AppendEntriesResponse) {
        if res.term > self.current_term {
            self.convert_to_follower(res.term);
            return;
        }
        if !matches!(self.role, RoleState::Leader(_)) || res.term < self.current_term {
            return;
        }
        let Some(i) = self.configuration.index_of(from) else {
            return;
        };

        let now = self.io.time();
        let local_last = self.local_last_index();

        enum Action {
            Nothing,
            Retry,
            Updated,
        }

        let action = {
            let RoleState::Leader(leader) = &mut self.role else {
                return;
            };
            let Some(progress) = leader.progress.get_mut(i) else {
                return;
            };

            progress.last_contact = now;

            // Hearing back at all means any snapshot we sent has landed (or
            // was dropped); go find the match point again.
            if progress.state == ProgressState::Snapshot {
                progress.state = ProgressState::Probe;
            }

            if !res.success {
                if progress.match_index == progress.next_index - 1 {
                    // Everything up to next_index already matched; this
                    // rejection is a reordered leftover.
                    tracing::debug!("match index is up to date, ignoring rejection");
                    Action::Nothing
                } else {
                    // Figure 3.1: decrement next_index and retry, taking
                    // the follower's hint when it is useful.
                    if res.last_log_index < progress.next_index - 1 {
                        progress.next_index = res.last_log_index.min(local_last);
                    } else {
                        progress.next_index -= 1;
                    }
                    progress.next_index = progress.next_index.max(1);
                    tracing::debug!(next_index = progress.next_index, "log mismatch, sending older entries");
                    Action::Retry
                }
            } else if res.last_log_index <= progress.match_index {
                // A stale success for something already acknowledged.
                Action::Nothing
            } else {
                progress.next_index = res.last_log_index + 1;
                progress.match_index = res.last_log_index;
                progress.state = ProgressState::Pipeline;
                tracing::debug!(
                    match_index = progress.match_index,
                    next_index = progress.next_index,
                    "follower acknowledged entries"
                );
                Action::Updated
            }
        };

        match action {
            Action::Nothing => {}
            Action::Retry => {
                let _ = self.send_append_entries(i);
            }
            Action::Updated => {
                let promotee = match &self.role {
                    RoleState::Leader(leader) => leader.promotee_id,
                    _ => 0,
                };
                if promotee != 0 && promotee == from && self.update_catch_up_round() {
                    self.trigger_promotion();
                }
                self.try_commit();
            }
        }
    }

    // --- Commit & apply ---

    /// Recompute the commit index from the voters' match indexes.
    ///
    /// The median match across voters (counting our own durable watermark)
    /// is replicated on a majority; it commits only if it belongs to the
    /// current term (§3.6.2: a leader never commits entries from previous
    /// terms by counting replicas).
    pub(crate) fn try_commit(&mut self) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };

        let mut matches: Vec<LogIndex> = Vec::with_capacity(self.configuration.len());
        for (i, server) in self.configuration.servers().iter().enumerate() {
            if !server.voting {
                continue;
            }
            if server.id == self.id {
                matches.push(self.last_stored);
            } else if let Some(progress) = leader.progress.get(i) {
                matches.push(progress.match_index);
            }
        }

        let quorum = self.configuration.quorum();
        if matches.len() < quorum {
            return;
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let majority_match = matches[quorum - 1];

        if majority_match > self.commit_index && self.log.term_of(majority_match) == self.current_term {
            self.commit_index = majority_match;
            tracing::debug!(commit_index = self.commit_index, "new commit index");
            self.apply_committed();
        }
    }

    /// Feed every newly committed entry to the state machine, in log order.
    pub(crate) fn apply_committed(&mut self) {
        debug_assert!(self.last_applied <= self.commit_index);

        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = match self.log.get(index) {
                Some(entry) => entry.clone(),
                None => {
                    tracing::error!(index = index, "committed entry missing from the log");
                    self.fatal(Error::Shutdown);
                    return;
                }
            };

            match entry.typ {
                EntryType::Command => {
                    if let Err(e) = self.fsm.apply(&entry.payload) {
                        tracing::warn!(index = index, error = %e, "state machine failed to apply entry");
                        break;
                    }
                    self.respond_to_apply(index, Ok(()));
                }
                EntryType::Barrier => {
                    self.respond_to_apply(index, Ok(()));
                }
                EntryType::Configuration => {
                    self.commit_configuration(index);
                }
            }

            self.last_applied = index;
        }

        self.maybe_take_snapshot();
    }

    fn respond_to_apply(&mut self, index: LogIndex, result: Result<(), Error>) {
        if let RoleState::Leader(leader) = &mut self.role {
            if let Some(responder) = leader.apply_reqs.remove(&index) {
                let _ = responder.send(result);
            }
        }
    }
}
