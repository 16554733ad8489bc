//! Snapshotting: taking local snapshots, streaming them to lagging
//! followers, and installing snapshots received from the leader.

use crate::error::Error;
use crate::message::InstallSnapshotRequest;
use crate::message::Message;
use crate::raft::ProgressState;
use crate::raft::RoleState;
use crate::snapshot::Snapshot;
use crate::Fsm;
use crate::Io;
use crate::Raft;
use crate::ServerId;

impl<IO: Io, F: Fsm> Raft<IO, F> {
    /// Take a snapshot once enough entries were applied since the last one.
    pub(crate) fn maybe_take_snapshot(&mut self) {
        if self.snapshot.busy() {
            return;
        }
        if self.last_applied - self.snapshot.index < self.config.snapshot_threshold {
            return;
        }

        let term = self.log.term_of(self.last_applied);
        if term == 0 {
            return;
        }

        let data = match self.fsm.snapshot() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "state machine failed to produce a snapshot");
                return;
            }
        };

        let snapshot = Snapshot {
            index: self.last_applied,
            term,
            configuration: self.committed_configuration.clone(),
            configuration_index: self.configuration_index,
            data,
        };

        tracing::info!(index = snapshot.index, term = snapshot.term, "taking snapshot");

        self.snapshot.pending = Some(snapshot.clone());
        if let Err(e) = self.io.snapshot_put(snapshot) {
            tracing::warn!(error = %e, "failed to submit snapshot");
            self.snapshot.pending = None;
        }
    }

    /// The single in-flight snapshot write completed; it was either our own
    /// snapshot being taken or a received one being installed.
    pub(crate) fn handle_snapshot_put_done(&mut self, status: Result<(), Error>) {
        if self.snapshot.installing.is_some() {
            self.finish_install_snapshot(status);
        } else {
            self.finish_take_snapshot(status);
        }
    }

    fn finish_take_snapshot(&mut self, status: Result<(), Error>) {
        let Some(pending) = self.snapshot.pending.take() else {
            return;
        };
        if let Err(e) = status {
            tracing::warn!(index = pending.index, error = %e, "failed to persist snapshot");
            return;
        }

        self.snapshot.index = pending.index;
        self.snapshot.term = pending.term;

        // Compact the log, keeping a trailing window so followers that are
        // only slightly behind can still be served from it.
        let n_entries = self.log.n_entries() as u64;
        let trailing = self.config.snapshot_trailing;
        if n_entries > trailing {
            let mut shift_index = self.log.last_index() - trailing;
            if pending.index < shift_index {
                shift_index = pending.index;
            }
            self.log.shift(shift_index);
        }

        tracing::info!(index = pending.index, "snapshot persisted");
    }

    fn finish_install_snapshot(&mut self, status: Result<(), Error>) {
        let Some(snapshot) = self.snapshot.installing.take() else {
            return;
        };
        if let Err(e) = status {
            tracing::warn!(index = snapshot.index, error = %e, "failed to persist received snapshot");
            return;
        }

        // Entries that slipped in while the write was in flight are covered
        // by the snapshot anyway.
        if self.log.n_entries() > 0 {
            let first_index = self.log.first_index();
            self.log.truncate(first_index);
        }
        self.log.set_offset(snapshot.index);

        self.snapshot.index = snapshot.index;
        self.snapshot.term = snapshot.term;
        self.last_stored = snapshot.index;
        self.last_applied = snapshot.index;
        self.commit_index = self.commit_index.max(snapshot.index);

        if let Err(e) = self.fsm.restore(snapshot.data.clone()) {
            tracing::error!(index = snapshot.index, error = %e, "state machine failed to restore snapshot");
            self.fatal(Error::Shutdown);
            return;
        }

        self.configuration = snapshot.configuration.clone();
        self.committed_configuration = snapshot.configuration;
        self.configuration_index = snapshot.configuration_index;
        self.configuration_uncommitted_index = 0;

        tracing::info!(index = snapshot.index, "snapshot installed");
    }

    /// Stream our snapshot to the `i`-th server, whose log needs entries we
    /// compacted away.
    pub(crate) fn send_snapshot(&mut self, i: usize) -> Result<(), Error> {
        let target = match self.configuration.servers().get(i) {
            Some(s) => s.id,
            None => return Ok(()),
        };

        {
            let RoleState::Leader(leader) = &mut self.role else {
                return Ok(());
            };
            let Some(progress) = leader.progress.get_mut(i) else {
                return Ok(());
            };
            progress.state = ProgressState::Snapshot;
        }

        // One snapshot read at a time; this follower is retried on the
        // next heartbeat.
        if self.snapshot.get_target != 0 {
            return Ok(());
        }
        self.snapshot.get_target = target;

        if let Err(e) = self.io.snapshot_get() {
            self.snapshot.get_target = 0;
            return Err(e);
        }
        Ok(())
    }

    /// The snapshot read issued by [`Raft::send_snapshot`] completed.
    pub(crate) fn handle_snapshot_got(&mut self, result: Result<Snapshot, Error>) {
        let target = std::mem::take(&mut self.snapshot.get_target);
        if target == 0 {
            return;
        }

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read snapshot");
                return;
            }
        };

        if !matches!(self.role, RoleState::Leader(_)) {
            return;
        }
        // The server may have been removed in the meantime.
        let Some(server) = self.configuration.get(target) else {
            return;
        };
        let address = server.address.clone();

        tracing::info!(index = snapshot.index, target = target, "sending snapshot");

        let message = Message::InstallSnapshot(InstallSnapshotRequest {
            term: self.current_term,
            leader_id: self.id,
            last_index: snapshot.index,
            last_term: snapshot.term,
            configuration_index: snapshot.configuration_index,
            configuration: snapshot.configuration,
            data: snapshot.data,
        });
        if let Err(e) = self.io.send(target, &address, message) {
            tracing::warn!(target = target, error = %e, "failed to send snapshot");
        }
    }

    /// Receiver side of InstallSnapshot.
    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id, from = from))]
    pub(crate) fn handle_install_snapshot(&mut self, from: ServerId, req: InstallSnapshotRequest) {
        let _ = from;

        if req.term < self.current_term {
            let address = self.address_of(req.leader_id);
            self.respond_append_entries(req.leader_id, &address, false);
            return;
        }

        if req.term > self.current_term || !matches!(self.role, RoleState::Follower(_)) {
            if req.term == self.current_term && matches!(self.role, RoleState::Leader(_)) {
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

        // Busy taking or installing a snapshot; the leader keeps probing
        // and will try again.
        if self.snapshot.busy() {
            tracing::debug!("snapshot work in progress, ignoring install request");
            return;
        }

        // Our own snapshot is at least as recent: nothing to do.
        if self.snapshot.index >= req.last_index {
            self.respond_append_entries(req.leader_id, &leader_address, true);
            return;
        }

        // The log already holds everything the snapshot covers.
        let local_term = self.log.term_of(req.last_index);
        if local_term != 0 && local_term >= req.last_term {
            self.respond_append_entries(req.leader_id, &leader_address, true);
            return;
        }

        // Figure 5.3 steps 7-8: discard the entire log, persist the
        // snapshot, then reset the state machine from it.
        if let Err(e) = self.io.truncate(1) {
            tracing::warn!(error = %e, "storage truncate failed, dropping snapshot");
            return;
        }
        if self.log.n_entries() > 0 {
            let first_index = self.log.first_index();
            self.log.truncate(first_index);
        }
        self.last_stored = 0;

        let snapshot = Snapshot {
            index: req.last_index,
            term: req.last_term,
            configuration: req.configuration,
            configuration_index: req.configuration_index,
            data: req.data,
        };

        tracing::info!(index = snapshot.index, "installing snapshot");

        self.snapshot.installing = Some(snapshot.clone());
        if let Err(e) = self.io.snapshot_put(snapshot) {
            tracing::error!(error = %e, "failed to submit received snapshot");
            self.snapshot.installing = None;
            self.fatal(Error::Shutdown);
        }
    }
}
