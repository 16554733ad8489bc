//! Time-dependent rules for each role (Figure 3.1).

use crate::raft::RoleState;
use crate::Fsm;
use crate::Io;
use crate::Raft;
use crate::State;

impl<IO: Io, F: Fsm> Raft<IO, F> {
    /// Consume the monotonic time elapsed since the previous tick and apply
    /// the current role's timing rules.
    pub fn tick(&mut self) {
        if matches!(self.role, RoleState::Unavailable) {
            return;
        }

        let now = self.io.time();
        let elapsed = now.saturating_sub(self.last_tick);
        self.timer += elapsed;
        self.last_tick = now;

        match self.state() {
            State::Follower => self.follower_tick(),
            State::Candidate => self.candidate_tick(),
            State::Leader => self.leader_tick(elapsed),
            State::Unavailable => {}
        }
    }

    /// Milliseconds until the role's relevant timeout has strictly elapsed.
    pub fn next_timeout(&self) -> u64 {
        let timeout = if matches!(self.role, RoleState::Leader(_)) {
            self.config.heartbeat_timeout
        } else {
            self.election_timeout_rand
        };
        timeout.saturating_sub(self.timer) + 1
    }

    /// §3.3: without communication for an election timeout, a voting
    /// follower assumes there is no viable leader and starts an election.
    fn follower_tick(&mut self) {
        let voting = match self.configuration.get(self.id) {
            // Removed from the configuration, or none received yet: just
            // stay a follower.
            None => return,
            Some(server) => server.voting,
        };

        if voting && self.timer > self.election_timeout_rand {
            tracing::info!(id = self.id, "election timeout, converting to candidate");
            self.convert_to_candidate();
        }
    }

    /// §3.4: a split vote resolves by timing out and starting a new
    /// election with a higher term.
    fn candidate_tick(&mut self) {
        if self.timer > self.election_timeout_rand {
            tracing::info!(id = self.id, "election timeout, starting new election");
            if let Err(e) = self.start_election() {
                tracing::warn!(error = %e, "failed to start election, will retry");
            }
        }
    }

    fn leader_tick(&mut self, elapsed: u64) {
        // §6.2: a leader steps down if an election timeout elapses without
        // contact from a majority, so clients can retry elsewhere.
        if !self.contacted_by_majority() {
            tracing::warn!(id = self.id, "unable to contact a majority of the cluster, stepping down");
            self.convert_to_follower(self.current_term);
            return;
        }

        if self.timer > self.config.heartbeat_timeout {
            self.trigger_replication(0);
        }

        self.promotion_tick(elapsed);
    }

    /// Whether a majority of voters contacted us within one election
    /// timeout. We always count ourselves.
    fn contacted_by_majority(&self) -> bool {
        let now = self.last_tick;
        let RoleState::Leader(leader) = &self.role else {
            return false;
        };

        let mut contacts = 0;
        for (i, server) in self.configuration.servers().iter().enumerate() {
            if !server.voting {
                continue;
            }
            if server.id == self.id {
                contacts += 1;
                continue;
            }
            let silence = leader.progress.get(i).map(|p| now.saturating_sub(p.last_contact)).unwrap_or(u64::MAX);
            if silence <= self.config.election_timeout {
                contacts += 1;
            }
        }

        contacts > self.configuration.n_voting() / 2
    }

    /// §4.2.1: account the current catch-up round and abort the promotion
    /// when the promotee is too slow or unresponsive.
    fn promotion_tick(&mut self, elapsed: u64) {
        let max_rounds = self.config.max_catch_up_rounds;
        let election_timeout = self.config.election_timeout;
        let max_duration = self.config.max_catch_up_duration;

        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        if leader.promotee_id == 0 {
            return;
        }

        leader.round_duration += elapsed;
        leader.catch_up_duration += elapsed;

        let too_slow = leader.round_number >= max_rounds && leader.round_duration > election_timeout;
        let unresponsive = leader.catch_up_duration > max_duration;

        if too_slow || unresponsive {
            let id = leader.promotee_id;
            leader.promotee_id = 0;
            leader.round_number = 0;
            leader.round_index = 0;
            leader.round_duration = 0;
            leader.catch_up_duration = 0;
            tracing::warn!(
                promotee = id,
                too_slow = too_slow,
                unresponsive = unresponsive,
                "aborting promotion"
            );
        }
    }
}
