//! Leader election: starting elections, granting votes, tallying results.

use crate::error::Error;
use crate::message::Message;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::raft::RoleState;
use crate::Fsm;
use crate::Io;
use crate::Raft;
use crate::ServerId;

impl<IO: Io, F: Fsm> Raft<IO, F> {
    /// Zero the timer and draw a fresh randomized election timeout from
    /// `[election_timeout, 2 * election_timeout)`.
    pub(crate) fn reset_election_timer(&mut self) {
        let timeout = self.config.election_timeout;
        self.election_timeout_rand = self.io.random(timeout, 2 * timeout);
        self.timer = 0;
    }

    /// Start a new election: bump the term, vote for ourselves and request
    /// votes from every other voter.
    ///
    /// Term and vote are durable before anything is sent (Figure 3.1,
    /// persistent state).
    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id))]
    pub(crate) fn start_election(&mut self) -> Result<(), Error> {
        debug_assert!(matches!(self.role, RoleState::Candidate(_)));

        let term = self.current_term + 1;
        self.io.set_term(term)?;
        self.io.set_vote(self.id)?;
        self.current_term = term;
        self.voted_for = self.id;

        self.reset_election_timer();

        let n_voting = self.configuration.n_voting();
        let my_slot = self.configuration.index_of_voting(self.id);
        let quorum = self.configuration.quorum();
        if let RoleState::Candidate(candidate) = &mut self.role {
            candidate.votes = vec![false; n_voting];
            if let Some(slot) = my_slot {
                candidate.votes[slot] = true;
            }
        }

        tracing::info!(id = self.id, term = term, "starting election");

        // A single-voter cluster wins right here.
        if self.count_votes() >= quorum {
            self.convert_to_leader();
            return Ok(());
        }

        let last_log_index = self.local_last_index();
        let last_log_term = self.local_last_term();
        let peers: Vec<(ServerId, String)> = self
            .configuration
            .servers()
            .iter()
            .filter(|s| s.voting && s.id != self.id)
            .map(|s| (s.id, s.address.clone()))
            .collect();

        for (peer, address) in peers {
            let request = Message::RequestVote(VoteRequest {
                term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
            });
            if let Err(e) = self.io.send(peer, &address, request) {
                // Not critical; the peer is probed again next election.
                tracing::warn!(peer = peer, error = %e, "failed to send vote request");
            }
        }
        Ok(())
    }

    fn count_votes(&self) -> usize {
        match &self.role {
            RoleState::Candidate(c) => c.votes.iter().filter(|v| **v).count(),
            _ => 0,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id, from = from))]
    pub(crate) fn handle_vote_request(&mut self, from: ServerId, req: VoteRequest) {
        if req.term > self.current_term {
            self.convert_to_follower(req.term);
        }

        let vote_granted = if req.term < self.current_term {
            tracing::debug!(term = req.term, "stale term, not granting vote");
            false
        } else {
            self.decide_vote(&req)
        };

        let response = Message::RequestVoteResult(VoteResponse {
            term: self.current_term,
            vote_granted,
        });
        let address = self.address_of(from);
        if let Err(e) = self.io.send(from, &address, response) {
            tracing::debug!(error = %e, "failed to send vote response");
        }
    }

    /// Decide a vote request at the current term (§3.6.1): we must be a
    /// voter, must not have voted for someone else, and the candidate's log
    /// must be at least as up-to-date as ours.
    fn decide_vote(&mut self, req: &VoteRequest) -> bool {
        let voting = self.configuration.get(self.id).map(|s| s.voting).unwrap_or(false);
        if !voting {
            tracing::debug!("local server is not voting, not granting vote");
            return false;
        }

        if self.voted_for != 0 && self.voted_for != req.candidate_id {
            tracing::debug!(voted_for = self.voted_for, "already voted, not granting vote");
            return false;
        }

        let last_log_index = self.local_last_index();
        let last_log_term = self.local_last_term();

        // An empty local log is never more up-to-date.
        let up_to_date = if last_log_index == 0 {
            true
        } else if req.last_log_term != last_log_term {
            req.last_log_term > last_log_term
        } else {
            req.last_log_index >= last_log_index
        };
        if !up_to_date {
            tracing::debug!("local log is more up-to-date, not granting vote");
            return false;
        }

        if let Err(e) = self.io.set_vote(req.candidate_id) {
            tracing::warn!(error = %e, "failed to persist vote");
            return false;
        }
        self.voted_for = req.candidate_id;
        self.timer = 0;

        tracing::debug!(candidate = req.candidate_id, "vote granted");
        true
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = self.id, from = from))]
    pub(crate) fn handle_vote_response(&mut self, from: ServerId, res: VoteResponse) {
        if res.term > self.current_term {
            self.convert_to_follower(res.term);
            return;
        }
        if res.term < self.current_term {
            return;
        }
        if !res.vote_granted {
            return;
        }

        let slot = match self.configuration.index_of_voting(from) {
            Some(slot) => slot,
            None => return,
        };
        let quorum = self.configuration.quorum();

        let RoleState::Candidate(candidate) = &mut self.role else {
            // A delayed response; the election is already over.
            return;
        };
        if let Some(vote) = candidate.votes.get_mut(slot) {
            *vote = true;
        }

        if self.count_votes() >= quorum {
            tracing::debug!("quorum of votes granted");
            self.convert_to_leader();
        }
    }
}
