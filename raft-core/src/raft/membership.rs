//! One-at-a-time membership change (§4.3 of the dissertation): servers join
//! as non-voters, catch up over bounded rounds, and are then promoted with
//! a configuration entry.

use crate::configuration::Configuration;
use crate::entry::Entry;
use crate::error::Error;
use crate::raft::RoleState;
use crate::Fsm;
use crate::Io;
use crate::LogIndex;
use crate::Raft;
use crate::ServerId;

impl<IO: Io, F: Fsm> Raft<IO, F> {
    /// Add a new server as a non-voter. Leader only; at most one
    /// configuration change may be in flight.
    pub fn add_server(&mut self, id: ServerId, address: impl Into<String>) -> Result<(), Error> {
        self.check_leader()?;
        if self.membership_change_in_progress() {
            return Err(Error::Busy);
        }

        let mut new_configuration = self.configuration.clone();
        new_configuration.add(id, address, false)?;

        tracing::info!(server = id, "adding server");
        self.append_configuration_change(new_configuration);
        Ok(())
    }

    /// Remove a server from the configuration. Removing ourselves is
    /// allowed: we keep replicating the entry and step down once it
    /// commits (§4.2.2).
    pub fn remove_server(&mut self, id: ServerId) -> Result<(), Error> {
        self.check_leader()?;
        if self.membership_change_in_progress() {
            return Err(Error::Busy);
        }

        let mut new_configuration = self.configuration.clone();
        new_configuration.remove(id)?;

        tracing::info!(server = id, "removing server");
        self.append_configuration_change(new_configuration);
        Ok(())
    }

    /// Start promoting a non-voting server to voter.
    ///
    /// The promotion waits until the server catches up with the log over at
    /// most `max_catch_up_rounds` rounds; only then is the configuration
    /// entry appended, so the new voter cannot endanger availability.
    pub fn promote(&mut self, id: ServerId) -> Result<(), Error> {
        self.check_leader()?;
        if self.membership_change_in_progress() {
            return Err(Error::Busy);
        }

        let server = self.configuration.get(id).ok_or_else(|| Error::BadConfig(format!("unknown server id {}", id)))?;
        if server.voting {
            return Err(Error::BadState);
        }

        let i = self.configuration.index_of(id).expect("server exists");
        let round_index = self.local_last_index();
        let match_index = match &self.role {
            RoleState::Leader(leader) => leader.progress.get(i).map(|p| p.match_index).unwrap_or(0),
            _ => 0,
        };

        if let RoleState::Leader(leader) = &mut self.role {
            leader.promotee_id = id;
            leader.round_number = 1;
            leader.round_index = round_index;
            leader.round_duration = 0;
            leader.catch_up_duration = 0;
        }

        tracing::info!(server = id, "starting promotion catch-up");

        if match_index >= round_index {
            // Already up to date; promote right away.
            self.trigger_promotion();
        } else {
            let _ = self.send_append_entries(i);
        }
        Ok(())
    }

    pub(crate) fn membership_change_in_progress(&self) -> bool {
        if self.configuration_uncommitted_index != 0 {
            return true;
        }
        match &self.role {
            RoleState::Leader(leader) => leader.promotee_id != 0,
            _ => false,
        }
    }

    /// Append a configuration entry and make it effective immediately; it
    /// reverts if truncated and becomes permanent when it commits.
    fn append_configuration_change(&mut self, new_configuration: Configuration) {
        let index = self.log.next_index();
        let old_configuration = std::mem::replace(&mut self.configuration, new_configuration);

        self.log.append_configuration(self.current_term, &self.configuration);
        self.configuration_uncommitted_index = index;
        self.rebuild_progress(&old_configuration);
        self.trigger_replication(index);
    }

    /// Re-shape the progress table after a configuration change, keeping
    /// what is known about surviving servers.
    fn rebuild_progress(&mut self, old_configuration: &Configuration) {
        let now = self.io.time();
        let next_index = self.local_last_index() + 1;
        let new_ids: Vec<ServerId> = self.configuration.servers().iter().map(|s| s.id).collect();

        if let RoleState::Leader(leader) = &mut self.role {
            let old_progress = std::mem::take(&mut leader.progress);
            leader.progress = new_ids
                .iter()
                .map(|id| {
                    old_configuration
                        .index_of(*id)
                        .and_then(|i| old_progress.get(i).cloned())
                        .unwrap_or_else(|| crate::progress::Progress::new(next_index, now))
                })
                .collect();
        }
    }

    /// The promotee finished replicating up to the current round's target.
    /// Returns true when it is time to append the promotion entry: either
    /// the server fully caught up, or the final round was fast enough
    /// (§4.2.1).
    pub(crate) fn update_catch_up_round(&mut self) -> bool {
        let promotee = match &self.role {
            RoleState::Leader(leader) => leader.promotee_id,
            _ => return false,
        };
        if promotee == 0 {
            return false;
        }
        let Some(i) = self.configuration.index_of(promotee) else {
            return false;
        };

        let last_index = self.local_last_index();
        let max_rounds = self.config.max_catch_up_rounds;
        let election_timeout = self.config.election_timeout;

        let RoleState::Leader(leader) = &mut self.role else {
            return false;
        };
        let match_index = leader.progress.get(i).map(|p| p.match_index).unwrap_or(0);

        if match_index < leader.round_index {
            // Still within the current round.
            return false;
        }

        if match_index >= last_index {
            tracing::info!(server = promotee, rounds = leader.round_number, "promotee caught up");
            return true;
        }

        if leader.round_number < max_rounds {
            leader.round_number += 1;
            leader.round_index = last_index;
            leader.round_duration = 0;
            return false;
        }

        // Out of rounds: promote anyway if the last one was quick, leaving
        // only a small unreplicated suffix; otherwise let the tick's abort
        // rules decide.
        leader.round_duration < election_timeout
    }

    /// Append the configuration entry that makes the promotee a voter.
    pub(crate) fn trigger_promotion(&mut self) {
        let promotee = match &self.role {
            RoleState::Leader(leader) => leader.promotee_id,
            _ => return,
        };
        if promotee == 0 {
            return;
        }

        let mut new_configuration = self.configuration.clone();
        match new_configuration.get_mut(promotee) {
            Some(server) => server.voting = true,
            None => return,
        }

        if let RoleState::Leader(leader) = &mut self.role {
            leader.promotee_id = 0;
            leader.round_number = 0;
            leader.round_index = 0;
            leader.round_duration = 0;
            leader.catch_up_duration = 0;
        }

        tracing::info!(server = promotee, "promoting server to voter");
        self.append_configuration_change(new_configuration);
    }

    /// A follower stored a configuration entry: it becomes effective
    /// immediately, but stays revocable until committed.
    pub(crate) fn store_uncommitted_configuration(&mut self, index: LogIndex, entry: &Entry) {
        match Configuration::decode(&entry.payload) {
            Ok(configuration) => {
                tracing::debug!(index = index, "new uncommitted configuration");
                self.configuration = configuration;
                self.configuration_uncommitted_index = index;
            }
            Err(e) => {
                tracing::error!(index = index, error = %e, "replicated configuration entry does not decode");
                self.fatal(Error::Shutdown);
            }
        }
    }

    /// Truncation is about to discard entries from `from_index` on; if the
    /// pending configuration is among them it must stop being effective.
    pub(crate) fn rollback_uncommitted_configuration(&mut self, from_index: LogIndex) {
        if self.configuration_uncommitted_index == 0 || self.configuration_uncommitted_index < from_index {
            return;
        }
        tracing::debug!(
            index = self.configuration_uncommitted_index,
            "rolling back uncommitted configuration"
        );
        self.configuration = self.committed_configuration.clone();
        self.configuration_uncommitted_index = 0;
    }

    /// A configuration entry committed.
    pub(crate) fn commit_configuration(&mut self, index: LogIndex) {
        if self.configuration_uncommitted_index == index {
            self.configuration_uncommitted_index = 0;
        }
        self.configuration_index = index;
        if self.configuration_uncommitted_index == 0 {
            self.committed_configuration = self.configuration.clone();
        }

        tracing::debug!(index = index, "configuration committed");

        // §4.2.2: a leader removed by the committed configuration steps
        // down once the entry commits.
        if matches!(self.role, RoleState::Leader(_)) && self.configuration.get(self.id).is_none() {
            tracing::info!(id = self.id, "no longer in the configuration, stepping down");
            self.convert_to_follower(self.current_term);
        }
    }
}
