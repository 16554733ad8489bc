//! Client-facing requests: proposing commands and barriers.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::entry::EntryType;
use crate::error::Error;
use crate::raft::RoleState;
use crate::Fsm;
use crate::Io;
use crate::Raft;

impl<IO: Io, F: Fsm> Raft<IO, F> {
    /// Propose a command for replication.
    ///
    /// The returned receiver fires `Ok(())` once the entry is committed and
    /// applied to the local state machine, [`Error::NotLeader`] if
    /// leadership is lost first, or [`Error::Canceled`] on shutdown.
    pub fn apply(&mut self, payload: Bytes) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        self.propose(EntryType::Command, payload)
    }

    /// Append a barrier entry: carries no command, but its completion
    /// guarantees every earlier entry has been applied.
    pub fn barrier(&mut self) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        self.propose(EntryType::Barrier, Bytes::new())
    }

    fn propose(&mut self, typ: EntryType, payload: Bytes) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        self.check_leader()?;

        let index = self.log.next_index();
        self.log.append(self.current_term, typ, payload);

        let (responder, receiver) = oneshot::channel();
        if let RoleState::Leader(leader) = &mut self.role {
            leader.apply_reqs.insert(index, responder);
        }

        tracing::debug!(index = index, "proposed entry");

        self.trigger_replication(index);
        Ok(receiver)
    }

    pub(crate) fn check_leader(&self) -> Result<(), Error> {
        match self.role {
            RoleState::Unavailable => Err(Error::Canceled),
            RoleState::Leader(_) => Ok(()),
            _ => Err(Error::NotLeader),
        }
    }
}
