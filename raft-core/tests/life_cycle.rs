//! Crash-restart behavior: persistent state survives, volatile state is
//! rebuilt through the protocol.

use anyhow::Result;
use pretty_assertions::assert_eq;
use raft_core::testing::Cluster;
use raft_core::testing::TestFsm;
use raft_core::State;

/// A restarted follower reloads its term and log, and re-applies committed
/// entries once the leader tells it the commit index again (the commit
/// index itself is volatile).
#[test]
fn restarted_follower_recovers() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);
    cluster.elect(0);

    cluster.propose(0, TestFsm::encode_add(1));
    let n = cluster.n();
    assert!(cluster.step_until_applied(n, 2, 10_000));
    assert_eq!(1, cluster.fsm(1).x());

    cluster.restart(1);

    // Persistent state came back, volatile state did not.
    assert_eq!(1, cluster.raft(1).current_term());
    assert_eq!(2, cluster.raft(1).log().last_index());
    assert_eq!(0, cluster.raft(1).commit_index());
    assert_eq!(0, cluster.fsm(1).x());

    // The leader's heartbeats re-deliver the commit index.
    assert!(cluster.step_until(|c| c.raft(1).last_applied() >= 2, 10_000));
    assert_eq!(1, cluster.fsm(1).x());
    Ok(())
}

/// The vote is durable: a restarted server still remembers who it voted
/// for in its current term.
#[test]
fn vote_survives_restart() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);
    cluster.elect(0);

    let candidate = cluster.id_of(0);
    assert_eq!(candidate, cluster.raft(1).voted_for());

    cluster.restart(1);

    assert_eq!(1, cluster.raft(1).current_term());
    assert_eq!(candidate, cluster.raft(1).voted_for());
    Ok(())
}

/// A crashed leader comes back as a follower and catches up with whoever
/// replaced it.
#[test]
fn crashed_leader_rejoins_as_follower() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);
    cluster.elect(0);

    cluster.propose(0, TestFsm::encode_add(2));
    let n = cluster.n();
    assert!(cluster.step_until_applied(n, 2, 10_000));

    cluster.kill(0);
    assert!(cluster.step_until(|c| matches!(c.leader_index(), Some(i) if i != 0), 30_000));
    let new_leader = cluster.leader_index().unwrap();

    cluster.restart(0);
    assert_eq!(State::Follower, cluster.raft(0).state());

    cluster.propose(new_leader, TestFsm::encode_add(3));
    assert!(cluster.step_until(|c| c.raft(0).fsm().x() == 5, 20_000));
    assert!(cluster.raft(0).current_term() >= 2);
    Ok(())
}
