//! Committing client commands across the cluster.

use anyhow::Result;
use pretty_assertions::assert_eq;
use raft_core::testing::Cluster;
use raft_core::testing::TestFsm;

/// One command, applied by every state machine.
#[test]
fn apply_single_command() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);
    cluster.elect(0);

    let mut receiver = cluster.propose(0, TestFsm::encode_add(1));

    let n = cluster.n();
    assert!(cluster.step_until_applied(n, 2, 10_000));

    for i in 0..3 {
        assert_eq!(2, cluster.raft(i).last_applied());
        assert_eq!(1, cluster.fsm(i).x());
    }
    assert_eq!(Ok(()), receiver.try_recv()?);
    Ok(())
}

/// Two commands submitted back to back commit in order.
#[test]
fn apply_two_commands() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);
    cluster.elect(0);

    let _first = cluster.propose(0, TestFsm::encode_add(1));
    let _second = cluster.propose(0, TestFsm::encode_add(1));

    let n = cluster.n();
    assert!(cluster.step_until_applied(n, 3, 10_000));

    for i in 0..3 {
        assert_eq!(3, cluster.raft(i).last_applied());
        assert_eq!(2, cluster.fsm(i).x());
        assert_eq!(2, cluster.fsm(i).n_applied());
    }
    Ok(())
}

/// A proposal made on a follower is refused.
#[test]
fn propose_on_follower_fails() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);
    cluster.elect(0);

    let result = cluster.raft_mut(1).apply(TestFsm::encode_add(1));
    assert_eq!(Err(raft_core::Error::NotLeader), result.map(|_| ()));
    Ok(())
}

/// A barrier completes once everything before it is applied, without
/// touching the state machine.
#[test]
fn barrier_flushes_the_pipeline() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);
    cluster.elect(0);

    let _write = cluster.propose(0, TestFsm::encode_add(7));
    let mut barrier = cluster.raft_mut(0).barrier().unwrap();

    assert!(cluster.step_until(|_c| barrier.try_recv().is_ok(), 10_000));
    assert_eq!(7, cluster.fsm(0).x());
    assert_eq!(1, cluster.fsm(0).n_applied());
    Ok(())
}
