//! Snapshot scenarios: threshold-driven compaction on the leader and
//! snapshot installation on a hopelessly lagging follower.

use anyhow::Result;
use pretty_assertions::assert_eq;
use raft_core::testing::Cluster;
use raft_core::testing::TestFsm;
use raft_core::Config;
use raft_core::Entry;
use raft_core::EntryType;
use raft_core::Fsm;
use raft_core::Snapshot;

/// Crossing the snapshot threshold compacts the log down to the trailing
/// window, and the cluster keeps working afterwards.
#[test]
fn threshold_triggers_snapshot_and_compaction() -> Result<()> {
    let config = Config {
        snapshot_threshold: 8,
        snapshot_trailing: 2,
        ..Config::default()
    };
    let mut cluster = Cluster::with_config(3, config);
    let configuration = cluster.configuration(3);
    cluster.bootstrap(&configuration);
    cluster.start();
    cluster.elect(0);

    for _ in 0..10 {
        cluster.propose(0, TestFsm::encode_add(1));
    }
    let n = cluster.n();
    assert!(cluster.step_until_applied(n, 11, 20_000));

    assert!(cluster.step_until(|c| c.raft(0).snapshot_index() > 0, 5_000));
    let leader = cluster.raft(0);
    assert!(leader.snapshot_index() >= 8);
    assert!(
        leader.log().first_index() > 1,
        "the log prefix must have been compacted"
    );
    assert_eq!(11, leader.local_last_index());

    // The cluster still commits after compaction.
    cluster.propose(0, TestFsm::encode_add(1));
    assert!(cluster.step_until_applied(n, 12, 10_000));
    for i in 0..3 {
        assert_eq!(11, cluster.fsm(i).x());
    }
    Ok(())
}

/// A follower whose log ends far behind the leader's snapshot gets the
/// snapshot installed: empty log, restored state machine, commit index at
/// the snapshot.
#[test]
fn install_snapshot_on_lagging_follower() -> Result<()> {
    let mut cluster = Cluster::new(2);
    let configuration = cluster.configuration(2);

    // The leader-to-be holds a snapshot at index 50 and nothing else; its
    // state machine value is 123.
    let mut donor = TestFsm::new();
    donor.apply(&TestFsm::encode_add(123)).unwrap();
    cluster.set_term(0, 2);
    cluster.set_snapshot(
        0,
        Snapshot {
            index: 50,
            term: 2,
            configuration: configuration.clone(),
            configuration_index: 1,
            data: donor.snapshot().unwrap(),
        },
    );

    // The follower's log reaches only index 10.
    let mut entries = vec![Entry {
        term: 1,
        typ: EntryType::Configuration,
        payload: configuration.encode(),
    }];
    for _ in 2..=10 {
        entries.push(Entry::new_command(1, TestFsm::encode_add(1)));
    }
    cluster.set_term(1, 1);
    cluster.set_entries(1, 1, entries);

    cluster.start();
    cluster.elect(0);

    assert!(cluster.step_until(
        |c| c.raft(1).snapshot_index() == 50 && c.raft(1).last_applied() == 50,
        20_000
    ));

    let follower = cluster.raft(1);
    assert_eq!(0, follower.log().n_entries(), "the old log must be gone");
    assert_eq!(50, follower.snapshot_index());
    assert!(follower.commit_index() >= 50);
    assert_eq!(123, cluster.fsm(1).x());
    assert_eq!(1, cluster.fsm(1).n_restored());
    Ok(())
}
