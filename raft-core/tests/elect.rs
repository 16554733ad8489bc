//! Leader election scenarios driven through the cluster fixture.

use anyhow::Result;
use pretty_assertions::assert_eq;
use raft_core::testing::Cluster;
use raft_core::State;

/// Three empty voters; the server whose timeout fires first wins term 1.
#[test]
fn elect_first_of_three() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);

    cluster.elect(0);

    assert_eq!(Some(0), cluster.leader_index());
    assert_eq!(State::Leader, cluster.raft(0).state());
    assert_eq!(1, cluster.raft(0).current_term());
    assert_eq!(State::Follower, cluster.raft(1).state());
    assert_eq!(State::Follower, cluster.raft(2).state());

    // The election must conclude within two election timeouts.
    assert!(cluster.time() <= 2_000, "election took {} ms", cluster.time());
    Ok(())
}

/// Followers recognize the elected leader.
#[test]
fn followers_learn_the_leader() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);
    cluster.elect(1);

    let leader_id = cluster.id_of(1);
    assert_eq!(Some(leader_id), cluster.raft(0).current_leader());
    assert_eq!(Some(leader_id), cluster.raft(2).current_leader());
    Ok(())
}

/// Depose the leader, then elect another server at a higher term.
#[test]
fn election_change() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 3);

    cluster.elect(0);
    assert_eq!(1, cluster.raft(0).current_term());

    cluster.depose();
    assert_eq!(State::Follower, cluster.raft(0).state());

    cluster.elect(2);

    assert_eq!(Some(2), cluster.leader_index());
    assert!(
        cluster.raft(2).current_term() > 1,
        "the new leadership must use a higher term"
    );
    Ok(())
}

/// A non-voter never starts elections; a cluster of one voter elects
/// itself.
#[test]
fn single_voter_elects_itself() -> Result<()> {
    let mut cluster = Cluster::bootstrapped(3, 1);

    assert!(cluster.step_until_has_leader(30_000));
    assert_eq!(Some(0), cluster.leader_index());
    assert_eq!(State::Follower, cluster.raft(1).state());
    assert_eq!(State::Follower, cluster.raft(2).state());
    Ok(())
}
