mod fixtures;

use std::time::Duration;

use anyhow::Result;
use dirraft::State;
use fixtures::DirRouter;
use pretty_assertions::assert_eq;

/// Bring up a three node cluster and watch it elect.
///
/// Within 3x the election timeout exactly one node reports itself leader,
/// all three agree on the term, and both followers report the leader's id
/// and address in their status.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initial_leader_election() -> Result<()> {
    fixtures::init_tracing();

    let router = DirRouter::new_cluster(&[1, 2, 3]).await?;
    let election_timeout = Duration::from_millis(150);

    let leader = router.wait_for_stable_leader(3 * election_timeout).await?;

    let leader_metrics = router.metrics_of(leader).await?;
    assert_eq!(leader_metrics.state, State::Leader);

    let mut leader_count = 0;
    for id in [1, 2, 3] {
        let status = router.node(id).status().await?;
        assert_eq!(status.term, leader_metrics.current_term, "node {id} term");
        assert_eq!(status.leader_id, Some(leader), "node {id} leader id");
        if status.state == State::Leader {
            leader_count += 1;
            assert_eq!(status.node_id, leader);
        } else {
            assert_eq!(status.state, State::Follower);
            assert_eq!(
                status.leader_addr.as_deref(),
                Some(format!("mem://node-{leader}").as_str()),
                "node {id} leader addr"
            );
        }
    }
    assert_eq!(leader_count, 1);

    Ok(())
}

/// A cluster of one elects itself without any peers to talk to.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_cluster_elects_itself() -> Result<()> {
    fixtures::init_tracing();

    let router = DirRouter::new_cluster(&[1]).await?;
    let leader = router.wait_for_stable_leader(Duration::from_secs(2)).await?;
    assert_eq!(leader, 1);

    // The term-establishing noop commits immediately.
    router.wait(1, Some(Duration::from_secs(1))).await?.applied(1, "noop applied").await?;
    Ok(())
}
