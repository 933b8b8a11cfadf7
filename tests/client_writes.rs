mod fixtures;

use std::time::Duration;

use anyhow::Result;
use dirraft::error::ClientWriteError;
use dirraft::DirEntry;
use fixtures::DirRouter;
use pretty_assertions::assert_eq;

/// A write through the leader becomes visible on every node's local engine.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_replicates_to_all_nodes() -> Result<()> {
    fixtures::init_tracing();

    let router = DirRouter::new_cluster(&[1, 2, 3]).await?;
    let leader = router.wait_for_stable_leader(Duration::from_secs(2)).await?;

    let entry = DirEntry::new("cn=a,dc=x").attr("cn", &["a"]);
    router.node(leader).put(entry.clone()).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    for id in [1, 2, 3] {
        assert_eq!(
            router.node(id).get("cn=a,dc=x")?,
            Some(entry.clone()),
            "node {id} read"
        );
        let status = router.node(id).status().await?;
        // Noop at index 1, the put at index 2.
        assert!(status.commit_index >= 2, "node {id} commit_index = {}", status.commit_index);
    }
    Ok(())
}

/// Writes against a follower fail fast with NotLeader and leave no trace.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_rejects_writes_without_side_effect() -> Result<()> {
    fixtures::init_tracing();

    let router = DirRouter::new_cluster(&[1, 2, 3]).await?;
    let leader = router.wait_for_stable_leader(Duration::from_secs(2)).await?;
    let follower = [1, 2, 3].into_iter().find(|id| *id != leader).unwrap();

    let before = router.metrics_of(leader).await?.last_log_index;

    let err = router
        .node(follower)
        .put(DirEntry::new("cn=nope,dc=x"))
        .await
        .expect_err("follower must reject the write");
    match err {
        ClientWriteError::NotLeader { leader_id } => assert_eq!(leader_id, Some(leader)),
        other => panic!("expected NotLeader, got {other:?}"),
    }

    assert_eq!(router.metrics_of(leader).await?.last_log_index, before);
    assert_eq!(router.node(follower).get("cn=nope,dc=x")?, None);
    Ok(())
}

/// A burst of writes lands on every node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_puts_replicate_everywhere() -> Result<()> {
    fixtures::init_tracing();

    let router = DirRouter::new_cluster(&[1, 2, 3]).await?;
    let leader = router.wait_for_stable_leader(Duration::from_secs(2)).await?;

    for n in 0..10 {
        let entry = DirEntry::new(format!("cn=user{n},dc=x")).attr("cn", &[&format!("user{n}")]);
        router.node(leader).put(entry).await?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    for id in [1, 2, 3] {
        let status = router.node(id).status().await?;
        assert!(
            status.last_applied >= 11 && status.commit_index >= 10,
            "node {id}: commit_index={}, last_applied={}",
            status.commit_index,
            status.last_applied
        );
        let metrics = router.metrics_of(id).await?;
        assert!(metrics.last_log_index >= 11, "node {id} last_log_index");
        for n in 0..10 {
            assert!(router.node(id).get(&format!("cn=user{n},dc=x"))?.is_some());
        }
    }
    Ok(())
}

/// Delete and ModifyDN flow through the same pipeline, and business errors
/// surface to the proposer.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_and_modify_dn() -> Result<()> {
    fixtures::init_tracing();

    let router = DirRouter::new_cluster(&[1, 2, 3]).await?;
    let leader = router.wait_for_stable_leader(Duration::from_secs(2)).await?;

    router.node(leader).put(DirEntry::new("cn=a,dc=x").attr("cn", &["a"])).await?;
    router
        .node(leader)
        .modify_dn("cn=a,dc=x", DirEntry::new("cn=a,ou=people,dc=x").attr("cn", &["a"]))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    for id in [1, 2, 3] {
        assert_eq!(router.node(id).get("cn=a,dc=x")?, None, "node {id} old dn");
        assert!(router.node(id).get("cn=a,ou=people,dc=x")?.is_some(), "node {id} new dn");
    }

    // Deleting a DN that never existed is a deterministic rejection.
    let err = router.node(leader).delete("cn=ghost,dc=x").await.expect_err("must fail");
    assert!(matches!(err, ClientWriteError::Apply(_)), "got {err:?}");

    router.node(leader).delete("cn=a,ou=people,dc=x").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    for id in [1, 2, 3] {
        assert_eq!(router.node(id).get("cn=a,ou=people,dc=x")?, None, "node {id} deleted");
    }
    Ok(())
}
