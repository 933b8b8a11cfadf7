mod fixtures;

use std::time::Duration;

use anyhow::Result;
use dirraft::error::ApplyError;
use dirraft::error::ClientWriteError;
use dirraft::DirEntry;
use fixtures::DirRouter;
use pretty_assertions::assert_eq;

/// The leader rejects a Put whose uid is already held by another DN before
/// anything reaches the log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_uid_is_rejected_before_append() -> Result<()> {
    fixtures::init_tracing();

    let router = DirRouter::new_cluster(&[1, 2, 3]).await?;
    let leader = router.wait_for_stable_leader(Duration::from_secs(2)).await?;

    router
        .node(leader)
        .put(DirEntry::new("cn=alice,dc=x").attr("uid", &["alice"]))
        .await?;

    let before = router.metrics_of(leader).await?.last_log_index;

    // Same uid, different DN; attribute-name case must not matter.
    let err = router
        .node(leader)
        .put(DirEntry::new("cn=impostor,dc=x").attr("UID", &["alice"]))
        .await
        .expect_err("duplicate uid must be rejected");
    match err {
        ClientWriteError::Apply(ApplyError::NotUnique(_)) => {}
        other => panic!("expected NotUnique, got {other:?}"),
    }

    // No log entry was appended for the rejected write.
    assert_eq!(router.metrics_of(leader).await?.last_log_index, before);
    assert_eq!(router.node(leader).get("cn=impostor,dc=x")?, None);

    // Re-putting the same DN with its own uid stays legal.
    router
        .node(leader)
        .put(DirEntry::new("cn=alice,dc=x").attr("uid", &["alice"]).attr("cn", &["alice"]))
        .await?;
    Ok(())
}
