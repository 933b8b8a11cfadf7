mod fixtures;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use dirraft::command::AccessLevel;
use dirraft::command::AclRule;
use dirraft::command::ConfigChange;
use dirraft::error::ApplyError;
use dirraft::sm::AclApplier;
use dirraft::sm::ConfigApplier;
use fixtures::DirRouter;
use maplit::btreemap;
use pretty_assertions::assert_eq;

#[derive(Default)]
struct Recorder {
    config_versions: Mutex<Vec<u64>>,
    acl_rule_ids: Mutex<Vec<u64>>,
}

impl ConfigApplier for Recorder {
    fn apply_config(&self, change: &ConfigChange) -> Result<(), ApplyError> {
        self.config_versions.lock().unwrap().push(change.version);
        Ok(())
    }
}

impl AclApplier for Recorder {
    fn apply_full_update(&self, rules: &[AclRule]) -> Result<(), ApplyError> {
        let mut ids = self.acl_rule_ids.lock().unwrap();
        ids.clear();
        ids.extend(rules.iter().map(|r| r.id));
        Ok(())
    }
    fn add_rule(&self, rule: &AclRule) -> Result<(), ApplyError> {
        self.acl_rule_ids.lock().unwrap().push(rule.id);
        Ok(())
    }
    fn update_rule(&self, _rule: &AclRule) -> Result<(), ApplyError> {
        Ok(())
    }
    fn delete_rule(&self, id: u64) -> Result<(), ApplyError> {
        self.acl_rule_ids.lock().unwrap().retain(|r| *r != id);
        Ok(())
    }
    fn set_default(&self, _access: AccessLevel) -> Result<(), ApplyError> {
        Ok(())
    }
}

/// Config and ACL updates proposed on the leader reach the registered
/// appliers on every node, in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn config_and_acl_updates_reach_every_applier() -> Result<()> {
    fixtures::init_tracing();

    let router = DirRouter::new_cluster(&[1, 2, 3]).await?;

    let mut recorders: BTreeMap<u64, Arc<Recorder>> = BTreeMap::new();
    for id in [1, 2, 3] {
        let recorder = Arc::new(Recorder::default());
        router.node(id).set_config_applier(recorder.clone());
        router.node(id).set_acl_applier(recorder.clone());
        recorders.insert(id, recorder);
    }

    let leader = router.wait_for_stable_leader(Duration::from_secs(2)).await?;

    router
        .node(leader)
        .propose_config_change(
            "limits",
            btreemap! { "max_connections".to_string() => "512".to_string() },
            7,
        )
        .await?;
    router
        .node(leader)
        .propose_acl_add_rule(AclRule {
            id: 1,
            target: "dc=x".into(),
            subject: "cn=admin,dc=x".into(),
            access: AccessLevel::Full,
        })
        .await?;
    router
        .node(leader)
        .propose_acl_add_rule(AclRule {
            id: 2,
            target: "ou=people,dc=x".into(),
            subject: "cn=ops,dc=x".into(),
            access: AccessLevel::Read,
        })
        .await?;
    router.node(leader).propose_acl_delete_rule(1).await?;

    // Noop + four commands.
    router.wait_for_applied(&[1, 2, 3], 5, Some(Duration::from_secs(2)), "all applied").await?;

    for (id, recorder) in &recorders {
        assert_eq!(*recorder.config_versions.lock().unwrap(), vec![7], "node {id} config");
        assert_eq!(*recorder.acl_rule_ids.lock().unwrap(), vec![2], "node {id} acl");
    }
    Ok(())
}
