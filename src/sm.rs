//! The replicated state machine: committed commands become engine state.

use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::BufMut;
use bytes::BytesMut;

use crate::command::AccessLevel;
use crate::command::AclRule;
use crate::command::Command;
use crate::command::ConfigChange;
use crate::command::DatabaseId;
use crate::command::DirEntry;
use crate::engine::EngineError;
use crate::engine::Scope;
use crate::engine::StorageEngine;
use crate::error::ApplyError;
use crate::error::WireError;
use crate::wire::Reader;

/// The seam between the Raft node and the application state.
///
/// `apply` is called sequentially in commit-index order, exactly once per
/// entry per node. `snapshot` must produce a view consistent with the
/// committed prefix at the time of the call; `restore` replaces the state
/// with a previously produced snapshot. The state machine never calls back
/// into the node.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    async fn apply(&self, cmd: Command) -> Result<(), ApplyError>;
    async fn snapshot(&self) -> Result<Vec<u8>, ApplyError>;
    async fn restore(&self, data: &[u8]) -> Result<(), ApplyError>;
}

/// Receiver for replicated configuration updates.
pub trait ConfigApplier: Send + Sync + 'static {
    fn apply_config(&self, change: &ConfigChange) -> Result<(), ApplyError>;
}

/// Receiver for replicated access-control mutations.
pub trait AclApplier: Send + Sync + 'static {
    fn apply_full_update(&self, rules: &[AclRule]) -> Result<(), ApplyError>;
    fn add_rule(&self, rule: &AclRule) -> Result<(), ApplyError>;
    fn update_rule(&self, rule: &AclRule) -> Result<(), ApplyError>;
    fn delete_rule(&self, id: u64) -> Result<(), ApplyError>;
    fn set_default(&self, access: AccessLevel) -> Result<(), ApplyError>;
}

impl From<EngineError> for ApplyError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoSuchEntry(dn) => ApplyError::NoSuchEntry(dn),
            EngineError::NotUnique { attr, .. } => ApplyError::NotUnique(attr),
            EngineError::InvalidEntry(msg) => ApplyError::InvalidEntry(msg),
            EngineError::Closed => ApplyError::Engine("engine is closed".into()),
        }
    }
}

/// The directory state machine.
///
/// Put/Delete/ModifyDN run against the main engine; commands tagged for the
/// log database are routed to the optional second engine and are no-ops
/// when none is configured. Config and ACL commands are decoded and handed
/// to the registered appliers, defaulting to skip so the core can apply
/// generic logs without dragging in the full server.
pub struct DirectoryStateMachine<E: StorageEngine> {
    main: Arc<E>,
    log_db: Option<Arc<E>>,
    config_applier: RwLock<Option<Arc<dyn ConfigApplier>>>,
    acl_applier: RwLock<Option<Arc<dyn AclApplier>>>,
}

impl<E: StorageEngine> DirectoryStateMachine<E> {
    pub fn new(main: Arc<E>) -> Self {
        Self {
            main,
            log_db: None,
            config_applier: RwLock::new(None),
            acl_applier: RwLock::new(None),
        }
    }

    /// Attach the optional log/audit engine.
    pub fn with_log_engine(mut self, engine: Arc<E>) -> Self {
        self.log_db = Some(engine);
        self
    }

    pub fn set_config_applier(&self, applier: Arc<dyn ConfigApplier>) {
        *self.config_applier.write().unwrap() = Some(applier);
    }

    pub fn set_acl_applier(&self, applier: Arc<dyn AclApplier>) {
        *self.acl_applier.write().unwrap() = Some(applier);
    }

    pub fn main_engine(&self) -> &Arc<E> {
        &self.main
    }

    fn engine_for(&self, db: DatabaseId) -> Option<&Arc<E>> {
        match db {
            DatabaseId::Main => Some(&self.main),
            DatabaseId::Log => self.log_db.as_ref(),
        }
    }

    fn put_entry(engine: &E, entry: DirEntry) -> Result<(), ApplyError> {
        let mut tx = engine.begin()?;
        if let Err(err) = engine.put(&mut tx, entry) {
            let _ = engine.rollback(tx);
            return Err(err.into());
        }
        engine.commit(tx)?;
        Ok(())
    }

    fn delete_entry(engine: &E, dn: &str) -> Result<(), ApplyError> {
        let mut tx = engine.begin()?;
        if let Err(err) = engine.delete(&mut tx, dn) {
            let _ = engine.rollback(tx);
            return Err(err.into());
        }
        engine.commit(tx)?;
        Ok(())
    }

    /// Delete the old DN and write the renamed entry in one transaction.
    fn modify_dn(engine: &E, old_dn: &str, entry: DirEntry) -> Result<(), ApplyError> {
        let mut tx = engine.begin()?;
        let staged = engine
            .delete(&mut tx, old_dn)
            .and_then(|_| engine.put(&mut tx, entry));
        if let Err(err) = staged {
            let _ = engine.rollback(tx);
            return Err(err.into());
        }
        engine.commit(tx)?;
        Ok(())
    }
}

#[async_trait]
impl<E: StorageEngine> StateMachine for DirectoryStateMachine<E> {
    #[tracing::instrument(level = "debug", skip(self, cmd))]
    async fn apply(&self, cmd: Command) -> Result<(), ApplyError> {
        match cmd {
            Command::Put { db, entry } => match self.engine_for(db) {
                Some(engine) => Self::put_entry(engine, entry),
                None => Ok(()),
            },
            Command::Delete { db, dn } => match self.engine_for(db) {
                Some(engine) => Self::delete_entry(engine, &dn),
                None => Ok(()),
            },
            Command::ModifyDn { old_dn, entry } => Self::modify_dn(&self.main, &old_dn, entry),
            Command::ConfigUpdate(change) => {
                match self.config_applier.read().unwrap().as_ref() {
                    Some(applier) => applier.apply_config(&change),
                    None => Ok(()),
                }
            }
            Command::AclFullUpdate(rules) => match self.acl_applier.read().unwrap().as_ref() {
                Some(applier) => applier.apply_full_update(&rules),
                None => Ok(()),
            },
            Command::AclAddRule(rule) => match self.acl_applier.read().unwrap().as_ref() {
                Some(applier) => applier.add_rule(&rule),
                None => Ok(()),
            },
            Command::AclUpdateRule(rule) => match self.acl_applier.read().unwrap().as_ref() {
                Some(applier) => applier.update_rule(&rule),
                None => Ok(()),
            },
            Command::AclDeleteRule(id) => match self.acl_applier.read().unwrap().as_ref() {
                Some(applier) => applier.delete_rule(id),
                None => Ok(()),
            },
            Command::AclSetDefault(access) => match self.acl_applier.read().unwrap().as_ref() {
                Some(applier) => applier.set_default(access),
                None => Ok(()),
            },
        }
    }

    /// Serialize the entire main engine:
    /// `count:u32 | (len:u32 | serializedEntry)*`.
    ///
    /// Log-DB, ACL and config state are restored from their own appliers'
    /// persisted state and are not part of this snapshot.
    async fn snapshot(&self) -> Result<Vec<u8>, ApplyError> {
        let mut tx = self.main.begin()?;
        let entries = self.main.search_by_dn(&mut tx, "", Scope::Subtree)?;
        self.main.rollback(tx)?;

        let mut buf = BytesMut::with_capacity(64 * entries.len() + 4);
        buf.put_u32_le(entries.len() as u32);
        for entry in &entries {
            let raw = entry.encode();
            buf.put_u32_le(raw.len() as u32);
            buf.put_slice(&raw);
        }
        Ok(buf.to_vec())
    }

    async fn restore(&self, data: &[u8]) -> Result<(), ApplyError> {
        let entries = decode_snapshot(data).map_err(|e| ApplyError::Codec(e.to_string()))?;

        // Drop whatever the engine currently holds; the snapshot is a
        // complete representation of main-engine state.
        let mut tx = self.main.begin()?;
        let existing = self.main.search_by_dn(&mut tx, "", Scope::Subtree)?;
        for entry in existing {
            self.main.delete(&mut tx, &entry.dn)?;
        }
        self.main.commit(tx)?;

        for entry in entries {
            Self::put_entry(&self.main, entry)?;
        }
        Ok(())
    }
}

fn decode_snapshot(data: &[u8]) -> Result<Vec<DirEntry>, WireError> {
    let mut r = Reader::new(data);
    let count = r.u32_le()?;
    let mut entries = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let raw = r.lp32_bytes()?;
        entries.push(DirEntry::decode(raw)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::engine::MemoryEngine;

    fn machine() -> DirectoryStateMachine<MemoryEngine> {
        DirectoryStateMachine::new(Arc::new(MemoryEngine::new()))
    }

    fn get(engine: &MemoryEngine, dn: &str) -> Option<DirEntry> {
        let mut tx = engine.begin().unwrap();
        let out = engine.get(&mut tx, dn).unwrap();
        engine.rollback(tx).unwrap();
        out
    }

    #[tokio::test]
    async fn put_then_delete() {
        let sm = machine();
        let entry = DirEntry::new("cn=a,dc=x").attr("cn", &["a"]);
        sm.apply(Command::Put { db: DatabaseId::Main, entry: entry.clone() }).await.unwrap();
        assert_eq!(get(sm.main_engine(), "cn=a,dc=x"), Some(entry));

        sm.apply(Command::Delete { db: DatabaseId::Main, dn: "cn=a,dc=x".into() }).await.unwrap();
        assert_eq!(get(sm.main_engine(), "cn=a,dc=x"), None);
    }

    #[tokio::test]
    async fn delete_of_missing_dn_surfaces_error() {
        let sm = machine();
        let err = sm
            .apply(Command::Delete { db: DatabaseId::Main, dn: "cn=ghost,dc=x".into() })
            .await
            .unwrap_err();
        assert_eq!(err, ApplyError::NoSuchEntry("cn=ghost,dc=x".into()));
    }

    #[tokio::test]
    async fn modify_dn_moves_entry_atomically() {
        let sm = machine();
        sm.apply(Command::Put {
            db: DatabaseId::Main,
            entry: DirEntry::new("cn=a,dc=x").attr("cn", &["a"]),
        })
        .await
        .unwrap();

        let renamed = DirEntry::new("cn=a,ou=people,dc=x").attr("cn", &["a"]);
        sm.apply(Command::ModifyDn { old_dn: "cn=a,dc=x".into(), entry: renamed.clone() })
            .await
            .unwrap();
        assert_eq!(get(sm.main_engine(), "cn=a,dc=x"), None);
        assert_eq!(get(sm.main_engine(), "cn=a,ou=people,dc=x"), Some(renamed));
    }

    #[tokio::test]
    async fn failed_modify_dn_rolls_back() {
        let sm = machine();
        sm.apply(Command::Put {
            db: DatabaseId::Main,
            entry: DirEntry::new("cn=a,dc=x").attr("cn", &["a"]),
        })
        .await
        .unwrap();

        // Old DN does not exist: the delete fails and the new entry must
        // not appear.
        let err = sm
            .apply(Command::ModifyDn {
                old_dn: "cn=missing,dc=x".into(),
                entry: DirEntry::new("cn=b,dc=x"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::NoSuchEntry(_)));
        assert_eq!(get(sm.main_engine(), "cn=b,dc=x"), None);
        assert!(get(sm.main_engine(), "cn=a,dc=x").is_some());
    }

    #[tokio::test]
    async fn log_db_commands_are_noops_without_second_engine() {
        let sm = machine();
        sm.apply(Command::Put { db: DatabaseId::Log, entry: DirEntry::new("cn=audit-1") })
            .await
            .unwrap();
        sm.apply(Command::Delete { db: DatabaseId::Log, dn: "cn=audit-1".into() }).await.unwrap();
        assert_eq!(get(sm.main_engine(), "cn=audit-1"), None);
    }

    #[tokio::test]
    async fn log_db_commands_route_to_second_engine() {
        let log_engine = Arc::new(MemoryEngine::new());
        let sm = DirectoryStateMachine::new(Arc::new(MemoryEngine::new()))
            .with_log_engine(log_engine.clone());
        sm.apply(Command::Put { db: DatabaseId::Log, entry: DirEntry::new("cn=audit-1") })
            .await
            .unwrap();
        assert!(get(&log_engine, "cn=audit-1").is_some());
        assert_eq!(get(sm.main_engine(), "cn=audit-1"), None);
    }

    #[tokio::test]
    async fn config_and_acl_commands_skip_without_appliers() {
        let sm = machine();
        sm.apply(Command::ConfigUpdate(ConfigChange {
            section: "limits".into(),
            version: 1,
            data: Default::default(),
        }))
        .await
        .unwrap();
        sm.apply(Command::AclSetDefault(AccessLevel::Read)).await.unwrap();
    }

    struct RecordingAcl {
        calls: Mutex<Vec<String>>,
    }

    impl AclApplier for RecordingAcl {
        fn apply_full_update(&self, rules: &[AclRule]) -> Result<(), ApplyError> {
            self.calls.lock().unwrap().push(format!("full:{}", rules.len()));
            Ok(())
        }
        fn add_rule(&self, rule: &AclRule) -> Result<(), ApplyError> {
            self.calls.lock().unwrap().push(format!("add:{}", rule.id));
            Ok(())
        }
        fn update_rule(&self, rule: &AclRule) -> Result<(), ApplyError> {
            self.calls.lock().unwrap().push(format!("update:{}", rule.id));
            Ok(())
        }
        fn delete_rule(&self, id: u64) -> Result<(), ApplyError> {
            self.calls.lock().unwrap().push(format!("delete:{id}"));
            Ok(())
        }
        fn set_default(&self, _access: AccessLevel) -> Result<(), ApplyError> {
            self.calls.lock().unwrap().push("default".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn acl_commands_dispatch_to_registered_applier() {
        let sm = machine();
        let acl = Arc::new(RecordingAcl { calls: Mutex::new(Vec::new()) });
        sm.set_acl_applier(acl.clone());

        let rule = AclRule {
            id: 7,
            target: "dc=x".into(),
            subject: "cn=admin,dc=x".into(),
            access: AccessLevel::Full,
        };
        sm.apply(Command::AclFullUpdate(vec![rule.clone()])).await.unwrap();
        sm.apply(Command::AclAddRule(rule.clone())).await.unwrap();
        sm.apply(Command::AclUpdateRule(rule)).await.unwrap();
        sm.apply(Command::AclDeleteRule(7)).await.unwrap();
        sm.apply(Command::AclSetDefault(AccessLevel::None)).await.unwrap();

        assert_eq!(
            *acl.calls.lock().unwrap(),
            vec!["full:1", "add:7", "update:7", "delete:7", "default"]
        );
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip_is_byte_identical() {
        let sm = machine();
        for n in 0..5 {
            sm.apply(Command::Put {
                db: DatabaseId::Main,
                entry: DirEntry::new(format!("cn=user{n},dc=x")).attr("uid", &[&format!("u{n}")]),
            })
            .await
            .unwrap();
        }
        let snap = sm.snapshot().await.unwrap();

        // Restoring into a fresh machine yields the same snapshot bytes.
        let other = machine();
        other.restore(&snap).await.unwrap();
        assert_eq!(other.snapshot().await.unwrap(), snap);

        // Restore replaces pre-existing state entirely.
        let dirty = machine();
        dirty
            .apply(Command::Put { db: DatabaseId::Main, entry: DirEntry::new("cn=stale,dc=x") })
            .await
            .unwrap();
        dirty.restore(&snap).await.unwrap();
        assert_eq!(get(dirty.main_engine(), "cn=stale,dc=x"), None);
        assert_eq!(dirty.snapshot().await.unwrap(), snap);
    }
}
