//! The public cluster façade of the directory server.
//!
//! Writes route through the Raft leader and block until the corresponding
//! log entry is committed and applied, returning the apply result. Reads
//! are served from the local storage engine without consulting Raft and may
//! therefore observe stale state on a follower; callers that need
//! linearizable reads must route them through the leader.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::sync::Mutex;

use crate::command::AccessLevel;
use crate::command::AclRule;
use crate::command::Command;
use crate::command::ConfigChange;
use crate::command::DatabaseId;
use crate::command::DirEntry;
use crate::config::Config;
use crate::config::Peer;
use crate::core::State;
use crate::engine::EngineError;
use crate::engine::Scope;
use crate::engine::StorageEngine;
use crate::error::ApplyError;
use crate::error::ClientWriteError;
use crate::error::ConfigError;
use crate::error::RaftError;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::NetworkClient;
use crate::network::Transport;
use crate::raft::Raft;
use crate::sm::AclApplier;
use crate::sm::ConfigApplier;
use crate::sm::DirectoryStateMachine;
use crate::storage::RaftStore;
use crate::NodeId;

/// The concrete Raft type a cluster node runs.
pub type DirRaft<E, T> = Raft<NetworkClient<T>, DirectoryStateMachine<E>>;

/// Operator-facing status of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub node_id: NodeId,
    pub state: State,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub peers: Vec<Peer>,
}

struct Running<E: StorageEngine, T: Transport> {
    raft: DirRaft<E, T>,
}

/// One directory node: the Raft core wired to its storage engine, state
/// machine and transport.
pub struct DirectoryCluster<E: StorageEngine, T: Transport> {
    config: Arc<Config>,
    engine: Arc<E>,
    state_machine: Arc<DirectoryStateMachine<E>>,
    transport: Arc<T>,
    running: Mutex<Option<Running<E, T>>>,
}

impl<E: StorageEngine, T: Transport> DirectoryCluster<E, T> {
    /// Build a node over the main storage engine.
    pub fn new(config: Config, engine: Arc<E>, transport: Arc<T>) -> Result<Self, ConfigError> {
        let config = Arc::new(config.validate()?);
        let state_machine = Arc::new(DirectoryStateMachine::new(engine.clone()));
        Ok(Self { config, engine, state_machine, transport, running: Mutex::new(None) })
    }

    /// Build a node that also materializes log-database commands into a
    /// second engine.
    pub fn new_with_log_engine(
        config: Config,
        engine: Arc<E>,
        log_engine: Arc<E>,
        transport: Arc<T>,
    ) -> Result<Self, ConfigError> {
        let config = Arc::new(config.validate()?);
        let state_machine =
            Arc::new(DirectoryStateMachine::new(engine.clone()).with_log_engine(log_engine));
        Ok(Self { config, engine, state_machine, transport, running: Mutex::new(None) })
    }

    /// Register the collaborator that materializes replicated config
    /// updates.
    pub fn set_config_applier(&self, applier: Arc<dyn ConfigApplier>) {
        self.state_machine.set_config_applier(applier);
    }

    /// Register the collaborator that materializes replicated ACL changes.
    pub fn set_acl_applier(&self, applier: Arc<dyn AclApplier>) {
        self.state_machine.set_acl_applier(applier);
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Open persistent state, spawn the Raft node and start serving peer
    /// RPCs. Starting an already started node is a no-op.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let store = Arc::new(RaftStore::open(&self.config.data_dir)?);
        let network = Arc::new(NetworkClient::new(self.transport.clone()));
        let raft = Raft::new(self.config.clone(), network, store, self.state_machine.clone());
        self.transport.listen(&self.config.raft_addr, Arc::new(raft.clone())).await?;
        tracing::info!(id = self.config.node_id, addr = %self.config.raft_addr, "directory cluster node started");
        *running = Some(Running { raft });
        Ok(())
    }

    /// Stop the node: shut the Raft task down (releasing outstanding
    /// proposals), then tear down the transport. Stopping a stopped node is
    /// a no-op.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.take() {
            running.raft.shutdown().await?;
            self.transport.close().await;
            tracing::info!(id = self.config.node_id, "directory cluster node stopped");
        }
        Ok(())
    }

    async fn raft(&self) -> Result<DirRaft<E, T>, ClientWriteError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.raft.clone())
            .ok_or(ClientWriteError::Raft(RaftError::ShuttingDown))
    }

    //////////////////////////////////////////////////////////////////////////
    // Writes. All of them return `NotLeader` without side effect on a
    // non-leader and otherwise block until commit + local apply.

    /// Write a directory entry.
    pub async fn put(&self, entry: DirEntry) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        self.ensure_leader(&raft)?;
        self.ensure_uid_unique(&entry)?;
        raft.propose(Command::Put { db: DatabaseId::Main, entry }).await.map(|_| ())
    }

    /// Delete the entry at `dn`. Deleting a non-existent DN is an error.
    pub async fn delete(&self, dn: &str) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::Delete { db: DatabaseId::Main, dn: dn.to_string() })
            .await
            .map(|_| ())
    }

    /// Rename `old_dn` to the DN of `new_entry`, replacing its content, as
    /// one atomic transaction.
    pub async fn modify_dn(
        &self,
        old_dn: &str,
        new_entry: DirEntry,
    ) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::ModifyDn { old_dn: old_dn.to_string(), entry: new_entry })
            .await
            .map(|_| ())
    }

    /// Write an entry into the replicated log database.
    pub async fn put_log(&self, entry: DirEntry) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::Put { db: DatabaseId::Log, entry }).await.map(|_| ())
    }

    /// Delete an entry from the replicated log database.
    pub async fn delete_log(&self, dn: &str) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::Delete { db: DatabaseId::Log, dn: dn.to_string() })
            .await
            .map(|_| ())
    }

    /// Distribute a configuration update to every node.
    pub async fn propose_config_change(
        &self,
        section: &str,
        data: BTreeMap<String, String>,
        version: u64,
    ) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::ConfigUpdate(ConfigChange {
            section: section.to_string(),
            version,
            data,
        }))
        .await
        .map(|_| ())
    }

    /// Replace the full ACL rule set.
    pub async fn propose_acl_full_update(
        &self,
        rules: Vec<AclRule>,
    ) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::AclFullUpdate(rules)).await.map(|_| ())
    }

    pub async fn propose_acl_add_rule(&self, rule: AclRule) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::AclAddRule(rule)).await.map(|_| ())
    }

    pub async fn propose_acl_update_rule(&self, rule: AclRule) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::AclUpdateRule(rule)).await.map(|_| ())
    }

    pub async fn propose_acl_delete_rule(&self, id: u64) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::AclDeleteRule(id)).await.map(|_| ())
    }

    pub async fn propose_acl_set_default(
        &self,
        access: AccessLevel,
    ) -> Result<(), ClientWriteError> {
        let raft = self.raft().await?;
        raft.propose(Command::AclSetDefault(access)).await.map(|_| ())
    }

    //////////////////////////////////////////////////////////////////////////
    // Reads. Served locally, bypassing Raft.

    pub fn get(&self, dn: &str) -> Result<Option<DirEntry>, EngineError> {
        let mut tx = self.engine.begin()?;
        let out = self.engine.get(&mut tx, dn);
        let _ = self.engine.rollback(tx);
        out
    }

    pub fn search(&self, base_dn: &str, scope: Scope) -> Result<Vec<DirEntry>, EngineError> {
        let mut tx = self.engine.begin()?;
        let out = self.engine.search_by_dn(&mut tx, base_dn, scope);
        let _ = self.engine.rollback(tx);
        out
    }

    //////////////////////////////////////////////////////////////////////////
    // Observability.

    pub async fn status(&self) -> Result<Status, RaftError> {
        let raft = self.raft().await.map_err(|_| RaftError::ShuttingDown)?;
        let metrics = raft.metrics().borrow().clone();
        Ok(Status {
            node_id: metrics.id,
            state: metrics.state,
            term: metrics.current_term,
            leader_id: metrics.current_leader,
            leader_addr: metrics
                .current_leader
                .and_then(|id| self.config.peer_addr(id).map(String::from)),
            commit_index: metrics.commit_index,
            last_applied: metrics.last_applied,
            peers: self.config.peers.clone(),
        })
    }

    pub async fn metrics(&self) -> Result<watch::Receiver<RaftMetrics>, RaftError> {
        let raft = self.raft().await.map_err(|_| RaftError::ShuttingDown)?;
        Ok(raft.metrics())
    }

    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Wait, RaftError> {
        let raft = self.raft().await.map_err(|_| RaftError::ShuttingDown)?;
        Ok(raft.wait(timeout))
    }

    //////////////////////////////////////////////////////////////////////////
    // Leader-local pre-checks.

    fn ensure_leader(&self, raft: &DirRaft<E, T>) -> Result<(), ClientWriteError> {
        let metrics = raft.metrics().borrow().clone();
        if !metrics.state.is_leader() {
            return Err(ClientWriteError::NotLeader { leader_id: metrics.current_leader });
        }
        Ok(())
    }

    /// Reject a Put whose `uid` value is already held by an entry with a
    /// different DN. The scan runs on the leader's local engine before the
    /// command enters the log, so a rejected write appends nothing.
    fn ensure_uid_unique(&self, entry: &DirEntry) -> Result<(), ClientWriteError> {
        let uid_values = match entry.get_attr("uid") {
            Some(values) if !values.is_empty() => values.clone(),
            _ => return Ok(()),
        };
        let to_client = |err: EngineError| ClientWriteError::Apply(err.into());

        let mut tx = self.engine.begin().map_err(to_client)?;
        let all = self.engine.search_by_dn(&mut tx, "", Scope::Subtree).map_err(to_client)?;
        let _ = self.engine.rollback(tx);

        for existing in all {
            if existing.dn == entry.dn {
                continue;
            }
            let held = match existing.get_attr("uid") {
                Some(values) => values,
                None => continue,
            };
            if uid_values.iter().any(|candidate| held.iter().any(|v| v == candidate)) {
                return Err(ClientWriteError::Apply(ApplyError::NotUnique(format!(
                    "uid already in use by {}",
                    existing.dn
                ))));
            }
        }
        Ok(())
    }
}
