//! Fixtures for testing the directory cluster.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use dirraft::cluster::DirectoryCluster;
use dirraft::config::Config;
use dirraft::config::Peer;
use dirraft::engine::MemoryEngine;
use dirraft::metrics::RaftMetrics;
use dirraft::metrics::Wait;
use dirraft::network::MemHub;
use dirraft::network::MemTransport;
use dirraft::NodeId;
use dirraft::State;
use tempfile::TempDir;
use tracing_subscriber::prelude::*;

/// A concrete cluster node type used during testing.
pub type DirCluster = DirectoryCluster<MemoryEngine, MemTransport>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub struct Builder {
    node_ids: Vec<NodeId>,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    snapshot_interval: u64,
}

impl Builder {
    pub fn election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn snapshot_interval(mut self, threshold: u64) -> Self {
        self.snapshot_interval = threshold;
        self
    }

    pub fn build(self) -> Arc<DirRouter> {
        let root = tempfile::tempdir().expect("failed to create cluster temp dir");
        Arc::new(DirRouter {
            node_ids: self.node_ids,
            election_timeout: self.election_timeout,
            heartbeat_interval: self.heartbeat_interval,
            snapshot_interval: self.snapshot_interval,
            hub: MemHub::new(),
            nodes: Mutex::new(BTreeMap::new()),
            engines: Mutex::new(BTreeMap::new()),
            root,
        })
    }
}

/// A cluster of in-process directory nodes wired over a [`MemHub`].
pub struct DirRouter {
    node_ids: Vec<NodeId>,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    snapshot_interval: u64,
    hub: Arc<MemHub>,
    nodes: Mutex<BTreeMap<NodeId, Arc<DirCluster>>>,
    /// Engines survive node restarts (the production engine is durable);
    /// `wipe_node` replaces them.
    engines: Mutex<BTreeMap<NodeId, Arc<MemoryEngine>>>,
    root: TempDir,
}

impl DirRouter {
    pub fn builder(node_ids: &[NodeId]) -> Builder {
        Builder {
            node_ids: node_ids.to_vec(),
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            snapshot_interval: 0,
        }
    }

    /// Build and start a full cluster.
    pub async fn new_cluster(node_ids: &[NodeId]) -> Result<Arc<Self>> {
        let router = Self::builder(node_ids).build();
        router.start_all().await?;
        Ok(router)
    }

    pub async fn start_all(&self) -> Result<()> {
        for id in self.node_ids.clone() {
            self.start_node(id).await?;
        }
        Ok(())
    }

    fn config_for(&self, id: NodeId) -> Config {
        let peers = self
            .node_ids
            .iter()
            .map(|id| Peer { id: *id, addr: format!("mem://node-{id}") })
            .collect();
        let mut config = Config::new(
            id,
            format!("mem://node-{id}"),
            peers,
            self.root.path().join(format!("node-{id}")),
        );
        config.election_timeout = self.election_timeout;
        config.heartbeat_interval = self.heartbeat_interval;
        config.snapshot_interval = self.snapshot_interval;
        config
    }

    /// Start (or restart) the node with the given id, reusing its engine
    /// and data dir.
    pub async fn start_node(&self, id: NodeId) -> Result<()> {
        let engine = self
            .engines
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(MemoryEngine::new()))
            .clone();
        let transport = self.hub.transport(id);
        let cluster = Arc::new(
            DirCluster::new(self.config_for(id), engine, transport)
                .map_err(|e| anyhow!("config rejected: {e}"))?,
        );
        cluster.start().await?;
        self.nodes.lock().unwrap().insert(id, cluster);
        Ok(())
    }

    /// Stop a node, keeping its data dir and engine for a later restart.
    pub async fn stop_node(&self, id: NodeId) -> Result<()> {
        let node = self.nodes.lock().unwrap().remove(&id);
        let node = node.with_context(|| format!("node {id} is not running"))?;
        node.stop().await?;
        Ok(())
    }

    /// Erase a stopped node's persistent state and engine, as if its disk
    /// were replaced.
    pub fn wipe_node(&self, id: NodeId) -> Result<()> {
        if self.nodes.lock().unwrap().contains_key(&id) {
            return Err(anyhow!("cannot wipe running node {id}"));
        }
        let dir = self.root.path().join(format!("node-{id}"));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.engines.lock().unwrap().insert(id, Arc::new(MemoryEngine::new()));
        Ok(())
    }

    pub fn data_dir(&self, id: NodeId) -> PathBuf {
        self.root.path().join(format!("node-{id}"))
    }

    pub fn node(&self, id: NodeId) -> Arc<DirCluster> {
        self.nodes
            .lock()
            .unwrap()
            .get(&id)
            .unwrap_or_else(|| panic!("node {id} is not running"))
            .clone()
    }

    pub fn running_ids(&self) -> Vec<NodeId> {
        self.nodes.lock().unwrap().keys().copied().collect()
    }

    pub async fn hub_isolate(&self, id: NodeId) {
        self.hub.isolate(id).await;
    }

    pub async fn hub_restore(&self, id: NodeId) {
        self.hub.restore(id).await;
    }

    pub async fn metrics_of(&self, id: NodeId) -> Result<RaftMetrics> {
        let node = self.node(id);
        let rx = node.metrics().await?;
        let metrics = rx.borrow().clone();
        Ok(metrics)
    }

    pub async fn wait(&self, id: NodeId, timeout: Option<Duration>) -> Result<Wait> {
        Ok(self.node(id).wait(timeout).await?)
    }

    /// The id of the node currently reporting itself leader, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        for id in self.running_ids() {
            if let Ok(metrics) = self.metrics_of(id).await {
                if metrics.state == State::Leader {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Wait until the cluster has a stable leader: exactly one node in
    /// leader state, every running node in its term and aware of it.
    pub async fn wait_for_stable_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.check_stable_leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("no stable leader within {timeout:?}"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn check_stable_leader(&self) -> Option<NodeId> {
        let ids = self.running_ids();
        let mut all = Vec::with_capacity(ids.len());
        for id in &ids {
            all.push(self.metrics_of(*id).await.ok()?);
        }
        let leaders: Vec<&RaftMetrics> =
            all.iter().filter(|m| m.state == State::Leader).collect();
        if leaders.len() != 1 {
            return None;
        }
        let leader = leaders[0];
        let settled = all.iter().all(|m| {
            m.current_term == leader.current_term && m.current_leader == Some(leader.id)
        });
        settled.then(|| leader.id)
    }

    /// Wait for the given nodes to have applied up to `want` (inclusive).
    pub async fn wait_for_applied(
        &self,
        node_ids: &[NodeId],
        want: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(*id, timeout).await?.applied(want, msg).await?;
        }
        Ok(())
    }
}
