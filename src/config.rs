//! Raft runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::NodeId;

/// A cluster member: node id plus the address its Raft listener binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: String,
}

/// Runtime configuration for a Raft node.
///
/// The peer set is static and must include this node itself. Use
/// [`Config::validate`] before starting a node; an invalid configuration
/// refuses to start rather than degrading at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This node's ID. Must be unique within the cluster and non-zero.
    pub node_id: NodeId,
    /// The address the Raft RPC listener binds.
    pub raft_addr: String,
    /// All cluster members, including this node.
    pub peers: Vec<Peer>,
    /// Base election timeout `T`; actual timeouts are drawn uniformly from
    /// `[T, 2T)`.
    pub election_timeout: Duration,
    /// Interval between leader heartbeats. Must be strictly shorter than
    /// the election timeout.
    pub heartbeat_interval: Duration,
    /// Per-call timeout for outgoing RPCs.
    pub rpc_timeout: Duration,
    /// Timeout for a single InstallSnapshot RPC, which can carry a large
    /// payload.
    pub install_snapshot_timeout: Duration,
    /// Maximum number of entries shipped in one AppendEntries payload.
    pub max_payload_entries: u64,
    /// Take a snapshot once the log holds more than this many entries.
    /// Zero disables snapshotting.
    pub snapshot_interval: u64,
    /// Directory holding the node's persistent state. Must exist and be
    /// writable.
    pub data_dir: PathBuf,
}

impl Config {
    /// Build a config with the typical timer defaults.
    pub fn new(
        node_id: NodeId,
        raft_addr: impl Into<String>,
        peers: Vec<Peer>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id,
            raft_addr: raft_addr.into(),
            peers,
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(5),
            install_snapshot_timeout: Duration::from_secs(30),
            max_payload_entries: 300,
            snapshot_interval: 10_000,
            data_dir: data_dir.into(),
        }
    }

    /// Validate the configuration, consuming and returning it.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::InvalidNodeId);
        }
        let mut seen = std::collections::BTreeSet::new();
        for peer in &self.peers {
            if peer.id == 0 {
                return Err(ConfigError::InvalidNodeId);
            }
            if peer.addr.is_empty() {
                return Err(ConfigError::MissingAddr(peer.id));
            }
            if !seen.insert(peer.id) {
                return Err(ConfigError::DuplicatePeer(peer.id));
            }
        }
        if !seen.contains(&self.node_id) {
            return Err(ConfigError::SelfNotInPeers(self.node_id));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.election_timeout {
            return Err(ConfigError::BadTimeouts);
        }
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| ConfigError::DataDir(self.data_dir.clone(), e.to_string()))?;
        let probe = self.data_dir.join(".writable");
        std::fs::write(&probe, b"")
            .and_then(|_| std::fs::remove_file(&probe))
            .map_err(|e| ConfigError::DataDir(self.data_dir.clone(), e.to_string()))?;
        Ok(self)
    }

    /// Generate a new election timeout, uniform in `[T, 2T)`.
    pub fn new_rand_election_timeout(&self) -> Duration {
        let t = self.election_timeout.as_millis() as u64;
        Duration::from_millis(thread_rng().gen_range(t..t * 2))
    }

    /// The address configured for the given node, if any.
    pub fn peer_addr(&self, id: NodeId) -> Option<&str> {
        self.peers.iter().find(|p| p.id == id).map(|p| p.addr.as_str())
    }

    /// IDs of all cluster members other than this node.
    pub fn remote_peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.id).filter(|id| *id != self.node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<Peer> {
        vec![
            Peer { id: 1, addr: "127.0.0.1:7101".into() },
            Peer { id: 2, addr: "127.0.0.1:7102".into() },
            Peer { id: 3, addr: "127.0.0.1:7103".into() },
        ]
    }

    #[test]
    fn accepts_well_formed_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(1, "127.0.0.1:7101", peers(), dir.path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(0, "127.0.0.1:7101", peers(), dir.path());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidNodeId)));
    }

    #[test]
    fn rejects_node_missing_from_peer_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(9, "127.0.0.1:7109", peers(), dir.path());
        assert!(matches!(config.validate(), Err(ConfigError::SelfNotInPeers(9))));
    }

    #[test]
    fn rejects_heartbeat_at_or_above_election_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(1, "127.0.0.1:7101", peers(), dir.path());
        config.heartbeat_interval = config.election_timeout;
        assert!(matches!(config.validate(), Err(ConfigError::BadTimeouts)));
    }

    #[test]
    fn rejects_empty_peer_addr() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = peers();
        p[1].addr.clear();
        let config = Config::new(1, "127.0.0.1:7101", p, dir.path());
        assert!(matches!(config.validate(), Err(ConfigError::MissingAddr(2))));
    }

    #[test]
    fn election_timeout_is_randomized_within_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(1, "127.0.0.1:7101", peers(), dir.path());
        for _ in 0..64 {
            let t = config.new_rand_election_timeout();
            assert!(t >= config.election_timeout);
            assert!(t < config.election_timeout * 2);
        }
    }
}
