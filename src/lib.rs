//! Raft replication core for the directory server.
//!
//! This crate keeps a cluster of directory nodes converged on a single,
//! linearizable sequence of write operations. It contains the Raft node
//! itself (election, log replication, persistence), the replicated state
//! machine that materializes committed commands into the local storage
//! engine, and the snapshot machinery that bounds log growth and lets
//! lagging or freshly wiped followers catch up.
//!
//! The public surface for applications is [`cluster::DirectoryCluster`]:
//! writes are routed through the leader and block until the corresponding
//! log entry is committed and applied; reads are served from the local
//! storage engine without consulting Raft.

pub mod cluster;
pub mod command;
pub mod config;
pub mod core;
pub mod engine;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod network;
pub mod raft;
pub mod sm;
pub mod storage;
pub mod wire;

mod quorum;
pub(crate) mod replication;

use serde::Deserialize;
use serde::Serialize;

pub use crate::cluster::DirectoryCluster;
pub use crate::cluster::Status;
pub use crate::command::Command;
pub use crate::command::DirEntry;
pub use crate::config::Config;
pub use crate::core::State;
pub use crate::engine::MemoryEngine;
pub use crate::engine::Scope;
pub use crate::engine::StorageEngine;
pub use crate::error::ClientWriteError;
pub use crate::error::RaftError;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::network::Transport;
pub use crate::raft::Raft;
pub use crate::sm::DirectoryStateMachine;
pub use crate::sm::StateMachine;

/// A Raft node's ID.
///
/// Node IDs are assigned by configuration, must be unique within the
/// cluster, and must be greater than zero (zero is the wire encoding of
/// "no node").
pub type NodeId = u64;

/// The identity of a log entry: its term paired with its index.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display(fmt = "{}-{}", term, index)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

/// A short, human readable summary of a message, for logging.
///
/// `Debug` output of RPCs can carry whole entry payloads; this trait is what
/// handler spans record instead.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
