//! Error types exposed and consumed by the replication core.

use std::path::PathBuf;

use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors originating from the Raft node itself.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// The node is shutting down; no further requests are served.
    #[error("raft is shutting down")]
    ShuttingDown,
    /// A fatal error from the persistence layer.
    #[error("raft storage error: {0}")]
    Storage(anyhow::Error),
    /// An error from the network layer.
    #[error("raft network error: {0}")]
    Network(anyhow::Error),
}

/// Errors returned to the proposer of a write.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError {
    /// The node is not the leader. The client must retry against the
    /// current leader; `leader_id` is a routing hint and is `None` when no
    /// leader is known.
    #[error("node is not the raft leader")]
    NotLeader { leader_id: Option<NodeId> },
    /// The command committed but the state machine rejected it. This is a
    /// deterministic, application-level rejection: every node applies the
    /// same outcome, so the client must not retry.
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Deterministic application-level errors from applying a committed command.
///
/// These are recorded for the matching pending proposal but never block
/// further application; followers hitting the same error on the same command
/// is expected, not divergence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("no such entry: {0}")]
    NoSuchEntry(String),
    #[error("uid is not unique: {0}")]
    NotUnique(String),
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
    #[error("malformed command payload: {0}")]
    Codec(String),
    #[error("storage engine error: {0}")]
    Engine(String),
}

/// Errors raised by the wire codec.
///
/// A corrupt body is a protocol error on the connection that carried it; it
/// never changes node state.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("corrupt message: {0}")]
    Corrupt(&'static str),
    #[error("message body of {0} bytes exceeds the frame limit")]
    FrameTooLarge(u64),
    #[error("unknown message type {0}")]
    UnknownMsgType(u8),
}

/// Errors raised by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("no address known for peer {0}")]
    UnknownPeer(NodeId),
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),
    #[error("rpc timed out")]
    Timeout,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors detected while validating a `Config`; any of these refuse startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("node id must be greater than zero")]
    InvalidNodeId,
    #[error("node {0} is not present in the configured peer set")]
    SelfNotInPeers(NodeId),
    #[error("peer {0} has an empty address")]
    MissingAddr(NodeId),
    #[error("duplicate peer id {0}")]
    DuplicatePeer(NodeId),
    #[error("heartbeat interval must be non-zero and shorter than the election timeout")]
    BadTimeouts,
    #[error("data dir {0}: {1}")]
    DataDir(PathBuf, String),
}
