//! Node metrics published over a watch channel.
//!
//! Every state change in the core pushes a fresh [`RaftMetrics`] payload;
//! operators read the latest value, and [`Wait`] turns the stream into
//! awaitable conditions for tests and startup orchestration.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::State;
use crate::LogId;
use crate::NodeId;

/// A snapshot of a node's externally observable Raft state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    /// The log id covered by the latest snapshot; zero when none.
    pub snapshot: LogId,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            snapshot: LogId::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} waiting for {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    Shutdown,
}

/// Wait for the node's metrics to satisfy a condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until `func` accepts the current metrics, or time out.
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let mut rx = self.rx.clone();
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            let changed = tokio::time::timeout_at(deadline, rx.changed());
            match changed.await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Shutdown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for the node to reach the given role.
    pub async fn state(&self, want: State, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want, &format!("{} state == {:?}", msg, want)).await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, leader: NodeId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            &format!("{} leader == {}", msg, leader),
        )
        .await
    }

    /// Wait until a log entry at `want` has been received and applied.
    pub async fn log(&self, want: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want && m.last_applied >= want,
            &format!("{} log >= {}", msg, want),
        )
        .await
    }

    /// Wait until `last_applied` reaches `want`.
    pub async fn applied(&self, want: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, &format!("{} applied >= {}", msg, want)).await
    }

    /// Wait until the node's snapshot covers at least `want`.
    pub async fn snapshot(&self, want: LogId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.snapshot >= want, &format!("{} snapshot >= {}", msg, want)).await
    }
}
