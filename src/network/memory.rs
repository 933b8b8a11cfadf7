//! An in-process transport for deterministic testing.
//!
//! A [`MemHub`] plays the network: every node registers its handler under
//! its id, and [`MemTransport`] routes frames straight to the target's
//! handler. Isolation switches let tests partition nodes without touching
//! timers or sockets.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::network::RpcHandler;
use crate::network::Transport;
use crate::wire::MsgType;
use crate::NodeId;

/// The shared routing table of an in-process cluster.
#[derive(Default)]
pub struct MemHub {
    table: tokio::sync::RwLock<HashMap<NodeId, Arc<dyn RpcHandler>>>,
    isolated: tokio::sync::RwLock<HashSet<NodeId>>,
}

impl MemHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a transport endpoint for one node.
    pub fn transport(self: &Arc<Self>, id: NodeId) -> Arc<MemTransport> {
        Arc::new(MemTransport { id, hub: self.clone(), closed: AtomicBool::new(false) })
    }

    /// Cut the given node off from the rest of the hub.
    pub async fn isolate(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    /// Reconnect a previously isolated node.
    pub async fn restore(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    async fn route(
        &self,
        from: NodeId,
        target: NodeId,
        msg: MsgType,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        {
            let isolated = self.isolated.read().await;
            if isolated.contains(&from) || isolated.contains(&target) {
                return Err(TransportError::Unreachable(target));
            }
        }
        let handler = {
            let table = self.table.read().await;
            table.get(&target).cloned().ok_or(TransportError::Unreachable(target))?
        };
        handler
            .handle(msg, &body)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }
}

/// One node's endpoint on a [`MemHub`].
pub struct MemTransport {
    id: NodeId,
    hub: Arc<MemHub>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(
        &self,
        target: NodeId,
        msg: MsgType,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.hub.route(self.id, target, msg, body).await
    }

    async fn listen(
        &self,
        _addr: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<(), TransportError> {
        self.hub.table.write().await.insert(self.id, handler);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.hub.table.write().await.remove(&self.id);
    }
}
