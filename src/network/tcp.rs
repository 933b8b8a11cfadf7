//! The production transport: length-prefixed RPC over TCP.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing_futures::Instrument;

use crate::error::TransportError;
use crate::network::RpcHandler;
use crate::network::Transport;
use crate::wire;
use crate::wire::MsgType;
use crate::NodeId;

/// TCP transport with one cached connection per peer.
///
/// Requests over one connection are strictly sequential, so replies can be
/// matched by order. Any I/O error drops the cached connection; the next
/// call reconnects.
pub struct TcpTransport {
    peers: HashMap<NodeId, String>,
    rpc_timeout: Duration,
    conns: Mutex<HashMap<NodeId, TcpStream>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(peers: HashMap<NodeId, String>, rpc_timeout: Duration) -> Self {
        Self {
            peers,
            rpc_timeout,
            conns: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let stream = timeout(self.rpc_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        msg: MsgType,
        body: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        write_frame(stream, msg, body).await?;
        let (reply_type, reply) = read_frame(stream).await?;
        if reply_type != msg.reply_type() {
            return Err(TransportError::Remote(format!(
                "expected reply type {:?}, got {:?}",
                msg.reply_type(),
                reply_type
            )));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        target: NodeId,
        msg: MsgType,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let addr = self.peers.get(&target).ok_or(TransportError::UnknownPeer(target))?;

        // Take the cached connection out of the map so a slow exchange with
        // one peer never blocks calls to the others.
        let cached = self.conns.lock().await.remove(&target);
        let mut stream = match cached {
            Some(stream) => stream,
            None => self.connect(addr).await?,
        };

        match timeout(self.rpc_timeout, self.exchange(&mut stream, msg, &body)).await {
            Ok(Ok(reply)) => {
                if !self.closed.load(Ordering::SeqCst) {
                    self.conns.lock().await.insert(target, stream);
                }
                Ok(reply)
            }
            Ok(Err(err)) => {
                // Connection state is unknown after an error; drop it.
                tracing::debug!(peer = target, error=%err, "rpc failed, dropping cached connection");
                Err(err)
            }
            Err(_) => {
                tracing::debug!(peer = target, "rpc timed out, dropping cached connection");
                Err(TransportError::Timeout)
            }
        }
    }

    async fn listen(&self, addr: &str, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr, "raft rpc listener started");
        let accept_loop = tokio::spawn(
            async move {
                loop {
                    let (stream, remote) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(error=%err, "accept failed");
                            continue;
                        }
                    };
                    let handler = handler.clone();
                    tokio::spawn(
                        async move {
                            if let Err(err) = serve_connection(stream, handler).await {
                                tracing::debug!(%remote, error=%err, "connection closed");
                            }
                        }
                        .instrument(tracing::debug_span!("rpc-conn")),
                    );
                }
            }
            .instrument(tracing::debug_span!("rpc-listener")),
        );
        *self.listener.lock().await = Some(accept_loop);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        self.conns.lock().await.clear();
    }
}

/// Serve framed requests on one connection, strictly in order.
async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
) -> Result<(), TransportError> {
    loop {
        let (msg, body) = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(TransportError::Io(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let reply = handler
            .handle(msg, &body)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))?;
        write_frame(&mut stream, msg.reply_type(), &reply).await?;
    }
}

async fn write_frame(
    stream: &mut TcpStream,
    msg: MsgType,
    body: &[u8],
) -> Result<(), TransportError> {
    stream.write_all(&wire::encode_frame_header(msg, body.len())).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<(MsgType, Vec<u8>), TransportError> {
    let mut header = [0u8; wire::FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (msg, len) = wire::decode_frame_header(&header)?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok((msg, body))
}
