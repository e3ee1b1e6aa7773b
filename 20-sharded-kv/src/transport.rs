//! How nodes reach each other.
//!
//! [`Transport`] is the outbound seam: one request, one response. Nodes never
//! hold connections to each other; they only know how to address a peer by
//! id. [`RequestHandler`] is the inbound seam, implemented by
//! [`crate::node::Node`].
//!
//! Two implementations:
//!
//! - [`TcpTransport`] + [`serve`]: length-prefixed frames over TCP, one
//!   connection per call
//! - [`LocalNetwork`]: in-process delivery with fault injection, used by the
//!   integration tests to crash and partition nodes deterministically

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::entry::NodeId;
use crate::error::{KvError, Result};
use crate::message::{read_frame, write_frame, Envelope, Response};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, to: NodeId, envelope: Envelope) -> Result<Response>;
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Response;
}

pub struct TcpTransport {
    peers: BTreeMap<NodeId, SocketAddr>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpTransport {
    pub fn new(peers: BTreeMap<NodeId, SocketAddr>, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            peers,
            connect_timeout,
            io_timeout,
        }
    }

    async fn exchange(stream: &mut TcpStream, envelope: &Envelope) -> std::io::Result<Option<Response>> {
        write_frame(stream, envelope).await?;
        read_frame(stream).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, to: NodeId, envelope: Envelope) -> Result<Response> {
        let addr = self
            .peers
            .get(&to)
            .ok_or_else(|| KvError::Transport(format!("unknown peer {to}")))?;

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| KvError::Timeout)?
            .map_err(|err| KvError::Transport(format!("connect to {addr}: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| KvError::Transport(err.to_string()))?;

        let kind = envelope.request.kind();
        match tokio::time::timeout(self.io_timeout, Self::exchange(&mut stream, &envelope)).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(KvError::Transport(format!("{addr} closed before answering {kind}"))),
            Ok(Err(err)) => Err(KvError::Transport(format!("{kind} to {addr}: {err}"))),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

/// Accepts peer connections until `shutdown` flips to `true`.
///
/// Each connection gets its own task, which answers frames in order until the
/// peer hangs up.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "listening for peers");
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => break,
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, handler).await {
                debug!(peer = %peer, error = %err, "peer connection ended");
            }
        });
    }
    info!(addr = %local, "peer listener stopped");
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn RequestHandler>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    while let Some(envelope) = read_frame::<_, Envelope>(&mut stream).await? {
        let response = handler.handle(envelope).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

/// In-process network with switchable faults.
///
/// Handlers are held weakly so dropping a node's last `Arc` takes it off the
/// network just like a crashed process.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<BTreeMap<NodeId, Weak<dyn RequestHandler>>>,
    down: RwLock<BTreeSet<NodeId>>,
    cut: RwLock<BTreeSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: NodeId, handler: &Arc<dyn RequestHandler>) {
        self.handlers.write().insert(id, Arc::downgrade(handler));
    }

    /// Transport that sends as `local`.
    pub fn transport(self: &Arc<Self>, local: NodeId) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            network: Arc::clone(self),
            local,
        })
    }

    /// Drops every message to or from `id`.
    pub fn isolate(&self, id: NodeId) {
        warn!(node = id, "isolating node");
        self.down.write().insert(id);
    }

    pub fn restore(&self, id: NodeId) {
        info!(node = id, "restoring node");
        self.down.write().remove(&id);
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        let mut cut = self.cut.write();
        cut.insert((a, b));
        cut.insert((b, a));
    }

    pub fn heal(&self, a: NodeId, b: NodeId) {
        let mut cut = self.cut.write();
        cut.remove(&(a, b));
        cut.remove(&(b, a));
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        let down = self.down.read();
        !down.contains(&from) && !down.contains(&to) && !self.cut.read().contains(&(from, to))
    }

    fn handler(&self, id: NodeId) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().get(&id).and_then(Weak::upgrade)
    }
}

struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: NodeId,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, to: NodeId, envelope: Envelope) -> Result<Response> {
        if !self.network.reachable(self.local, to) {
            return Err(KvError::Transport(format!("node {to} unreachable from {}", self.local)));
        }
        let handler = self
            .network
            .handler(to)
            .ok_or_else(|| KvError::Transport(format!("node {to} is not running")))?;
        // Run on its own task so a caller timing out does not cancel the
        // receiver half-way, just like a real socket.
        let response = tokio::spawn(async move { handler.handle(envelope).await })
            .await
            .map_err(|err| KvError::Transport(err.to_string()))?;
        if !self.network.reachable(to, self.local) {
            return Err(KvError::Transport(format!("reply from node {to} lost")));
        }
        Ok(response)
    }
}
