//! Peer connections and the peer registry.
//!
//! Every live connection gets an opaque `PeerId` and a bounded outgoing
//! queue drained by a writer task. Handlers address peers only through the
//! registry, so a peer that disconnects mid-flight turns into a logged
//! send failure instead of a dangling reference.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::proto::{Frame, WireCodec};

/// Opaque handle to a live peer connection. Zero is reserved for "this
/// node" in correlation keys and never names a connection.
pub type PeerId = u64;

/// The reserved local pseudo-peer.
pub const LOCAL_PEER: PeerId = 0;

/// Capacity of each per-peer outgoing queue.
const OUTGOING_QUEUE_CAPACITY: usize = 1024;

struct PeerHandle {
    tx: mpsc::Sender<Frame>,
    label: String,
    addr: Option<SocketAddr>,
}

/// Registry of live peer connections.
pub struct Transport {
    next_id: AtomicU64,
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
}

impl Transport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { next_id: AtomicU64::new(1), peers: RwLock::new(HashMap::new()) })
    }

    /// Allocate a peer id and its outgoing queue ahead of serving the
    /// connection.
    fn register(&self, label: String, addr: Option<SocketAddr>) -> (PeerId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers
            .write()
            .expect("peer registry poisoned")
            .insert(id, PeerHandle { tx, label, addr });
        (id, rx)
    }

    fn deregister(&self, id: PeerId) {
        self.peers.write().expect("peer registry poisoned").remove(&id);
    }

    pub fn is_connected(&self, id: PeerId) -> bool {
        self.peers.read().expect("peer registry poisoned").contains_key(&id)
    }

    pub fn peer_addr(&self, id: PeerId) -> Option<SocketAddr> {
        self.peers.read().expect("peer registry poisoned").get(&id).and_then(|p| p.addr)
    }

    pub fn peer_label(&self, id: PeerId) -> Option<String> {
        self.peers.read().expect("peer registry poisoned").get(&id).map(|p| p.label.clone())
    }

    /// Queue a frame for a peer. A missing peer (disconnected mid-flight)
    /// or a closed queue is logged and reported as `false`; the caller's
    /// pending entry will then age out through the timeout sweep.
    pub async fn send(&self, id: PeerId, frame: Frame) -> bool {
        let tx = {
            let peers = self.peers.read().expect("peer registry poisoned");
            match peers.get(&id) {
                Some(handle) => handle.tx.clone(),
                None => {
                    tracing::warn!(
                        peer = id,
                        opcode = frame.body.opcode(),
                        "send to unknown peer dropped"
                    );
                    return false;
                }
            }
        };
        if tx.send(frame).await.is_err() {
            tracing::warn!(peer = id, "send to disconnected peer dropped");
            return false;
        }
        true
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peer registry poisoned").len()
    }
}

/// Pump one registered connection: writer task drains the outgoing queue,
/// and every incoming frame goes to `handler` in arrival order. The peer is
/// deregistered on every exit path.
async fn serve<H, Fut>(
    transport: Arc<Transport>,
    stream: TcpStream,
    peer: PeerId,
    mut rx: mpsc::Receiver<Frame>,
    label: String,
    handler: H,
) -> Result<()>
where
    H: Fn(PeerId, Frame) -> Fut,
    Fut: Future<Output = ()>,
{
    let framed = Framed::new(stream, WireCodec);
    let (mut sink, mut source) = framed.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = sink.send(frame).await {
                tracing::debug!(error = %err, "peer write failed");
                break;
            }
        }
    });

    while let Some(next) = source.next().await {
        match next {
            Ok(frame) => handler(peer, frame).await,
            Err(err) => {
                tracing::warn!(peer, label = %label, error = %err, "connection desynchronized");
                break;
            }
        }
    }

    transport.deregister(peer);
    writer.abort();
    Ok(())
}

/// Serve an already-accepted connection, blocking until the peer hangs up.
pub async fn run_connection<H, Fut>(
    transport: Arc<Transport>,
    stream: TcpStream,
    label: String,
    handler: H,
) -> Result<()>
where
    H: Fn(PeerId, Frame) -> Fut,
    Fut: Future<Output = ()>,
{
    let addr = stream.peer_addr().ok();
    let (peer, rx) = transport.register(label.clone(), addr);
    serve(transport, stream, peer, rx, label, handler).await
}

/// Connect out to `addr` and serve the connection in a background task.
/// Returns the new peer id once the connection is established.
pub async fn connect<H, Fut>(
    transport: Arc<Transport>,
    addr: SocketAddr,
    label: String,
    handler: H,
) -> Result<PeerId>
where
    H: Fn(PeerId, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {label} at {addr}"))?;
    stream.set_nodelay(true).ok();

    let (peer, rx) = transport.register(label.clone(), Some(addr));
    let transport_clone = Arc::clone(&transport);
    tokio::spawn(async move {
        if let Err(err) = serve(transport_clone, stream, peer, rx, label, handler).await {
            tracing::debug!(error = %err, "outbound connection closed");
        }
    });
    Ok(peer)
}

/// Accept loop: serve every inbound connection with `handler`.
pub async fn listen<H, Fut>(
    transport: Arc<Transport>,
    listener: TcpListener,
    label: &'static str,
    handler: H,
) -> Result<()>
where
    H: Fn(PeerId, Frame) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    loop {
        let (stream, addr) = listener.accept().await.context("accept failed")?;
        stream.set_nodelay(true).ok();
        let transport = Arc::clone(&transport);
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) =
                run_connection(transport, stream, format!("{label}:{addr}"), handler).await
            {
                tracing::debug!(error = %err, "inbound connection closed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Body;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let transport = Transport::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo server: answer every Get with a GetResponse.
        let server_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            let t2 = Arc::clone(&server_transport);
            let _ = listen(server_transport, listener, "test", move |peer, frame| {
                let t = Arc::clone(&t2);
                async move {
                    if let Body::Get { key } = frame.body {
                        let reply = Frame::new(
                            frame.instance_id,
                            frame.request_id,
                            Body::GetResponse {
                                success: true,
                                is_degraded: false,
                                key,
                                value: b"v".to_vec(),
                            },
                        );
                        t.send(peer, reply).await;
                    }
                }
            })
            .await;
        });

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        let client_transport = Arc::clone(&transport);
        let peer = connect(client_transport, addr, "server".into(), move |_peer, frame| {
            let tx = reply_tx.clone();
            async move {
                tx.send(frame).await.ok();
            }
        })
        .await
        .unwrap();

        assert!(transport.send(peer, Frame::new(1, 42, Body::Get { key: b"k".to_vec() })).await);
        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.request_id, 42);
        match reply.body {
            Body::GetResponse { success, value, .. } => {
                assert!(success);
                assert_eq!(value, b"v");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
