//! TCP peer transport.
//!
//! Each peer gets one outbound mailbox drained by its own writer task, so
//! payloads to a peer leave in send order over a single connection. Frames
//! are a big-endian `u32` length followed by the wire text.
//!
//! Every connection opens with a hello frame carrying the dialler's id.
//! The receiver forwards frames only from the newest connection of each
//! peer: once a peer reconnects, whatever is still buffered on its old
//! connection is dropped, never delivered behind newer frames.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use lamport_core::config::AddressTable;
use lamport_core::infrastructure::{Inbound, Transport, TransportError};
use lamport_core::types::NodeId;

/// Largest frame either side will write or accept.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Newest connection generation per peer, shared by every reader task.
#[derive(Default)]
struct Connections {
    next: AtomicU64,
    current: Mutex<HashMap<NodeId, u64>>,
}

impl Connections {
    /// Make this connection the one `peer` is heard on. Returns its
    /// generation.
    async fn register(&self, peer: NodeId) -> u64 {
        let generation = self.next.fetch_add(1, Ordering::SeqCst);
        self.current.lock().await.insert(peer, generation);
        generation
    }
}

pub struct TcpTransport {
    mailboxes: HashMap<NodeId, UnboundedSender<Vec<u8>>>,
}

impl TcpTransport {
    /// Listen on `node`'s own address and start one writer task per peer.
    /// Peers are dialled lazily, on the first payload for them.
    pub async fn bind(node: NodeId, table: &AddressTable) -> anyhow::Result<(Self, TcpInbound)> {
        let own = table.get(node)?.socket_addr();
        let listener = TcpListener::bind(&own)
            .await
            .with_context(|| format!("failed to bind peer listener on {}", own))?;
        tracing::info!(node = %node, addr = %own, "Peer listener bound");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(node, listener, inbound_tx, Arc::default()));

        let mut mailboxes = HashMap::new();
        for peer in table.peers_of(node) {
            let addr = table.get(peer)?.socket_addr();
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(peer_writer(node, peer, addr, rx));
            mailboxes.insert(peer, tx);
        }

        Ok((Self { mailboxes }, TcpInbound { rx: inbound_rx }))
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: NodeId, payload: &[u8]) -> Result<(), TransportError> {
        let mailbox = self
            .mailboxes
            .get(&peer)
            .ok_or(TransportError::Unreachable(peer))?;
        mailbox
            .send(payload.to_vec())
            .map_err(|_| TransportError::Disconnected(peer))
    }
}

/// Frames received from any peer, in arrival order.
pub struct TcpInbound {
    rx: UnboundedReceiver<Vec<u8>>,
}

impl TcpInbound {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Inbound for TcpInbound {
    // Called from the dispatch thread, never from inside the runtime.
    fn next_inbound(&mut self) -> Option<Vec<u8>> {
        self.rx.blocking_recv()
    }
}

// ─── Framing ────────────────────────────────────────────────────────────────

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {}", payload.len(), MAX_FRAME_LEN),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer announced a {} byte frame", len),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// First frame on every connection: the dialling node's id.
pub async fn write_hello<W>(writer: &mut W, node: NodeId) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &node.get().to_be_bytes()).await
}

async fn read_hello<R>(reader: &mut R) -> io::Result<NodeId>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader)
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed before hello"))?;
    <[u8; 4]>::try_from(frame.as_slice())
        .ok()
        .and_then(|raw| NodeId::new(u32::from_be_bytes(raw)))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed hello"))
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

async fn accept_loop(
    node: NodeId,
    listener: TcpListener,
    inbound: UnboundedSender<Vec<u8>>,
    connections: Arc<Connections>,
) {
    while !inbound.is_closed() {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::debug!(node = %node, %remote, "Peer connected");
                tokio::spawn(read_connection(
                    node,
                    stream,
                    remote,
                    inbound.clone(),
                    Arc::clone(&connections),
                ));
            }
            Err(err) => {
                tracing::warn!(node = %node, error = %err, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn read_connection(
    node: NodeId,
    mut stream: TcpStream,
    remote: SocketAddr,
    inbound: UnboundedSender<Vec<u8>>,
    connections: Arc<Connections>,
) {
    let peer = match read_hello(&mut stream).await {
        Ok(peer) => peer,
        Err(err) => {
            tracing::warn!(node = %node, %remote, error = %err, "Dropping connection without hello");
            return;
        }
    };
    let generation = connections.register(peer).await;

    loop {
        match read_frame(&mut stream).await {
            Ok(Some(frame)) => {
                // Checked and forwarded under the lock, so a newer
                // connection cannot register in between.
                let current = connections.current.lock().await;
                if current.get(&peer) != Some(&generation) {
                    tracing::debug!(node = %node, peer = %peer, %remote, "Connection superseded; dropping the rest");
                    break;
                }
                if inbound.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(node = %node, %remote, "Peer disconnected");
                break;
            }
            Err(err) => {
                tracing::warn!(node = %node, %remote, error = %err, "Dropping peer connection");
                break;
            }
        }
    }
}

/// Drains one peer's mailbox. A payload gets one reconnect attempt and is
/// dropped if that fails too.
async fn peer_writer(
    node: NodeId,
    peer: NodeId,
    addr: String,
    mut mailbox: UnboundedReceiver<Vec<u8>>,
) {
    let mut stream: Option<TcpStream> = None;

    while let Some(payload) = mailbox.recv().await {
        let mut delivered = false;

        for _attempt in 0..2 {
            if stream.is_none() {
                match TcpStream::connect(&addr).await {
                    Ok(mut connected) => {
                        if let Err(err) = connected.set_nodelay(true) {
                            tracing::debug!(node = %node, peer = %peer, error = %err, "set_nodelay failed");
                        }
                        if let Err(err) = write_hello(&mut connected, node).await {
                            tracing::warn!(node = %node, peer = %peer, error = %err, "Hello failed");
                            continue;
                        }
                        tracing::debug!(node = %node, peer = %peer, addr = %addr, "Connected to peer");
                        stream = Some(connected);
                    }
                    Err(err) => {
                        tracing::warn!(node = %node, peer = %peer, addr = %addr, error = %err, "Connect failed");
                        continue;
                    }
                }
            }

            if let Some(connected) = stream.as_mut() {
                match write_frame(connected, &payload).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(node = %node, peer = %peer, error = %err, "Write failed");
                        stream = None;
                    }
                }
            }
        }

        if !delivered {
            tracing::warn!(
                node = %node,
                peer = %peer,
                payload = %String::from_utf8_lossy(&payload),
                "Dropping message for unreachable peer"
            );
        }
    }
}
