use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Message, NodeId};

/// Messages queued per peer before new ones are dropped.
const PEER_QUEUE_DEPTH: usize = 256;
/// Frames larger than this are treated as a protocol error.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
/// After a failed connect, messages to that peer are dropped for this long.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),
    #[error("peer {peer} unreachable: {source}")]
    PeerUnreachable { peer: NodeId, source: io::Error },
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Wire envelope: wraps a Raft message with the sender's identity.
#[derive(Serialize, Deserialize)]
struct Envelope<Cmd> {
    from: NodeId,
    message: Message<Cmd>,
}

/// TCP transport for Raft RPCs.
///
/// Messages are framed with a 4-byte big-endian length prefix followed by a
/// JSON-serialized `Envelope`. Each peer has one outbound worker thread that owns
/// a persistent connection and drains a bounded queue, so messages to one peer
/// arrive in the order they were sent. Nothing is ordered across peers. A full
/// queue, a failed connect or a broken connection drops messages; Raft's retries
/// cover the loss. Inbound connections each get a reader thread feeding one
/// receive channel.
pub struct Transport<Cmd> {
    local_id: NodeId,
    peers: HashMap<NodeId, mpsc::SyncSender<Message<Cmd>>>,
    rx: mpsc::Receiver<(NodeId, Message<Cmd>)>,
    local_addr: SocketAddr,
}

impl<Cmd> Transport<Cmd>
where
    Cmd: Send + 'static + Serialize + for<'de> Deserialize<'de>,
{
    /// Bind a listener on `addr` and start accepting inbound Raft RPCs.
    pub fn bind(
        local_id: NodeId,
        addr: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        Self::start(local_id, listener, peers)
    }

    fn start(
        local_id: NodeId,
        listener: TcpListener,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self, TransportError> {
        let local_addr = listener.local_addr()?;
        let listener = Arc::new(listener);
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("raft-accept-{local_id}"))
            .spawn(move || accept_loop::<Cmd>(listener, tx))?;

        let mut queues = HashMap::new();
        for (peer, addr) in peers {
            let (queue_tx, queue_rx) = mpsc::sync_channel(PEER_QUEUE_DEPTH);
            thread::Builder::new()
                .name(format!("raft-send-{peer}"))
                .spawn(move || peer_worker(local_id, peer, addr, queue_rx))?;
            queues.insert(peer, queue_tx);
        }

        Ok(Self {
            local_id,
            peers: queues,
            rx,
            local_addr,
        })
    }

    /// Queue a message for a peer. Returns immediately; unknown peer is the only
    /// synchronous error.
    pub fn send(&self, to: NodeId, message: Message<Cmd>) -> Result<(), TransportError> {
        let queue = self.peers.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        match queue.try_send(message) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(_)) => {
                debug!(node = %self.local_id, peer = %to, "peer queue full, dropping message");
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                warn!(node = %self.local_id, peer = %to, "peer worker gone, dropping message");
            }
        }
        Ok(())
    }

    /// Queue a message for every peer.
    pub fn broadcast(&self, message: Message<Cmd>) -> Result<(), TransportError>
    where
        Cmd: Clone,
    {
        for &peer in self.peers.keys() {
            self.send(peer, message.clone())?;
        }
        Ok(())
    }

    /// Block until a message arrives or `timeout` elapses. Returns `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(NodeId, Message<Cmd>)> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// The address this transport is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn accept_loop<Cmd>(listener: Arc<TcpListener>, tx: mpsc::Sender<(NodeId, Message<Cmd>)>)
where
    Cmd: Send + 'static + for<'de> Deserialize<'de>,
{
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                let tx = tx.clone();
                thread::spawn(move || read_loop::<Cmd>(stream, remote, tx));
            }
            Err(e) => {
                warn!(error = %e, "raft listener failed, no longer accepting");
                break;
            }
        }
    }
}

/// Read envelopes from one inbound connection until it closes or the receiver goes away.
fn read_loop<Cmd>(stream: TcpStream, remote: SocketAddr, tx: mpsc::Sender<(NodeId, Message<Cmd>)>)
where
    Cmd: for<'de> Deserialize<'de>,
{
    loop {
        match read_envelope::<Cmd>(&stream) {
            Ok(env) => {
                if tx.send((env.from, env.message)).is_err() {
                    return;
                }
            }
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                debug!(%remote, error = %e, "dropping inbound connection");
                return;
            }
        }
    }
}

/// Own the connection to one peer and write queued messages to it in order.
fn peer_worker<Cmd: Serialize>(
    local_id: NodeId,
    peer: NodeId,
    addr: SocketAddr,
    queue: mpsc::Receiver<Message<Cmd>>,
) {
    let mut stream: Option<TcpStream> = None;
    let mut retry_at: Option<Instant> = None;

    while let Ok(message) = queue.recv() {
        if stream.is_none() {
            if retry_at.is_some_and(|at| Instant::now() < at) {
                continue;
            }
            match connect(addr) {
                Ok(s) => {
                    debug!(node = %local_id, %peer, "connected to peer");
                    stream = Some(s);
                    retry_at = None;
                }
                Err(source) => {
                    let err = TransportError::PeerUnreachable { peer, source };
                    debug!(node = %local_id, error = %err, "dropping message");
                    retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
                    continue;
                }
            }
        }

        let envelope = Envelope {
            from: local_id,
            message,
        };
        if let Some(s) = stream.as_mut() {
            if let Err(e) = write_envelope(s, &envelope) {
                debug!(node = %local_id, %peer, error = %e, "send failed, reconnecting");
                stream = None;
            }
        }
    }
}

fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Read one length-prefixed JSON envelope from the stream.
fn read_envelope<Cmd: for<'de> Deserialize<'de>>(
    mut stream: &TcpStream,
) -> Result<Envelope<Cmd>, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one length-prefixed JSON envelope.
fn write_envelope<Cmd: Serialize>(
    stream: &mut TcpStream,
    envelope: &Envelope<Cmd>,
) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}
