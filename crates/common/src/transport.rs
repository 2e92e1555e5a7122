//! Router/dealer message transport over a Unix socket
//!
//! The master binds a [`Router`]; every worker connects a [`Dealer`] that
//! announces its identity in the first frame. On the router side every
//! message is a three-part frame `[peer_id, "", json_payload]`; the dealer
//! sees `["", json_payload]`. Frames from one peer are delivered in order.

use crate::types::WorkerId;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

/// One message, made of several byte parts
pub type Multipart = Vec<Bytes>;

/// Largest frame accepted on the socket
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Length-delimited frames whose body is a part count followed by
/// length-prefixed parts.
pub struct MultipartCodec {
    inner: LengthDelimitedCodec,
}

impl MultipartCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_frame(msg: &str) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string()))
}

impl Decoder for MultipartCodec {
    type Item = Multipart;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Multipart>> {
        let Some(mut frame) = self.inner.decode(src)? else {
            return Ok(None);
        };

        if frame.remaining() < 2 {
            return Err(invalid_frame("frame too short"));
        }
        let count = frame.get_u16() as usize;
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            if frame.remaining() < 4 {
                return Err(invalid_frame("truncated part header"));
            }
            let len = frame.get_u32() as usize;
            if frame.remaining() < len {
                return Err(invalid_frame("truncated part"));
            }
            parts.push(frame.split_to(len).freeze());
        }
        if frame.has_remaining() {
            return Err(invalid_frame("trailing bytes after last part"));
        }
        Ok(Some(parts))
    }
}

impl Encoder<Multipart> for MultipartCodec {
    type Error = Error;

    fn encode(&mut self, parts: Multipart, dst: &mut BytesMut) -> Result<()> {
        let size = 2 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
        let mut body = BytesMut::with_capacity(size);
        body.put_u16(parts.len() as u16);
        for part in &parts {
            body.put_u32(part.len() as u32);
            body.put_slice(part);
        }
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}

struct PeerHandle {
    conn: u64,
    tx: mpsc::Sender<Multipart>,
}

/// Master side of the transport: accepts dealers and routes by identity
pub struct Router {
    endpoint: PathBuf,
    peers: Arc<DashMap<WorkerId, PeerHandle>>,
    inbound: mpsc::UnboundedReceiver<Multipart>,
    accept_task: JoinHandle<()>,
}

impl Router {
    /// Bind the router on a filesystem socket path.
    ///
    /// `outbox_capacity` bounds the number of unsent messages per peer.
    pub async fn bind(endpoint: &Path, outbox_capacity: usize) -> Result<Self> {
        if let Some(parent) = endpoint.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Clean up a stale socket left by a previous master with our pid
        if endpoint.exists() {
            tokio::fs::remove_file(endpoint).await?;
        }

        let listener = UnixListener::bind(endpoint).map_err(|e| {
            Error::Transport(format!("Failed to bind {}: {}", endpoint.display(), e))
        })?;
        debug!("Router bound on {}", endpoint.display());

        let peers: Arc<DashMap<WorkerId, PeerHandle>> = Arc::new(DashMap::new());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            peers.clone(),
            inbound_tx,
            outbox_capacity.max(1),
        ));

        Ok(Self {
            endpoint: endpoint.to_path_buf(),
            peers,
            inbound,
            accept_task,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `[peer_id, "", payload]`, or `None` when nothing arrived.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Multipart>> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(Error::Transport("router closed".to_string())),
            Ok(Some(parts)) => Ok(Some(parts)),
        }
    }

    /// Route `[peer_id, ...rest]` to `peer_id`. Never blocks.
    pub fn send(&self, mut parts: Multipart) -> Result<()> {
        if parts.is_empty() {
            return Err(Error::Transport("empty message".to_string()));
        }
        let peer_bytes = parts.remove(0);
        let peer = WorkerId::from_bytes(&peer_bytes)
            .ok_or_else(|| Error::Transport("peer id is not utf-8".to_string()))?;

        let handle = self
            .peers
            .get(&peer)
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;

        handle.tx.try_send(parts).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Saturated(peer.to_string()),
            mpsc::error::TrySendError::Closed(_) => Error::UnknownPeer(peer.to_string()),
        })
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.endpoint);
    }
}

async fn accept_loop(
    listener: UnixListener,
    peers: Arc<DashMap<WorkerId, PeerHandle>>,
    inbound: mpsc::UnboundedSender<Multipart>,
    outbox_capacity: usize,
) {
    let next_conn = AtomicU64::new(0);
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(handle_connection(
                    stream,
                    conn,
                    peers.clone(),
                    inbound.clone(),
                    outbox_capacity,
                ));
            }
            Err(e) => {
                warn!("Router accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    conn: u64,
    peers: Arc<DashMap<WorkerId, PeerHandle>>,
    inbound: mpsc::UnboundedSender<Multipart>,
    outbox_capacity: usize,
) {
    let (mut sink, mut frames) = Framed::new(stream, MultipartCodec::new()).split();

    // First frame announces the dealer identity
    let identity = match frames.next().await {
        Some(Ok(parts)) if parts.len() == 1 => WorkerId::from_bytes(&parts[0]),
        Some(Ok(parts)) => {
            warn!("Dropping connection with {}-part handshake", parts.len());
            return;
        }
        Some(Err(e)) => {
            warn!("Dropping connection with bad handshake: {}", e);
            return;
        }
        None => return,
    };
    let Some(identity) = identity else {
        warn!("Dropping connection with non utf-8 identity");
        return;
    };
    debug!("Peer {} connected", identity);

    let (tx, mut rx) = mpsc::channel::<Multipart>(outbox_capacity);
    peers.insert(identity.clone(), PeerHandle { conn, tx });

    let writer_id = identity.clone();
    let writer = tokio::spawn(async move {
        while let Some(parts) = rx.recv().await {
            if let Err(e) = sink.send(parts).await {
                warn!("Write to {} failed: {}", writer_id, e);
                break;
            }
        }
    });

    let id_part = Bytes::copy_from_slice(identity.as_bytes());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(parts) => {
                trace!("{} -> router: {} parts", identity, parts.len());
                let mut routed = Vec::with_capacity(parts.len() + 1);
                routed.push(id_part.clone());
                routed.extend(parts);
                if inbound.send(routed).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Read from {} failed: {}", identity, e);
                break;
            }
        }
    }

    debug!("Peer {} disconnected", identity);
    peers.remove_if(&identity, |_, handle| handle.conn == conn);
    writer.abort();
}

/// Worker side of the transport
pub struct Dealer {
    identity: WorkerId,
    framed: Framed<UnixStream, MultipartCodec>,
}

impl Dealer {
    /// Connect and announce `identity` to the router
    pub async fn connect(endpoint: &Path, identity: WorkerId) -> Result<Self> {
        let stream = UnixStream::connect(endpoint).await.map_err(|e| {
            Error::Transport(format!("Failed to connect to {}: {}", endpoint.display(), e))
        })?;
        let mut framed = Framed::new(stream, MultipartCodec::new());
        framed
            .send(vec![Bytes::copy_from_slice(identity.as_bytes())])
            .await?;
        debug!("Connected to {} as {}", endpoint.display(), identity);
        Ok(Self { identity, framed })
    }

    /// Retry [`Dealer::connect`] until the endpoint accepts or `timeout` passes
    pub async fn connect_timeout(
        endpoint: &Path,
        identity: WorkerId,
        timeout: Duration,
    ) -> Result<Self> {
        let start = std::time::Instant::now();
        loop {
            match Self::connect(endpoint, identity.clone()).await {
                Ok(dealer) => return Ok(dealer),
                Err(e) if start.elapsed() < timeout => {
                    trace!("Router not ready: {}", e);
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        seconds: timeout.as_secs(),
                    })
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn identity(&self) -> &WorkerId {
        &self.identity
    }

    /// Send one payload as `["", payload]`
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        self.framed
            .send(vec![Bytes::new(), Bytes::from(payload)])
            .await
    }

    /// Receive the next payload
    pub async fn recv(&mut self) -> Result<Bytes> {
        let mut parts = match self.framed.next().await {
            Some(frame) => frame?,
            None => return Err(Error::Transport("connection closed by master".to_string())),
        };
        match parts.len() {
            2 if parts[0].is_empty() => Ok(parts.remove(1)),
            n => Err(Error::Protocol(format!("expected 2-part reply, got {}", n))),
        }
    }
}

/// Split a routed message into its peer and JSON payload
pub fn split_routed(mut parts: Multipart) -> Result<(WorkerId, Bytes)> {
    if parts.len() != 3 || !parts[1].is_empty() {
        return Err(Error::Protocol(format!(
            "expected [peer, \"\", payload], got {} parts",
            parts.len()
        )));
    }
    let payload = parts.remove(2);
    let peer = WorkerId::from_bytes(&parts[0])
        .ok_or_else(|| Error::Transport("peer id is not utf-8".to_string()))?;
    Ok((peer, payload))
}

/// Build a routed message `[peer, "", payload]`
pub fn routed(peer: &WorkerId, payload: Vec<u8>) -> Multipart {
    vec![
        Bytes::copy_from_slice(peer.as_bytes()),
        Bytes::new(),
        Bytes::from(payload),
    ]
}
