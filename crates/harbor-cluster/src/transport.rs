//! TCP transport between peer nodes.
//!
//! Every connection starts with both ends writing their [`Handshake`] and
//! then reading the other's. After that the link carries length-prefixed
//! frames: a 4-byte big-endian u32 length followed by the payload. The
//! transport never looks inside a payload.
//!
//! Each connection gets a writer task draining a bounded per-peer queue
//! and a reader task feeding one receive queue shared by all peers, so
//! frames from one peer arrive in order while frames from different peers
//! interleave.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::NodeConfig;
use crate::directory::{Admission, Outbound, PeerDirectory, PeerEntry};
use crate::message::Handshake;
use crate::topology::{LifecycleState, NodeIdentity};
use crate::{ClusterError, NodeId};

/// A frame received from a peer: sender id and raw payload.
pub(crate) type InboundFrame = (NodeId, Bytes);

/// Writes one length-prefixed frame.
pub(crate) async fn write_frame<W>(w: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "frame larger than u32::MAX")
    })?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Reads one length-prefixed frame, rejecting frames over `max_len`.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
pub(crate) async fn read_frame<R>(r: &mut R, max_len: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {len} exceeds limit {max_len}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Ok(Some(Bytes::from(data)))
}

/// Owns the listener, outbound dials and per-connection tasks.
pub struct Transport {
    local_id: NodeId,
    config: Arc<NodeConfig>,
    is_controller: AtomicBool,
    directory: Arc<PeerDirectory>,
    inbound: mpsc::Sender<InboundFrame>,
    lifecycle: watch::Receiver<LifecycleState>,
    /// Addresses that exhausted their immediate dial attempts.
    retry: Mutex<Vec<SocketAddr>>,
    next_conn_id: AtomicU64,
}

impl Transport {
    pub(crate) fn new(
        config: Arc<NodeConfig>,
        directory: Arc<PeerDirectory>,
        inbound: mpsc::Sender<InboundFrame>,
        lifecycle: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            local_id: config.node_id,
            config,
            is_controller: AtomicBool::new(false),
            directory,
            inbound,
            lifecycle,
            retry: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Changes the controller flag sent in future handshakes.
    pub(crate) fn set_controller(&self, is_controller: bool) {
        self.is_controller.store(is_controller, Ordering::Release);
    }

    fn local_handshake(&self) -> Handshake {
        Handshake {
            node_id: self.local_id,
            is_controller_candidate: self.config.controller_candidate,
            ip: self.config.advertise_ip,
            client_port: self.config.client_port,
            is_controller: self.is_controller.load(Ordering::Acquire),
        }
    }

    fn is_running(&self) -> bool {
        self.lifecycle.borrow().is_running()
    }

    /// Binds the peer listener and spawns the accept loop.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when binding port 0.
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr, ClusterError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ClusterError::Network(format!("bind {}: {e}", self.config.bind_addr))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| ClusterError::Network(e.to_string()))?;
        info!(node = %self.local_id, %addr, "peer transport listening");

        let transport = Arc::clone(self);
        let mut lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = lifecycle.changed() => {
                        if changed.is_err() || !lifecycle.borrow().is_running() {
                            break;
                        }
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, remote)) => {
                                let transport = Arc::clone(&transport);
                                tokio::spawn(async move {
                                    if let Err(e) = transport.establish(stream, remote, false).await {
                                        debug!(%remote, "inbound peer connection failed: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                error!("peer accept error: {e}");
                                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }
            debug!("peer accept loop stopped");
        });

        Ok(addr)
    }

    /// Dials `addr` and performs the handshake.
    ///
    /// Dial failures are retried immediately up to the configured number of
    /// attempts; after that the address moves to the retry list and
    /// `Ok(false)` is returned. A handshake failure on an established
    /// socket is returned as an error.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<bool, ClusterError> {
        let mut last_err = None;
        for attempt in 1..=self.config.dial_attempts {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    self.establish(stream, addr, true).await?;
                    return Ok(true);
                }
                Err(e) => {
                    trace!(%addr, attempt, "dial failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            warn!(%addr, "peer unreachable, scheduling reconnect: {e}");
        }
        self.schedule_retry(addr);
        Ok(false)
    }

    fn schedule_retry(&self, addr: SocketAddr) {
        if let Ok(mut retry) = self.retry.lock() {
            if !retry.contains(&addr) {
                retry.push(addr);
            }
        }
    }

    /// Addresses waiting for the next reconnect sweep.
    pub fn pending_retries(&self) -> Vec<SocketAddr> {
        self.retry.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Queues `payload` for `node`. Returns false if the peer is unknown
    /// or its queue is full.
    pub fn send(&self, node: NodeId, payload: Bytes) -> bool {
        let Some(sender) = self.directory.sender(node) else {
            debug!(peer = %node, "send to unknown peer dropped");
            return false;
        };
        match sender.try_send(Outbound::Frame(payload)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %node, "send queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer = %node, "send to closed peer dropped");
                false
            }
        }
    }

    /// Drops the connection to `node`.
    pub fn disconnect(&self, node: NodeId) {
        if let Some(entry) = self.directory.remove(node) {
            entry.terminate();
            info!(peer = %node, "peer disconnected");
        }
    }

    /// Terminates every connection.
    pub(crate) fn disconnect_all(&self) {
        for entry in self.directory.drain() {
            entry.terminate();
        }
    }

    /// Runs the handshake on a fresh socket and starts its loops.
    async fn establish(
        self: &Arc<Self>,
        mut stream: TcpStream,
        remote: SocketAddr,
        outbound: bool,
    ) -> Result<(), ClusterError> {
        let _ = stream.set_nodelay(true);

        let local = self.local_handshake();
        stream
            .write_all(&local.encode())
            .await
            .map_err(|e| ClusterError::handshake(remote, e))?;
        let peer = Handshake::read_from(&mut stream)
            .await
            .map_err(|e| ClusterError::handshake(remote, e))?;

        if peer.node_id == self.local_id {
            return Err(ClusterError::handshake(
                remote,
                io::Error::new(io::ErrorKind::InvalidData, "peer has our node id"),
            ));
        }

        let identity = NodeIdentity {
            node_id: peer.node_id,
            ip: peer.ip,
            internal_port: remote.port(),
            client_port: peer.client_port,
            is_controller_candidate: peer.is_controller_candidate,
            is_controller: peer.is_controller,
        };
        let dialed_by = if outbound { self.local_id } else { peer.node_id };

        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity);
        let entry = PeerEntry {
            identity,
            sender: tx.clone(),
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            running: Arc::new(AtomicBool::new(true)),
        };
        let conn_id = entry.conn_id;
        let running = Arc::clone(&entry.running);

        if self.directory.admit(entry, dialed_by) == Admission::Rejected {
            debug!(peer = %peer.node_id, "duplicate connection dropped");
            return Ok(());
        }
        info!(
            peer = %peer.node_id,
            %remote,
            candidate = peer.is_controller_candidate,
            controller = peer.is_controller,
            "peer connected"
        );

        let (reader, writer) = stream.into_split();
        tokio::spawn(run_writer(peer.node_id, writer, rx, Arc::clone(&running)));
        tokio::spawn(Arc::clone(self).run_reader(peer.node_id, conn_id, reader, tx, running));
        Ok(())
    }

    async fn run_reader(
        self: Arc<Self>,
        peer: NodeId,
        conn_id: u64,
        mut reader: OwnedReadHalf,
        writer: mpsc::Sender<Outbound>,
        running: Arc<AtomicBool>,
    ) {
        let max = self.config.max_frame_size;
        let idle = self.config.idle_timeout;
        let mut lifecycle = self.lifecycle.clone();

        while running.load(Ordering::Acquire) {
            let read = async {
                match idle {
                    Some(limit) => tokio::time::timeout(limit, read_frame(&mut reader, max))
                        .await
                        .unwrap_or_else(|_| {
                            Err(io::Error::new(io::ErrorKind::TimedOut, "peer idle"))
                        }),
                    None => read_frame(&mut reader, max).await,
                }
            };

            tokio::pin!(read);

            // a partly read frame must survive lifecycle transitions
            let frame = loop {
                tokio::select! {
                    frame = &mut read => break Some(frame),
                    changed = lifecycle.changed() => {
                        if changed.is_err() || !lifecycle.borrow().is_running() {
                            break None;
                        }
                    }
                }
            };
            let Some(frame) = frame else { break };

            match frame {
                Ok(Some(payload)) => {
                    trace!(%peer, len = payload.len(), "frame received");
                    if self.inbound.send((peer, payload)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(%peer, "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(%peer, "peer connection error: {e}");
                    break;
                }
            }
        }

        running.store(false, Ordering::Release);
        let _ = writer.try_send(Outbound::Terminate);
        if self.directory.remove_connection(peer, conn_id).is_some() {
            info!(%peer, "peer removed");
        }
    }

    /// Retries every address on the retry list once.
    pub async fn reconnect_sweep(self: &Arc<Self>) {
        let pending = match self.retry.lock() {
            Ok(mut retry) => std::mem::take(&mut *retry),
            Err(_) => return,
        };
        for addr in pending {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = self.establish(stream, addr, true).await {
                        warn!(%addr, "reconnect handshake failed: {e}");
                        self.schedule_retry(addr);
                    }
                }
                Err(e) => {
                    trace!(%addr, "reconnect failed: {e}");
                    self.schedule_retry(addr);
                }
            }
        }
    }

    /// Spawns the periodic reconnect and housekeeping sweeps.
    pub(crate) fn spawn_sweeps(self: &Arc<Self>) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(transport.config.reconnect_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                if !transport.is_running() {
                    break;
                }
                transport.reconnect_sweep().await;
            }
        });

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(transport.config.housekeeping_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                if !transport.is_running() {
                    break;
                }
                for peer in transport.directory.prune() {
                    debug!(%peer, "dropped dead peer entry");
                }
                debug!(
                    peers = transport.directory.len(),
                    retrying = transport.pending_retries().len(),
                    "housekeeping"
                );
            }
        });
    }
}

async fn run_writer(
    peer: NodeId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Outbound>,
    running: Arc<AtomicBool>,
) {
    while let Some(item) = queue.recv().await {
        let payload = match item {
            Outbound::Frame(payload) => payload,
            Outbound::Terminate => break,
        };
        if !running.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = write_frame(&mut writer, &payload).await {
            debug!(%peer, "peer write failed: {e}");
            break;
        }
        trace!(%peer, len = payload.len(), "frame sent");
    }
    running.store(false, Ordering::Release);
    let _ = writer.shutdown().await;
}
