//! In-memory table of connected peers.
//!
//! One entry per live connection, keyed by node id. The entry holds the
//! peer's identity from the handshake and the sending half of its writer
//! queue. Entries are created by the transport once a handshake completes
//! and removed when the connection goes away.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::topology::NodeIdentity;
use crate::NodeId;

/// An item on a peer's send queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A complete payload to be length-framed and written.
    Frame(Bytes),
    /// Stops the writer. Never written to the socket.
    Terminate,
}

/// A connected peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerEntry {
    pub identity: NodeIdentity,
    pub sender: mpsc::Sender<Outbound>,
    /// Local id of the connection backing this entry.
    pub conn_id: u64,
    /// Cleared when either loop of the connection exits.
    pub running: Arc<AtomicBool>,
}

impl PeerEntry {
    /// Stops both loops of the connection.
    pub fn terminate(&self) {
        self.running.store(false, Ordering::Release);
        // a full queue means the writer is busy and will see the flag
        let _ = self.sender.try_send(Outbound::Terminate);
    }

    fn is_dead(&self) -> bool {
        !self.running.load(Ordering::Acquire) || self.sender.is_closed()
    }
}

/// What happened when a connection was offered to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// First connection to this peer.
    Added,
    /// Replaced an earlier connection to the same peer.
    Replaced,
    /// Another connection to the same peer is preferred; drop this one.
    Rejected,
}

/// Concurrent map of connected peers.
#[derive(Debug)]
pub struct PeerDirectory {
    local_id: NodeId,
    peers: DashMap<NodeId, PeerEntry>,
    count_tx: watch::Sender<usize>,
}

impl PeerDirectory {
    pub fn new(local_id: NodeId) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            local_id,
            peers: DashMap::new(),
            count_tx,
        }
    }

    /// Registers a connection that finished its handshake.
    ///
    /// When two nodes dial each other at the same time, both ends keep the
    /// connection dialed by the smaller node id, so they agree on which
    /// link survives.
    pub(crate) fn admit(&self, entry: PeerEntry, dialed_by: NodeId) -> Admission {
        let peer = entry.identity.node_id;
        let preferred_dialer = self.local_id.min(peer);

        let admission = match self.peers.entry(peer) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Admission::Added
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().is_dead() || dialed_by == preferred_dialer {
                    let old = slot.insert(entry);
                    old.terminate();
                    Admission::Replaced
                } else {
                    Admission::Rejected
                }
            }
        };
        debug!(%peer, ?admission, "peer connection offered");
        self.publish_count();
        admission
    }

    /// Removes `node` if its entry still belongs to connection `conn_id`.
    pub(crate) fn remove_connection(&self, node: NodeId, conn_id: u64) -> Option<PeerEntry> {
        let removed = self
            .peers
            .remove_if(&node, |_, entry| entry.conn_id == conn_id)
            .map(|(_, entry)| entry);
        if removed.is_some() {
            self.publish_count();
        }
        removed
    }

    /// Removes `node` regardless of which connection backs it.
    pub(crate) fn remove(&self, node: NodeId) -> Option<PeerEntry> {
        let removed = self.peers.remove(&node).map(|(_, entry)| entry);
        if removed.is_some() {
            self.publish_count();
        }
        removed
    }

    /// Removes and returns every entry.
    pub(crate) fn drain(&self) -> Vec<PeerEntry> {
        let ids = self.ids();
        let drained = ids.into_iter().filter_map(|id| self.remove(id)).collect();
        self.publish_count();
        drained
    }

    /// Drops entries whose loops have exited. Returns the dropped ids.
    pub(crate) fn prune(&self) -> Vec<NodeId> {
        let dead: Vec<(NodeId, u64)> = self
            .peers
            .iter()
            .filter(|e| e.value().is_dead())
            .map(|e| (*e.key(), e.value().conn_id))
            .collect();
        dead.into_iter()
            .filter_map(|(id, conn)| self.remove_connection(id, conn).map(|_| id))
            .collect()
    }

    pub(crate) fn sender(&self, node: NodeId) -> Option<mpsc::Sender<Outbound>> {
        self.peers.get(&node).map(|e| e.sender.clone())
    }

    /// Identity of a connected peer.
    pub fn get(&self, node: NodeId) -> Option<NodeIdentity> {
        self.peers.get(&node).map(|e| e.identity.clone())
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.peers.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All connected peer ids, ascending.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Connected peers eligible for election, ascending.
    pub fn candidates(&self) -> Vec<NodeId> {
        self.filter_ids(|identity| identity.is_controller_candidate)
    }

    /// Connected peers that never take part in elections, ascending.
    pub fn non_candidates(&self) -> Vec<NodeId> {
        self.filter_ids(|identity| !identity.is_controller_candidate)
    }

    /// The connected peer flagged as controller, if any.
    pub fn controller(&self) -> Option<NodeId> {
        self.peers
            .iter()
            .find(|e| e.value().identity.is_controller)
            .map(|e| *e.key())
    }

    /// Flags `node` as controller and clears the flag everywhere else.
    pub fn set_controller(&self, node: NodeId) {
        for mut entry in self.peers.iter_mut() {
            let is_controller = *entry.key() == node;
            entry.value_mut().identity.is_controller = is_controller;
        }
    }

    /// Client-facing addresses of all connected peers, ordered by node id.
    pub fn client_addrs(&self) -> Vec<(NodeId, SocketAddr)> {
        let mut addrs: Vec<(NodeId, SocketAddr)> = self
            .peers
            .iter()
            .map(|e| (*e.key(), e.value().identity.client_addr()))
            .collect();
        addrs.sort_by_key(|(id, _)| *id);
        addrs
    }

    /// Watches the number of connected peers.
    pub fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    fn filter_ids(&self, pred: impl Fn(&NodeIdentity) -> bool) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|e| pred(&e.value().identity))
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    fn publish_count(&self) {
        self.count_tx.send_replace(self.peers.len());
    }
}
