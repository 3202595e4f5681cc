//! Routing of decoded peer messages to the operations waiting for them.
//!
//! A single dispatcher task drains the shared receive queue, decodes each
//! payload and hands it to the [`Inbox`]. Operations that need a reply from
//! a peer call [`Inbox::wait`] with the kind they expect; a message nobody
//! waits for yet is kept in arrival order until someone asks for its kind.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::message::{MessageKind, PeerMessage};
use crate::topology::LifecycleState;
use crate::transport::InboundFrame;
use crate::{ClusterError, NodeId};

/// A message together with the peer that sent it.
pub type Delivery = (NodeId, PeerMessage);

#[derive(Default)]
struct InboxState {
    backlog: HashMap<MessageKind, VecDeque<Delivery>>,
    waiters: HashMap<MessageKind, VecDeque<oneshot::Sender<Delivery>>>,
    closed: bool,
}

/// Per-kind mailbox between the dispatcher and waiting operations.
#[derive(Default)]
pub struct Inbox {
    state: Mutex<InboxState>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands a message to the oldest waiter for its kind, or buffers it.
    pub fn deliver(&self, from: NodeId, msg: PeerMessage) {
        let kind = msg.kind();
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.closed {
            return;
        }

        let mut delivery = (from, msg);
        if let Some(waiters) = state.waiters.get_mut(&kind) {
            while let Some(waiter) = waiters.pop_front() {
                match waiter.send(delivery) {
                    Ok(()) => return,
                    // the waiting operation was dropped; try the next one
                    Err(returned) => delivery = returned,
                }
            }
        }
        state.backlog.entry(kind).or_default().push_back(delivery);
    }

    /// Waits for the next message of `kind`.
    ///
    /// Returns immediately with the oldest buffered message if there is
    /// one. Fails with [`ClusterError::Shutdown`] once the inbox is closed.
    pub async fn wait(&self, kind: MessageKind) -> Result<Delivery, ClusterError> {
        let rx = {
            let mut state = self.state.lock().map_err(|_| ClusterError::Shutdown)?;
            if state.closed {
                return Err(ClusterError::Shutdown);
            }
            if let Some(delivery) = state.backlog.get_mut(&kind).and_then(VecDeque::pop_front) {
                return Ok(delivery);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(kind).or_default().push_back(tx);
            rx
        };
        rx.await.map_err(|_| ClusterError::Shutdown)
    }

    /// Number of buffered messages of `kind`.
    pub fn pending(&self, kind: MessageKind) -> usize {
        self.state
            .lock()
            .map(|s| s.backlog.get(&kind).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Fails all current and future waiters.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.waiters.clear();
            state.backlog.clear();
        }
    }
}

/// Drains the shared receive queue into `inbox` while the node runs.
///
/// Undecodable payloads are logged and dropped. The inbox is closed when
/// the loop exits so no operation waits forever on a stopped node.
pub(crate) async fn run_dispatcher(
    mut inbound: mpsc::Receiver<InboundFrame>,
    inbox: std::sync::Arc<Inbox>,
    mut lifecycle: watch::Receiver<LifecycleState>,
) {
    loop {
        tokio::select! {
            changed = lifecycle.changed() => {
                if changed.is_err() || !lifecycle.borrow().is_running() {
                    break;
                }
            }
            frame = inbound.recv() => {
                let Some((from, payload)) = frame else {
                    break;
                };
                match PeerMessage::decode(&payload) {
                    Ok(msg) => {
                        trace!(peer = %from, kind = ?msg.kind(), "dispatching");
                        inbox.deliver(from, msg);
                    }
                    Err(e) => {
                        warn!(peer = %from, len = payload.len(), "dropping malformed frame: {e}");
                    }
                }
            }
        }
    }
    inbox.close();
    debug!("dispatcher stopped");
}
