//! Integration harness for the weft protocol.
//!
//! [`MemNet`] is a process-local overlay: every registered id gets a
//! [`MemLink`] whose frames and connect/disconnect events are routed
//! in-memory, with no sockets involved. Connections are symmetric pairs;
//! a `connect_hint` succeeds instantly against any registered id, which
//! exercises the engine's dial path deterministically.
//!
//! Raw endpoints (registered ids without a node behind them) let tests
//! inject hand-crafted frames, e.g. STOREs with chosen timestamps.
//!
//! The end-to-end scenarios live in `tests/`:
//! ```sh
//! cargo test -p weft-integration-tests
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use weft_dht::link::{pump, LinkEvent, PeerLink};
use weft_dht::{DhtConfig, Node};
use weft_types::id::NodeId;

struct NetInner {
    queues: Mutex<HashMap<NodeId, mpsc::UnboundedSender<LinkEvent>>>,
    connections: Mutex<HashSet<(NodeId, NodeId)>>,
}

/// A process-local overlay connecting [`MemLink`]s.
#[derive(Clone)]
pub struct MemNet {
    inner: Arc<NetInner>,
}

/// Normalize an unordered peer pair.
fn pair(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemNet {
    /// Create an empty overlay.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetInner {
                queues: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Register an id and get its link plus its event stream.
    pub fn register(&self, id: NodeId) -> (MemLink, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.queues).insert(id, tx);
        (
            MemLink {
                net: Arc::clone(&self.inner),
                local: id,
            },
            rx,
        )
    }

    /// Open a symmetric connection and deliver both connect events.
    pub fn connect(&self, a: &NodeId, b: &NodeId) {
        if a == b || !lock(&self.inner.connections).insert(pair(a, b)) {
            return;
        }
        let queues = lock(&self.inner.queues);
        if let Some(q) = queues.get(a) {
            let _ = q.send(LinkEvent::Connected(*b));
        }
        if let Some(q) = queues.get(b) {
            let _ = q.send(LinkEvent::Connected(*a));
        }
    }

    /// Close a connection and deliver both disconnect events.
    pub fn disconnect(&self, a: &NodeId, b: &NodeId) {
        if !lock(&self.inner.connections).remove(&pair(a, b)) {
            return;
        }
        let queues = lock(&self.inner.queues);
        if let Some(q) = queues.get(a) {
            let _ = q.send(LinkEvent::Disconnected(*b));
        }
        if let Some(q) = queues.get(b) {
            let _ = q.send(LinkEvent::Disconnected(*a));
        }
    }

    /// Whether a connection between two ids is open.
    pub fn connected(&self, a: &NodeId, b: &NodeId) -> bool {
        lock(&self.inner.connections).contains(&pair(a, b))
    }
}

impl Default for MemNet {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`MemNet`].
#[derive(Clone)]
pub struct MemLink {
    net: Arc<NetInner>,
    local: NodeId,
}

impl MemLink {
    fn net(&self) -> MemNet {
        MemNet {
            inner: Arc::clone(&self.net),
        }
    }
}

impl PeerLink for MemLink {
    fn send(&self, peer: &NodeId, frame: Vec<u8>) {
        if !lock(&self.net.connections).contains(&pair(&self.local, peer)) {
            return;
        }
        if let Some(q) = lock(&self.net.queues).get(peer) {
            let _ = q.send(LinkEvent::Frame(self.local, frame));
        }
    }

    fn connect_hint(&self, peer: &NodeId) {
        // Dials land instantly when the id exists; unknown ids fail
        // silently, as the port allows.
        if lock(&self.net.queues).contains_key(peer) {
            self.net().connect(&self.local, peer);
        }
    }

    fn drop_peer(&self, peer: &NodeId) {
        self.net().disconnect(&self.local, peer);
    }

    fn is_connected(&self, peer: &NodeId) -> bool {
        lock(&self.net.connections).contains(&pair(&self.local, peer))
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        lock(&self.net.connections)
            .iter()
            .filter_map(|(a, b)| {
                if a == &self.local {
                    Some(*b)
                } else if b == &self.local {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    async fn wait_for_peer(&self, peer: &NodeId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_connected(peer) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// A [`DhtConfig`] with compressed timings for in-memory scenarios.
pub fn quick_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_millis(250),
        ping_timeout: Duration::from_millis(150),
        has_value_timeout: Duration::from_millis(150),
        settle_delay: Duration::from_millis(20),
        lookup_retry_pause: Duration::from_millis(5),
        lookup_stall_rounds: 5,
        seen_ttl: Duration::from_millis(250),
        repair_interval: Duration::from_millis(100),
        ..DhtConfig::default()
    }
}

/// Spawn a node on the overlay and start pumping its events.
pub fn spawn_node(net: &MemNet, id: NodeId, cfg: DhtConfig) -> Node<MemLink> {
    let (link, events) = net.register(id);
    let node = Node::new(id, cfg, link);
    tokio::spawn(pump(node.clone(), events));
    node
}

/// Let queued events and probes drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
