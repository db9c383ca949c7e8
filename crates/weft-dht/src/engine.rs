//! The protocol engine.
//!
//! [`Node`] owns the routing table, the value store, the request tracker
//! and the seen-request set, and talks to the outside world through a
//! [`PeerLink`]. Inbound frames are dispatched here; every handler
//! absorbs its own errors so the engine never halts. Only publishing
//! surfaces an error ([`DhtError::QuorumNotMet`]) to the caller.
//!
//! State is shared behind one `Arc`; `Node` is a cheap clone handle, so
//! probes, lookups and maintenance tasks run as plain spawned futures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use weft_types::id::{cmp_distance, key_id, new_message_id, node_id_to_hex, MessageId, NodeId};
use weft_types::record::Record;
use weft_wire::codec::{Message, ValueReply};

use crate::config::DhtConfig;
use crate::link::{NoHooks, NodeHooks, PeerLink};
use crate::lookup;
use crate::routing::{AddOutcome, BucketSnapshot, RoutingTable};
use crate::store::ValueStore;
use crate::tracker::RequestTracker;
use crate::{DhtError, Result};

pub(crate) struct Inner<L> {
    pub(crate) local_id: NodeId,
    pub(crate) cfg: DhtConfig,
    pub(crate) link: L,
    pub(crate) routing: Mutex<RoutingTable>,
    pub(crate) store: Mutex<ValueStore>,
    pub(crate) tracker: RequestTracker,
    pub(crate) seen: Mutex<HashMap<(NodeId, MessageId), Instant>>,
    pub(crate) dials: Mutex<HashMap<NodeId, Instant>>,
    pub(crate) hooks: Box<dyn NodeHooks>,
    pub(crate) shutdown: broadcast::Sender<()>,
}

/// A DHT node: the engine plus its shared state.
pub struct Node<L: PeerLink> {
    pub(crate) inner: Arc<Inner<L>>,
}

impl<L: PeerLink> Clone for Node<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: PeerLink> Node<L> {
    /// Create a node with silent hooks.
    pub fn new(local_id: NodeId, cfg: DhtConfig, link: L) -> Self {
        Self::with_hooks(local_id, cfg, link, Box::new(NoHooks))
    }

    /// Create a node with host-provided observer hooks.
    pub fn with_hooks(
        local_id: NodeId,
        cfg: DhtConfig,
        link: L,
        hooks: Box<dyn NodeHooks>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let routing = RoutingTable::new(local_id, cfg.k);
        Self {
            inner: Arc::new(Inner {
                local_id,
                cfg,
                link,
                routing: Mutex::new(routing),
                store: Mutex::new(ValueStore::new()),
                tracker: RequestTracker::new(),
                seen: Mutex::new(HashMap::new()),
                dials: Mutex::new(HashMap::new()),
                hooks,
                shutdown,
            }),
        }
    }

    /// The local node id.
    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    /// The engine configuration.
    pub fn config(&self) -> &DhtConfig {
        &self.inner.cfg
    }

    /// The transport handle.
    pub fn link(&self) -> &L {
        &self.inner.link
    }

    /// Subscribe to the shutdown signal (used by maintenance loops).
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown.subscribe()
    }

    /// Stop all maintenance loops.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
    }

    // -----------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------

    /// A peer link opened.
    pub async fn peer_connected(&self, peer: NodeId) {
        if peer == self.inner.local_id {
            return;
        }
        debug!(peer = hex::encode(peer), "peer connected");
        self.inner.dials.lock().await.remove(&peer);
        self.inner.hooks.peer_connected(&peer);
        self.observe(peer).await;
    }

    /// A peer link closed. Pending requests to the peer are left to
    /// their deadlines.
    pub async fn peer_disconnected(&self, peer: NodeId) {
        debug!(peer = hex::encode(peer), "peer disconnected");
        self.inner.routing.lock().await.remove(&peer);
    }

    /// Dispatch one inbound frame from `peer`.
    pub async fn handle_frame(&self, peer: NodeId, frame: &[u8]) {
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = hex::encode(peer), error = %e, "malformed frame dropped");
                return;
            }
        };

        match msg {
            Message::Ping { node_id } => {
                if !self.check_identity(&peer, &node_id) {
                    return;
                }
                self.observe(peer).await;
                self.send_message(
                    &peer,
                    &Message::Pong {
                        node_id: self.inner.local_id,
                    },
                );
            }
            Message::Pong { node_id } => {
                if !self.check_identity(&peer, &node_id) {
                    return;
                }
                self.observe(peer).await;
                self.inner.tracker.complete_ping(&peer).await;
            }
            Message::FindNode { msg_id, target } => {
                self.observe(peer).await;
                if self.is_duplicate_request(peer, msg_id).await {
                    debug!(peer = hex::encode(peer), "duplicate FIND_NODE suppressed");
                    return;
                }
                let nodes = {
                    let mut routing = self.inner.routing.lock().await;
                    routing.find_closest(&target, self.inner.cfg.k)
                };
                self.send_message(&peer, &Message::FindNodeResponse { msg_id, nodes });
            }
            Message::FindNodeResponse { msg_id, nodes } => {
                self.observe(peer).await;
                let nodes = self.filter_and_absorb(nodes).await;
                self.inner.hooks.find_node_response(&peer, &nodes);
                if !self
                    .inner
                    .tracker
                    .complete(&msg_id, Message::FindNodeResponse { msg_id, nodes })
                    .await
                {
                    debug!(peer = hex::encode(peer), "late FIND_NODE response dropped");
                }
            }
            Message::Store {
                msg_id,
                key,
                record,
            } => {
                self.observe(peer).await;
                let accepted = {
                    let mut store = self.inner.store.lock().await;
                    store.upsert_if_newer(key, record, self.inner.cfg.store_ttl)
                };
                if accepted {
                    self.send_message(&peer, &Message::StoreAck { msg_id });
                } else {
                    debug!(
                        peer = hex::encode(peer),
                        key = hex::encode(key),
                        "stale STORE ignored"
                    );
                }
            }
            Message::StoreAck { msg_id } => {
                self.observe(peer).await;
                self.inner
                    .tracker
                    .complete(&msg_id, Message::StoreAck { msg_id })
                    .await;
            }
            Message::FindValue { msg_id, key } => {
                self.observe(peer).await;
                let held = {
                    let store = self.inner.store.lock().await;
                    store.get_record(&key).cloned()
                };
                let reply = match held {
                    Some(record) => ValueReply::Found(record),
                    None => {
                        let mut routing = self.inner.routing.lock().await;
                        ValueReply::Closest(routing.find_closest(&key, self.inner.cfg.k))
                    }
                };
                self.send_message(&peer, &Message::FindValueResponse { msg_id, reply });
            }
            Message::FindValueResponse { msg_id, reply } => {
                self.observe(peer).await;
                let reply = match reply {
                    ValueReply::Closest(nodes) => {
                        ValueReply::Closest(self.filter_and_absorb(nodes).await)
                    }
                    found => found,
                };
                self.inner
                    .tracker
                    .complete(&msg_id, Message::FindValueResponse { msg_id, reply })
                    .await;
            }
            Message::HasValue { msg_id, key } => {
                self.observe(peer).await;
                let has = self.inner.store.lock().await.contains(&key);
                self.send_message(&peer, &Message::HasValueResponse { msg_id, has });
            }
            Message::HasValueResponse { msg_id, has } => {
                self.observe(peer).await;
                self.inner
                    .tracker
                    .complete(&msg_id, Message::HasValueResponse { msg_id, has })
                    .await;
            }
            Message::Signal { .. } => {
                // Transport-private; hand the raw frame back untouched.
                self.inner.link.route_signal(&peer, frame);
            }
        }
    }

    // -----------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------

    /// Publish a value under `key`.
    ///
    /// Locates the K closest nodes to the key hash, replicates the record
    /// to them, and succeeds once the write quorum acks. Below quorum the
    /// record is not retained as published here.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::QuorumNotMet`] with the observed ack count.
    pub async fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let key_id = key_id(key);
        let targets = lookup::iterative_find_node(self, key_id).await;

        let record = Record {
            data: value.to_vec(),
            ts: now_ms(),
            publisher: node_id_to_hex(&self.inner.local_id),
        };

        // Give freshly-learned peers a moment to finish connecting.
        tokio::time::sleep(self.inner.cfg.settle_delay).await;

        let needed = self.inner.cfg.write_quorum;
        let mut probes: JoinSet<bool> = JoinSet::new();
        for target in targets {
            if !self.inner.link.is_connected(&target) {
                continue;
            }
            let node = self.clone();
            let record = record.clone();
            probes.spawn(async move { node.send_store(target, key_id, record).await });
        }

        let mut acks = 0usize;
        while let Some(joined) = probes.join_next().await {
            if matches!(joined, Ok(true)) {
                acks += 1;
                if acks >= needed {
                    probes.abort_all();
                    break;
                }
            }
        }

        if acks < needed {
            warn!(
                key = hex::encode(key_id),
                acks, needed, "publish failed below quorum"
            );
            return Err(DhtError::QuorumNotMet { acks, needed });
        }

        self.inner
            .store
            .lock()
            .await
            .insert_published(key_id, record, self.inner.cfg.store_ttl);
        info!(key = hex::encode(key_id), acks, "value published");
        Ok(())
    }

    /// Fetch the value under `key`: local hit first, then an iterative
    /// FIND_VALUE that converges on the newest record.
    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let key_id = key_id(key);
        {
            let store = self.inner.store.lock().await;
            if let Some(record) = store.get_record(&key_id) {
                return Some(record.data.clone());
            }
        }
        lookup::iterative_find_value(self, key_id)
            .await
            .map(|record| record.data)
    }

    /// Iteratively locate the closest known nodes to `target`.
    pub async fn find_closest_nodes(&self, target: NodeId) -> Vec<NodeId> {
        lookup::iterative_find_node(self, target).await
    }

    /// Probe one peer for liveness (3 second deadline).
    pub async fn ping(&self, peer: NodeId) -> bool {
        let rx = self
            .inner
            .tracker
            .register_ping(peer, self.inner.cfg.ping_timeout)
            .await;
        self.send_message(
            &peer,
            &Message::Ping {
                node_id: self.inner.local_id,
            },
        );
        rx.await.is_ok()
    }

    /// Whether this node is among the K closest it knows to `key_id`,
    /// i.e. holds primary responsibility for the key.
    pub async fn is_primary_replica(&self, key_id: NodeId) -> bool {
        let mut routing = self.inner.routing.lock().await;
        let closest = routing.find_closest(&key_id, self.inner.cfg.k);
        match closest.last() {
            Some(kth) if closest.len() >= self.inner.cfg.k => {
                cmp_distance(&self.inner.local_id, kth, &key_id).is_lt()
            }
            _ => true,
        }
    }

    // -----------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------

    /// Number of live routing-table entries.
    pub async fn routing_len(&self) -> usize {
        self.inner.routing.lock().await.len()
    }

    /// Snapshot of all non-empty buckets.
    pub async fn routing_dump(&self) -> Vec<BucketSnapshot> {
        self.inner.routing.lock().await.dump()
    }

    /// Number of unexpired stored records.
    pub async fn store_len(&self) -> usize {
        self.inner.store.lock().await.len()
    }

    /// Snapshot of the entry under a key id, if present and unexpired.
    pub async fn stored_entry(&self, key_id: &NodeId) -> Option<crate::store::StoreEntry> {
        self.inner.store.lock().await.get(key_id).cloned()
    }

    /// Currently connected peers, as reported by the transport.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.inner.link.connected_peers()
    }

    // -----------------------------------------------------------------
    // Outgoing requests
    // -----------------------------------------------------------------

    /// Ask `peer` for its closest nodes to `target`. A timeout removes
    /// the peer from the routing table.
    pub(crate) async fn send_find_node(&self, peer: NodeId, target: NodeId) -> Option<Vec<NodeId>> {
        let msg_id = new_message_id();
        let reply = self
            .request(peer, Message::FindNode { msg_id, target }, msg_id)
            .await;
        match reply {
            Some(Message::FindNodeResponse { nodes, .. }) => Some(nodes),
            Some(other) => {
                warn!(peer = hex::encode(peer), got = other.type_code(), "mismatched reply type");
                None
            }
            None => {
                self.inner.routing.lock().await.remove(&peer);
                None
            }
        }
    }

    /// Ask `peer` for the value under `key` or its closest nodes to it.
    /// A timeout removes the peer from the routing table.
    pub(crate) async fn send_find_value(&self, peer: NodeId, key: NodeId) -> Option<ValueReply> {
        let msg_id = new_message_id();
        let reply = self
            .request(peer, Message::FindValue { msg_id, key }, msg_id)
            .await;
        match reply {
            Some(Message::FindValueResponse { reply, .. }) => Some(reply),
            Some(other) => {
                warn!(peer = hex::encode(peer), got = other.type_code(), "mismatched reply type");
                None
            }
            None => {
                self.inner.routing.lock().await.remove(&peer);
                None
            }
        }
    }

    /// Replicate a record to `peer`, waiting for its ack.
    pub(crate) async fn send_store(&self, peer: NodeId, key: NodeId, record: Record) -> bool {
        let msg_id = new_message_id();
        let reply = self
            .request(
                peer,
                Message::Store {
                    msg_id,
                    key,
                    record,
                },
                msg_id,
            )
            .await;
        matches!(reply, Some(Message::StoreAck { .. }))
    }

    /// Replicate a record to `peer` without waiting. The unsolicited ack
    /// will find no waiter and be discarded.
    pub(crate) fn send_store_forget(&self, peer: &NodeId, key: NodeId, record: Record) {
        let msg_id = new_message_id();
        self.send_message(
            peer,
            &Message::Store {
                msg_id,
                key,
                record,
            },
        );
    }

    /// Ask `peer` whether it holds `key` (2 second deadline).
    pub(crate) async fn send_has_value(&self, peer: NodeId, key: NodeId) -> Option<bool> {
        let msg_id = new_message_id();
        let rx = self
            .inner
            .tracker
            .register(msg_id, self.inner.cfg.has_value_timeout)
            .await;
        self.send_message(&peer, &Message::HasValue { msg_id, key });
        match rx.await {
            Ok(Message::HasValueResponse { has, .. }) => Some(has),
            _ => None,
        }
    }

    /// Hint the transport to dial `peer`, bounded by the in-flight cap.
    pub(crate) async fn dial_hint(&self, peer: NodeId) {
        if self.inner.link.is_connected(&peer) {
            return;
        }
        let mut dials = self.inner.dials.lock().await;
        let now = Instant::now();
        // A dial that neither connected nor got cleaned up counts against
        // the cap only until the request deadline would have passed.
        dials.retain(|_, started| now.duration_since(*started) < self.inner.cfg.rpc_timeout);
        if dials.len() >= self.inner.cfg.max_dials || dials.contains_key(&peer) {
            return;
        }
        dials.insert(peer, now);
        drop(dials);
        self.inner.link.connect_hint(&peer);
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    /// Register, send, and await one correlated request (5s deadline).
    async fn request(&self, peer: NodeId, msg: Message, msg_id: MessageId) -> Option<Message> {
        let rx = self
            .inner
            .tracker
            .register(msg_id, self.inner.cfg.rpc_timeout)
            .await;
        self.send_message(&peer, &msg);
        rx.await.ok()
    }

    /// Encode and send one frame, best-effort.
    fn send_message(&self, peer: &NodeId, msg: &Message) {
        match msg.encode() {
            Ok(frame) => self.inner.link.send(peer, frame),
            Err(e) => warn!(peer = hex::encode(peer), error = %e, "frame not sent"),
        }
    }

    /// Verify that a PING/PONG body id matches the transport peer id.
    /// On mismatch the peer is dropped.
    fn check_identity(&self, peer: &NodeId, embedded: &NodeId) -> bool {
        if embedded == peer {
            return true;
        }
        warn!(
            peer = hex::encode(peer),
            embedded = hex::encode(embedded),
            "identity mismatch, dropping peer"
        );
        self.inner.link.drop_peer(peer);
        false
    }

    /// Record one contact with `id`: move it up its bucket, and when the
    /// bucket is full, probe the least-recently-seen head.
    pub(crate) async fn observe(&self, id: NodeId) {
        let outcome = self.inner.routing.lock().await.add_or_update(id);
        if let AddOutcome::Full { bucket } = outcome {
            let node = self.clone();
            tokio::spawn(async move { node.lru_probe(bucket, id).await });
        }
    }

    /// Decide a full bucket: keep a live head, or seat a replacement.
    ///
    /// A disconnected head is evicted immediately; a connected one gets a
    /// ping and survives by answering, in which case the newcomer stays
    /// in the replacement cache. The re-add is not retried if the bucket
    /// is full again after promotion.
    async fn lru_probe(&self, bucket: usize, newcomer: NodeId) {
        let Some(head) = self.inner.routing.lock().await.head_of(bucket) else {
            return;
        };

        let alive = self.inner.link.is_connected(&head) && self.ping(head).await;
        if alive {
            debug!(
                head = hex::encode(head),
                bucket, "bucket head alive, newcomer kept as replacement"
            );
            return;
        }

        let mut routing = self.inner.routing.lock().await;
        // The head may have been touched or removed while we probed; only
        // evict the same id we decided about.
        if routing.head_of(bucket) == Some(head) {
            routing.evict(bucket);
        } else {
            routing.remove(&head);
        }
        routing.promote_replacement(bucket);
        routing.add_or_update(newcomer);
    }

    /// Drop self and duplicates from a response list and feed the
    /// remaining observed ids into the routing table.
    async fn filter_and_absorb(&self, nodes: Vec<NodeId>) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::with_capacity(nodes.len());
        for id in nodes {
            if id == self.inner.local_id || out.contains(&id) {
                continue;
            }
            out.push(id);
        }
        for id in &out {
            self.observe(*id).await;
        }
        out
    }

    /// Record a request in the seen set; `true` means it was already there.
    async fn is_duplicate_request(&self, peer: NodeId, msg_id: MessageId) -> bool {
        self.inner
            .seen
            .lock()
            .await
            .insert((peer, msg_id), Instant::now())
            .is_some()
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
