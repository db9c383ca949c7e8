//! The transport port.
//!
//! The engine never owns sockets. It talks to a [`PeerLink`]: a reliable,
//! ordered, message-oriented link that delivers whole frames and reports
//! peer arrival and departure. Connection establishment, NAT traversal
//! and session identity live behind this trait; the engine only assumes
//! that the peer id presented by the link matches the node id a peer
//! embeds in its PING/PONG frames, and drops peers where it does not.
//!
//! Transport events enter the engine through [`LinkEvent`] values fed to
//! [`pump`], which serializes them into the node in delivery order.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use weft_types::id::NodeId;

use crate::engine::Node;

/// An event from the transport.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// A peer link is now open.
    Connected(NodeId),
    /// A peer link closed.
    Disconnected(NodeId),
    /// A whole inbound frame from a connected peer.
    Frame(NodeId, Vec<u8>),
}

/// A reliable, ordered, message-oriented peer transport.
pub trait PeerLink: Send + Sync + 'static {
    /// Send a frame to a peer, best-effort. Frames to peers that are no
    /// longer connected are silently dropped; request deadlines cover
    /// correctness.
    fn send(&self, peer: &NodeId, frame: Vec<u8>);

    /// Ask the transport to try connecting to a peer. Asynchronous and
    /// allowed to fail silently.
    fn connect_hint(&self, peer: &NodeId);

    /// Force-close a peer's link.
    fn drop_peer(&self, peer: &NodeId);

    /// Whether a peer's link is currently open.
    fn is_connected(&self, peer: &NodeId) -> bool;

    /// Ids of all currently connected peers.
    fn connected_peers(&self) -> Vec<NodeId>;

    /// Wait until a peer connects, up to `timeout`. Returns whether the
    /// peer was connected when the wait ended.
    fn wait_for_peer(&self, peer: &NodeId, timeout: Duration) -> impl Future<Output = bool> + Send;

    /// Forward a transport-private signaling frame. The engine passes
    /// these through verbatim and never inspects them.
    fn route_signal(&self, peer: &NodeId, frame: &[u8]) {
        let _ = (peer, frame);
    }
}

/// Host-provided observer hooks.
///
/// The node holds one configured instance and only ever calls it; all
/// methods default to no-ops.
pub trait NodeHooks: Send + Sync + 'static {
    /// A peer link opened and was offered to the routing table.
    fn peer_connected(&self, peer: &NodeId) {
        let _ = peer;
    }

    /// A FIND_NODE response arrived, after self-filtering.
    fn find_node_response(&self, from: &NodeId, nodes: &[NodeId]) {
        let _ = (from, nodes);
    }
}

/// The default, silent hook set.
pub struct NoHooks;

impl NodeHooks for NoHooks {}

/// Drive a node from a transport event stream.
///
/// Events are applied strictly in arrival order, which preserves the
/// per-peer delivery order the engine relies on. Returns when the
/// sender side closes.
pub async fn pump<L: PeerLink>(node: Node<L>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Connected(peer) => node.peer_connected(peer).await,
            LinkEvent::Disconnected(peer) => node.peer_disconnected(peer).await,
            LinkEvent::Frame(peer, frame) => node.handle_frame(peer, &frame).await,
        }
    }
}
