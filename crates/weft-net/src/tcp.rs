//! TCP connection management and framing.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use weft_dht::link::{LinkEvent, PeerLink};
use weft_types::id::NodeId;
use weft_types::ID_LEN;

use crate::{NetError, Result, MAX_FRAME_LEN};

/// One registered connection: its frame queue and its reader task.
struct PeerHandle {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    reader: AbortHandle,
}

struct Shared {
    local_id: NodeId,
    peers: Mutex<HashMap<NodeId, PeerHandle>>,
    addrs: Mutex<HashMap<NodeId, SocketAddr>>,
    dialing: Mutex<HashSet<NodeId>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

/// A framed-TCP peer link. Cheap to clone; all clones share one
/// listener and connection set.
#[derive(Clone)]
pub struct TcpLink {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl TcpLink {
    /// Bind a listener and return the link plus its event stream.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Io`] if the socket cannot be bound.
    pub async fn bind(
        bind_addr: SocketAddr,
        local_id: NodeId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| NetError::Io(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetError::Io(e.to_string()))?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            local_id,
            peers: Mutex::new(HashMap::new()),
            addrs: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            events,
        });

        let link = Self {
            shared: Arc::clone(&shared),
            local_addr,
        };

        let accept_link = link.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let link = accept_link.clone();
                        tokio::spawn(async move {
                            if let Err(e) = link.attach(stream, None).await {
                                debug!(%remote, error = %e, "inbound connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        debug!(%local_addr, "TCP link listening");
        Ok((link, events_rx))
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record where a peer id can be dialed.
    pub fn add_address(&self, peer: NodeId, addr: SocketAddr) {
        lock(&self.shared.addrs).insert(peer, addr);
    }

    /// Dial a peer by address and complete the hello handshake.
    ///
    /// Returns the peer's node id. Used for bootstrap, where addresses
    /// are known but ids are not yet.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Io`] / [`NetError::Handshake`] on connection
    /// or handshake failure, and [`NetError::SelfConnection`] when the
    /// remote end presented this node's own id.
    pub async fn dial(&self, addr: SocketAddr) -> Result<NodeId> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetError::Io(e.to_string()))?;
        self.attach(stream, Some(addr)).await
    }

    /// Handshake on a fresh stream and register the connection.
    async fn attach(&self, mut stream: TcpStream, dialed: Option<SocketAddr>) -> Result<NodeId> {
        stream
            .write_all(&self.shared.local_id)
            .await
            .map_err(|e| NetError::Handshake(e.to_string()))?;

        let mut remote_id = [0u8; ID_LEN];
        stream
            .read_exact(&mut remote_id)
            .await
            .map_err(|e| NetError::Handshake(e.to_string()))?;

        if remote_id == self.shared.local_id {
            return Err(NetError::SelfConnection);
        }

        if let Some(addr) = dialed {
            lock(&self.shared.addrs).insert(remote_id, addr);
        }
        lock(&self.shared.dialing).remove(&remote_id);

        let (read_half, write_half) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        {
            let mut peers = lock(&self.shared.peers);
            if peers.contains_key(&remote_id) {
                // Simultaneous dials produced two links; keep the one
                // already registered and quietly close this stream.
                debug!(peer = hex::encode(remote_id), "duplicate connection dropped");
                return Ok(remote_id);
            }
            let reader = tokio::spawn(read_loop(self.clone(), remote_id, read_half));
            peers.insert(
                remote_id,
                PeerHandle {
                    frames: frames_tx,
                    reader: reader.abort_handle(),
                },
            );
        }
        tokio::spawn(write_loop(remote_id, write_half, frames_rx));

        debug!(peer = hex::encode(remote_id), "peer link open");
        let _ = self.shared.events.send(LinkEvent::Connected(remote_id));
        Ok(remote_id)
    }

    /// Tear down a peer's registration. Only the caller that actually
    /// removed the entry emits the disconnect event.
    fn detach(&self, peer: &NodeId) {
        let removed = lock(&self.shared.peers).remove(peer);
        if let Some(handle) = removed {
            handle.reader.abort();
            debug!(peer = hex::encode(peer), "peer link closed");
            let _ = self.shared.events.send(LinkEvent::Disconnected(*peer));
        }
    }
}

impl PeerLink for TcpLink {
    fn send(&self, peer: &NodeId, frame: Vec<u8>) {
        let peers = lock(&self.shared.peers);
        match peers.get(peer) {
            Some(handle) => {
                // A full teardown between lookup and send loses the
                // frame; deadlines cover it.
                let _ = handle.frames.send(frame);
            }
            None => debug!(peer = hex::encode(peer), "send to unconnected peer dropped"),
        }
    }

    fn connect_hint(&self, peer: &NodeId) {
        if self.is_connected(peer) {
            return;
        }
        let Some(addr) = lock(&self.shared.addrs).get(peer).copied() else {
            debug!(peer = hex::encode(peer), "no address for dial hint");
            return;
        };
        if !lock(&self.shared.dialing).insert(*peer) {
            return;
        }
        let link = self.clone();
        let peer = *peer;
        tokio::spawn(async move {
            if let Err(e) = link.dial(addr).await {
                debug!(peer = hex::encode(peer), error = %e, "dial hint failed");
            }
            lock(&link.shared.dialing).remove(&peer);
        });
    }

    fn drop_peer(&self, peer: &NodeId) {
        self.detach(peer);
    }

    fn is_connected(&self, peer: &NodeId) -> bool {
        lock(&self.shared.peers).contains_key(peer)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        lock(&self.shared.peers).keys().copied().collect()
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
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn route_signal(&self, peer: &NodeId, _frame: &[u8]) {
        // Plain TCP has no out-of-band signaling channel.
        debug!(peer = hex::encode(peer), "signal frame discarded");
    }
}

/// Read frames until the stream ends, then tear the peer down.
async fn read_loop(link: TcpLink, peer: NodeId, mut read_half: OwnedReadHalf) {
    loop {
        let mut len_buf = [0u8; 4];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            warn!(
                peer = hex::encode(peer),
                len, "oversized frame, closing link"
            );
            break;
        }
        let mut frame = vec![0u8; len];
        if read_half.read_exact(&mut frame).await.is_err() {
            break;
        }
        let _ = link.shared.events.send(LinkEvent::Frame(peer, frame));
    }
    link.detach(&peer);
}

/// Drain the frame queue onto the socket; ends when the peer detaches.
async fn write_loop(
    peer: NodeId,
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        let len = frame.len() as u32;
        if write_half.write_all(&len.to_be_bytes()).await.is_err()
            || write_half.write_all(&frame).await.is_err()
        {
            debug!(peer = hex::encode(peer), "write failed, link closing");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Lock a mutex, recovering the data on poisoning.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (TcpLink, mpsc::UnboundedReceiver<LinkEvent>, TcpLink, mpsc::UnboundedReceiver<LinkEvent>) {
        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let (a, a_events) = TcpLink::bind(any, [0xAAu8; 32]).await.expect("bind a");
        let (b, b_events) = TcpLink::bind(any, [0xBBu8; 32]).await.expect("bind b");
        (a, a_events, b, b_events)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within deadline")
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_dial_handshake_and_events() {
        let (a, mut a_events, b, mut b_events) = pair().await;

        let dialed = a.dial(b.local_addr()).await.expect("dial");
        assert_eq!(dialed, [0xBBu8; 32]);

        assert!(matches!(
            next_event(&mut a_events).await,
            LinkEvent::Connected(id) if id == [0xBBu8; 32]
        ));
        assert!(matches!(
            next_event(&mut b_events).await,
            LinkEvent::Connected(id) if id == [0xAAu8; 32]
        ));

        assert!(a.is_connected(&[0xBBu8; 32]));
        assert!(b.is_connected(&[0xAAu8; 32]));
        assert_eq!(a.connected_peers(), vec![[0xBBu8; 32]]);
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (a, mut a_events, b, mut b_events) = pair().await;
        a.dial(b.local_addr()).await.expect("dial");
        next_event(&mut a_events).await;
        next_event(&mut b_events).await;

        a.send(&[0xBBu8; 32], vec![1, 2, 3]);
        assert!(matches!(
            next_event(&mut b_events).await,
            LinkEvent::Frame(id, frame) if id == [0xAAu8; 32] && frame == vec![1, 2, 3]
        ));

        b.send(&[0xAAu8; 32], vec![9]);
        assert!(matches!(
            next_event(&mut a_events).await,
            LinkEvent::Frame(id, frame) if id == [0xBBu8; 32] && frame == vec![9]
        ));
    }

    #[tokio::test]
    async fn test_drop_peer_disconnects_both_sides() {
        let (a, mut a_events, b, mut b_events) = pair().await;
        a.dial(b.local_addr()).await.expect("dial");
        next_event(&mut a_events).await;
        next_event(&mut b_events).await;

        a.drop_peer(&[0xBBu8; 32]);
        assert!(matches!(
            next_event(&mut a_events).await,
            LinkEvent::Disconnected(id) if id == [0xBBu8; 32]
        ));
        assert!(!a.is_connected(&[0xBBu8; 32]));

        // The remote notices the close as well.
        assert!(matches!(
            next_event(&mut b_events).await,
            LinkEvent::Disconnected(id) if id == [0xAAu8; 32]
        ));
    }

    #[tokio::test]
    async fn test_connect_hint_uses_address_book() {
        let (a, mut a_events, b, _b_events) = pair().await;

        // Without an address the hint is a silent no-op.
        a.connect_hint(&[0xBBu8; 32]);
        assert!(!a.is_connected(&[0xBBu8; 32]));

        a.add_address([0xBBu8; 32], b.local_addr());
        a.connect_hint(&[0xBBu8; 32]);
        assert!(matches!(
            next_event(&mut a_events).await,
            LinkEvent::Connected(id) if id == [0xBBu8; 32]
        ));
        assert!(a.wait_for_peer(&[0xBBu8; 32], Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_dropped() {
        let (a, _a_events, _b, _b_events) = pair().await;
        // Must not panic or block.
        a.send(&[0xEEu8; 32], vec![0; 16]);
    }

    #[tokio::test]
    async fn test_self_dial_rejected() {
        let (a, _a_events, _b, _b_events) = pair().await;
        let result = a.dial(a.local_addr()).await;
        assert!(matches!(result, Err(NetError::SelfConnection)));
    }
}
