//! Request/response correlation.
//!
//! Every outgoing request registers a one-shot waiter keyed by its
//! message id, together with a timer task for the deadline. The timer
//! removes the waiter *before* the timeout is observable, so a response
//! arriving after the deadline finds no waiter and is dropped; the
//! oneshot channel makes completion at-most-once by construction.
//!
//! PING/PONG carries no correlation id, so pings wait in a parallel
//! table keyed by peer id. Registering a new ping for a peer supersedes
//! the previous waiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use weft_types::id::{MessageId, NodeId};
use weft_wire::codec::Message;

struct Waiter {
    tx: oneshot::Sender<Message>,
    timer: JoinHandle<()>,
}

struct PingWaiter {
    tx: oneshot::Sender<()>,
    timer: JoinHandle<()>,
}

/// Tracks in-flight requests and pings.
pub struct RequestTracker {
    waiters: Arc<Mutex<HashMap<MessageId, Waiter>>>,
    pings: Arc<Mutex<HashMap<NodeId, PingWaiter>>>,
}

impl RequestTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
            pings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a waiter for `msg_id` with the given deadline.
    ///
    /// The returned receiver yields the decoded response, or an error
    /// once the deadline passes and the waiter has been discarded.
    pub async fn register(&self, msg_id: MessageId, deadline: Duration) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        // Hold the lock across spawn + insert: the timer cannot observe
        // the map before the waiter is in it, however short the deadline.
        let mut waiters = self.waiters.lock().await;
        let timer = {
            let waiters = Arc::clone(&self.waiters);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if waiters.lock().await.remove(&msg_id).is_some() {
                    debug!(msg_id = hex::encode(msg_id), "request timed out");
                }
            })
        };
        waiters.insert(msg_id, Waiter { tx, timer });
        rx
    }

    /// Complete the waiter for `msg_id` with a response.
    ///
    /// Returns `false` when no waiter exists (late delivery after its
    /// timeout, or a response that was never requested); the message is
    /// then discarded by the caller.
    pub async fn complete(&self, msg_id: &MessageId, response: Message) -> bool {
        let waiter = self.waiters.lock().await.remove(msg_id);
        match waiter {
            Some(w) => {
                w.timer.abort();
                // The receiver may have been dropped; either way the
                // waiter fired at most once.
                let _ = w.tx.send(response);
                true
            }
            None => false,
        }
    }

    /// Register a ping waiter for `peer`, superseding any previous one.
    pub async fn register_ping(&self, peer: NodeId, deadline: Duration) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut pings = self.pings.lock().await;
        let timer = {
            let pings = Arc::clone(&self.pings);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if pings.lock().await.remove(&peer).is_some() {
                    debug!(peer = hex::encode(peer), "ping timed out");
                }
            })
        };
        if let Some(old) = pings.insert(peer, PingWaiter { tx, timer }) {
            old.timer.abort();
        }
        rx
    }

    /// Complete the ping waiter for `peer`, if any.
    pub async fn complete_ping(&self, peer: &NodeId) -> bool {
        let waiter = self.pings.lock().await.remove(peer);
        match waiter {
            Some(w) => {
                w.timer.abort();
                let _ = w.tx.send(());
                true
            }
            None => false,
        }
    }

    /// Number of in-flight request waiters (pings excluded).
    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(msg_id: MessageId) -> Message {
        Message::StoreAck { msg_id }
    }

    #[tokio::test]
    async fn test_complete_delivers_response() {
        let tracker = RequestTracker::new();
        let msg_id = [1u8; 8];
        let rx = tracker.register(msg_id, Duration::from_secs(5)).await;

        assert!(tracker.complete(&msg_id, ack(msg_id)).await);
        let got = rx.await.expect("response");
        assert_eq!(got, ack(msg_id));
        assert_eq!(tracker.pending().await, 0);
    }

    #[tokio::test]
    async fn test_completion_is_at_most_once() {
        let tracker = RequestTracker::new();
        let msg_id = [2u8; 8];
        let _rx = tracker.register(msg_id, Duration::from_secs(5)).await;

        assert!(tracker.complete(&msg_id, ack(msg_id)).await);
        assert!(!tracker.complete(&msg_id, ack(msg_id)).await);
    }

    #[tokio::test]
    async fn test_timeout_discards_waiter() {
        let tracker = RequestTracker::new();
        let msg_id = [3u8; 8];
        let rx = tracker.register(msg_id, Duration::from_millis(10)).await;

        // The deadline passes; the receiver observes the drop.
        assert!(rx.await.is_err());
        assert_eq!(tracker.pending().await, 0);

        // A late response finds no waiter.
        assert!(!tracker.complete(&msg_id, ack(msg_id)).await);
    }

    #[tokio::test]
    async fn test_unknown_completion_is_discarded() {
        let tracker = RequestTracker::new();
        assert!(!tracker.complete(&[9u8; 8], ack([9u8; 8])).await);
    }

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let tracker = RequestTracker::new();
        let peer = [7u8; 32];
        let rx = tracker.register_ping(peer, Duration::from_secs(3)).await;

        assert!(tracker.complete_ping(&peer).await);
        assert!(rx.await.is_ok());
        assert!(!tracker.complete_ping(&peer).await);
    }

    #[tokio::test]
    async fn test_ping_timeout() {
        let tracker = RequestTracker::new();
        let peer = [8u8; 32];
        let rx = tracker.register_ping(peer, Duration::from_millis(10)).await;
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_reping_supersedes() {
        let tracker = RequestTracker::new();
        let peer = [6u8; 32];
        let rx_old = tracker.register_ping(peer, Duration::from_secs(3)).await;
        let rx_new = tracker.register_ping(peer, Duration::from_secs(3)).await;

        assert!(tracker.complete_ping(&peer).await);
        assert!(rx_old.await.is_err(), "superseded waiter must not fire");
        assert!(rx_new.await.is_ok());
    }
}
