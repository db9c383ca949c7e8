//! Periodic maintenance.
//!
//! Five loops keep the overlay healthy: stale-bucket refresh, GC of the
//! seen-request set, publisher republish, replica repair, and liveness
//! probing of bucket heads. Each loop is idempotent, swallows its
//! errors, and stops on the shared shutdown signal.

use std::time::{Duration, Instant};

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use weft_types::id::NodeId;
use weft_types::NUM_BUCKETS;

use crate::engine::Node;
use crate::link::PeerLink;

impl<L: PeerLink> Node<L> {
    /// Spawn all maintenance loops for this node.
    ///
    /// The loops run until [`Node::shutdown`] fires; the returned handles
    /// let the host await their exit.
    pub fn start_maintenance(&self) -> Vec<JoinHandle<()>> {
        let cfg = self.config();
        vec![
            spawn_loop(self.clone(), cfg.refresh_interval, "bucket-refresh", |n| async move {
                n.refresh_stale_buckets().await;
            }),
            spawn_loop(self.clone(), cfg.seen_ttl, "seen-gc", |n| async move {
                n.gc_seen_requests().await;
            }),
            spawn_loop(self.clone(), cfg.republish_interval, "republish", |n| async move {
                n.republish_entries().await;
            }),
            spawn_loop(self.clone(), cfg.repair_interval, "repair", |n| async move {
                n.repair_replicas().await;
            }),
            spawn_loop(self.clone(), cfg.liveliness_interval, "bucket-ping", |n| async move {
                n.probe_bucket_heads().await;
            }),
        ]
    }

    /// Run a FIND_NODE toward a random id in every bucket that has not
    /// been used for a full refresh interval.
    pub async fn refresh_stale_buckets(&self) {
        let stale = {
            let routing = self.inner.routing.lock().await;
            routing.stale_buckets(self.inner.cfg.refresh_interval)
        };
        for bucket in stale {
            let target = {
                let routing = self.inner.routing.lock().await;
                routing.random_id_in_bucket(bucket)
            };
            debug!(bucket, "refreshing stale bucket");
            let _ = self.find_closest_nodes(target).await;
            self.inner.routing.lock().await.mark_bucket_used(bucket);
        }
    }

    /// Drop seen-request entries older than the seen TTL.
    pub async fn gc_seen_requests(&self) {
        let ttl = self.inner.cfg.seen_ttl;
        let now = Instant::now();
        let mut seen = self.inner.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, received| now.duration_since(*received) < ttl);
        let removed = before - seen.len();
        if removed > 0 {
            debug!(removed, "seen-request entries collected");
        }
    }

    /// Re-announce every record this node authored to the current K
    /// closest connected peers.
    pub async fn republish_entries(&self) {
        let keys = self.inner.store.lock().await.publisher_keys();
        for key in keys {
            let record = {
                let store = self.inner.store.lock().await;
                store.get_record(&key).cloned()
            };
            let Some(record) = record else {
                continue;
            };
            let targets = self.find_closest_nodes(key).await;
            let mut sent = 0usize;
            for target in targets {
                if self.inner.link.is_connected(&target) {
                    self.send_store_forget(&target, key, record.clone());
                    sent += 1;
                }
            }
            debug!(key = hex::encode(key), sent, "record republished");
        }
    }

    /// Reap expired entries, then heal missing replicas of authored
    /// records: probe the closest peers with HAS_VALUE and push a STORE
    /// where the record is absent.
    pub async fn repair_replicas(&self) {
        self.inner.store.lock().await.reap_expired();

        let keys = self.inner.store.lock().await.publisher_keys();
        for key in keys {
            let record = {
                let store = self.inner.store.lock().await;
                store.get_record(&key).cloned()
            };
            let Some(record) = record else {
                continue;
            };
            let targets = {
                let mut routing = self.inner.routing.lock().await;
                routing.find_closest(&key, self.inner.cfg.k)
            };
            for target in targets {
                if target == self.local_id() || !self.inner.link.is_connected(&target) {
                    continue;
                }
                if self.send_has_value(target, key).await == Some(false) {
                    debug!(
                        peer = hex::encode(target),
                        key = hex::encode(key),
                        "replica missing record, pushing"
                    );
                    self.send_store_forget(&target, key, record.clone());
                }
            }
            self.inner.store.lock().await.mark_repaired(&key);
        }
    }

    /// Ping the least-recently-seen head of every bucket; a head that
    /// stays silent is replaced and its link closed.
    pub async fn probe_bucket_heads(&self) {
        let heads: Vec<(usize, NodeId)> = {
            let routing = self.inner.routing.lock().await;
            (0..NUM_BUCKETS)
                .filter_map(|i| routing.head_of(i).map(|head| (i, head)))
                .collect()
        };

        let mut probes: JoinSet<()> = JoinSet::new();
        for (bucket, head) in heads {
            let node = self.clone();
            probes.spawn(async move {
                if node.ping(head).await {
                    return;
                }
                {
                    let mut routing = node.inner.routing.lock().await;
                    routing.remove(&head);
                    routing.promote_replacement(bucket);
                }
                node.inner.link.drop_peer(&head);
                debug!(
                    peer = hex::encode(head),
                    bucket, "silent bucket head replaced"
                );
            });
        }
        while probes.join_next().await.is_some() {}
    }
}

/// One maintenance loop: tick every `period` until shutdown.
fn spawn_loop<L, F, Fut>(node: Node<L>, period: Duration, task: &'static str, body: F) -> JoinHandle<()>
where
    L: PeerLink,
    F: Fn(Node<L>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    // Subscribe before spawning so a shutdown sent right after
    // start_maintenance() cannot be missed.
    let mut shutdown = node.subscribe_shutdown();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => body(node.clone()).await,
                _ = shutdown.recv() => {
                    debug!(task, "maintenance loop stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;

    /// A transport stub where nothing is ever connected.
    struct NullLink;

    impl PeerLink for NullLink {
        fn send(&self, _peer: &NodeId, _frame: Vec<u8>) {}
        fn connect_hint(&self, _peer: &NodeId) {}
        fn drop_peer(&self, _peer: &NodeId) {}
        fn is_connected(&self, _peer: &NodeId) -> bool {
            false
        }
        fn connected_peers(&self) -> Vec<NodeId> {
            Vec::new()
        }
        async fn wait_for_peer(&self, _peer: &NodeId, timeout: Duration) -> bool {
            tokio::time::sleep(timeout).await;
            false
        }
    }

    fn quick_config() -> DhtConfig {
        DhtConfig {
            seen_ttl: Duration::from_millis(20),
            rpc_timeout: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(20),
            has_value_timeout: Duration::from_millis(20),
            lookup_retry_pause: Duration::from_millis(1),
            lookup_stall_rounds: 1,
            ..DhtConfig::default()
        }
    }

    #[tokio::test]
    async fn test_gc_seen_requests() {
        let node = Node::new([1u8; 32], quick_config(), NullLink);
        node.inner
            .seen
            .lock()
            .await
            .insert(([2u8; 32], [0u8; 8]), Instant::now());

        node.gc_seen_requests().await;
        assert_eq!(node.inner.seen.lock().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        node.gc_seen_requests().await;
        assert!(node.inner.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_marks_buckets_used() {
        let cfg = DhtConfig {
            refresh_interval: Duration::from_millis(10),
            ..quick_config()
        };
        let node = Node::new([1u8; 32], cfg, NullLink);
        tokio::time::sleep(Duration::from_millis(30)).await;
        {
            let routing = node.inner.routing.lock().await;
            assert_eq!(routing.stale_buckets(node.config().refresh_interval).len(), 256);
        }

        // With an empty table every lookup terminates immediately; the
        // pass must still stamp each refreshed bucket.
        node.refresh_stale_buckets().await;
        let stale = {
            let routing = node.inner.routing.lock().await;
            routing.stale_buckets(node.config().refresh_interval)
        };
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn test_repair_with_no_publishes_is_quiet() {
        let node = Node::new([1u8; 32], quick_config(), NullLink);
        node.repair_replicas().await;
        node.republish_entries().await;
        node.probe_bucket_heads().await;
    }

    #[tokio::test]
    async fn test_maintenance_loops_stop_on_shutdown() {
        let node = Node::new([1u8; 32], quick_config(), NullLink);
        let handles = node.start_maintenance();
        node.shutdown();
        for handle in handles {
            handle.await.expect("loop exits cleanly");
        }
    }
}
