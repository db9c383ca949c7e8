//! Iterative FIND_NODE / FIND_VALUE lookups.
//!
//! A lookup keeps a shortlist of the best K candidates seen so far and
//! probes them alpha at a time, preferring connected peers and hinting
//! the transport to dial the rest. It terminates when no unqueried
//! candidate remains or when a round fails to produce anything strictly
//! closer than the closest peer already queried.
//!
//! The value variant does not stop on the first record: it keeps probing
//! to convergence and merges records by the `(ts, publisher)` order, so
//! the newest version wins even when stale replicas answer first. Along
//! the way, the closest connected candidate that the responder did not
//! beat receives an opportunistic STORE of the current winner.

use std::cmp::Ordering;

use tokio::task::JoinSet;
use tracing::debug;

use weft_types::id::{cmp_distance, NodeId};
use weft_types::record::Record;
use weft_wire::codec::ValueReply;

use crate::engine::Node;
use crate::link::PeerLink;

/// One lookup candidate.
struct Candidate {
    id: NodeId,
    queried: bool,
}

/// The running best-K candidate list, sorted by distance to the target.
pub(crate) struct Shortlist {
    target: NodeId,
    local: NodeId,
    capacity: usize,
    entries: Vec<Candidate>,
}

impl Shortlist {
    fn new(target: NodeId, local: NodeId, capacity: usize, seed: Vec<NodeId>) -> Self {
        let mut shortlist = Self {
            target,
            local,
            capacity,
            entries: Vec::with_capacity(capacity),
        };
        shortlist.absorb(&seed);
        shortlist
    }

    /// Union new ids in, excluding self and duplicates, then re-sort by
    /// distance and truncate back to capacity. The sort is stable, so
    /// earlier-seen entries win exact ties.
    fn absorb(&mut self, ids: &[NodeId]) {
        for id in ids {
            if *id == self.local || self.entries.iter().any(|c| c.id == *id) {
                continue;
            }
            self.entries.push(Candidate {
                id: *id,
                queried: false,
            });
        }
        let target = self.target;
        self.entries
            .sort_by(|a, b| cmp_distance(&a.id, &b.id, &target));
        self.entries.truncate(self.capacity);
    }

    /// The first `alpha` not-yet-queried candidates, closest first.
    fn next_batch(&self, alpha: usize) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|c| !c.queried)
            .take(alpha)
            .map(|c| c.id)
            .collect()
    }

    fn mark_queried(&mut self, id: &NodeId) {
        if let Some(c) = self.entries.iter_mut().find(|c| c.id == *id) {
            c.queried = true;
        }
    }

    fn best(&self) -> Option<NodeId> {
        self.entries.first().map(|c| c.id)
    }

    fn ids(&self) -> Vec<NodeId> {
        self.entries.iter().map(|c| c.id).collect()
    }

    /// The closest candidate strictly closer to the target than
    /// `responder` that passes the `connected` test: the opportunistic
    /// cache destination.
    fn closer_cache_target(
        &self,
        responder: &NodeId,
        connected: impl Fn(&NodeId) -> bool,
    ) -> Option<NodeId> {
        self.entries
            .iter()
            .map(|c| c.id)
            .find(|id| {
                id != responder
                    && cmp_distance(id, responder, &self.target) == Ordering::Less
                    && connected(id)
            })
    }
}

/// What a single probe produced.
enum Probe {
    Nodes(Option<Vec<NodeId>>),
    Value(Option<ValueReply>),
}

struct Outcome {
    shortlist: Vec<NodeId>,
    record: Option<Record>,
}

/// Iteratively locate the closest known nodes to `target`.
pub(crate) async fn iterative_find_node<L: PeerLink>(node: &Node<L>, target: NodeId) -> Vec<NodeId> {
    run(node, target, false).await.shortlist
}

/// Iteratively search for the newest record under `key`.
///
/// On success the winner is also cached locally with the cache TTL.
pub(crate) async fn iterative_find_value<L: PeerLink>(
    node: &Node<L>,
    key: NodeId,
) -> Option<Record> {
    let outcome = run(node, key, true).await;
    if let Some(record) = &outcome.record {
        node.inner
            .store
            .lock()
            .await
            .upsert_if_newer(key, record.clone(), node.config().cache_ttl);
    }
    outcome.record
}

async fn run<L: PeerLink>(node: &Node<L>, target: NodeId, want_value: bool) -> Outcome {
    let cfg = node.config().clone();
    let seed = {
        let mut routing = node.inner.routing.lock().await;
        routing.find_closest(&target, cfg.k)
    };
    let mut shortlist = Shortlist::new(target, node.local_id(), cfg.k, seed);
    let mut closest_queried: Option<NodeId> = None;
    let mut best_record: Option<Record> = None;
    let mut stalls = 0u32;

    loop {
        let batch = shortlist.next_batch(cfg.alpha);
        if batch.is_empty() {
            break;
        }

        let (ready, waiting): (Vec<NodeId>, Vec<NodeId>) = batch
            .into_iter()
            .partition(|id| node.link().is_connected(id));

        for id in &waiting {
            node.dial_hint(*id).await;
        }

        if ready.is_empty() {
            stalls += 1;
            if stalls > cfg.lookup_stall_rounds {
                // Nothing in reach ever connected; skip the front
                // candidate so the search cannot spin forever.
                if let Some(first) = waiting.first() {
                    debug!(peer = hex::encode(first), "unreachable candidate skipped");
                    shortlist.mark_queried(first);
                }
                stalls = 0;
            } else {
                node.link()
                    .wait_for_peer(&waiting[0], cfg.lookup_retry_pause)
                    .await;
            }
            continue;
        }
        stalls = 0;

        for id in &ready {
            shortlist.mark_queried(id);
            closest_queried = Some(match closest_queried {
                Some(current) if cmp_distance(&current, id, &target) != Ordering::Greater => current,
                _ => *id,
            });
        }

        let mut probes: JoinSet<(NodeId, Probe)> = JoinSet::new();
        for id in ready {
            let node = node.clone();
            if want_value {
                probes.spawn(async move {
                    let reply = node.send_find_value(id, target).await;
                    (id, Probe::Value(reply))
                });
            } else {
                probes.spawn(async move {
                    let reply = node.send_find_node(id, target).await;
                    (id, Probe::Nodes(reply))
                });
            }
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((responder, probe)) = joined else {
                continue;
            };
            match probe {
                Probe::Nodes(Some(nodes)) => shortlist.absorb(&nodes),
                Probe::Value(Some(ValueReply::Closest(nodes))) => shortlist.absorb(&nodes),
                Probe::Value(Some(ValueReply::Found(record))) => {
                    let newer = best_record
                        .as_ref()
                        .map_or(true, |held| record.is_newer_than(held));
                    if newer {
                        best_record = Some(record);
                    }
                    // Seed the record one hop closer for the next reader.
                    let cache_to = shortlist
                        .closer_cache_target(&responder, |id| node.link().is_connected(id));
                    if let (Some(record), Some(to)) = (&best_record, cache_to) {
                        debug!(
                            peer = hex::encode(to),
                            key = hex::encode(target),
                            "caching record at closer node"
                        );
                        node.send_store_forget(&to, target, record.clone());
                    }
                }
                // A timed-out probe already cost the peer its routing
                // table slot; nothing to merge.
                Probe::Nodes(None) | Probe::Value(None) => {}
            }
        }

        // A round that produced nothing strictly closer than the best
        // peer already queried cannot improve the shortlist further.
        if let (Some(best), Some(queried)) = (shortlist.best(), closest_queried) {
            if cmp_distance(&best, &queried, &target) != Ordering::Less {
                break;
            }
        }
    }

    Outcome {
        shortlist: shortlist.ids(),
        record: best_record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tag: u8) -> NodeId {
        [tag; 32]
    }

    /// Ids at increasing distance from the zero target.
    fn near(tag: u8) -> NodeId {
        let mut id = [0u8; 32];
        id[31] = tag;
        id
    }

    #[test]
    fn test_seed_is_sorted_and_self_excluded() {
        let local = near(3);
        let sl = Shortlist::new([0u8; 32], local, 20, vec![near(9), near(1), local, near(4)]);
        assert_eq!(sl.ids(), vec![near(1), near(4), near(9)]);
    }

    #[test]
    fn test_absorb_dedups_and_truncates() {
        let mut sl = Shortlist::new([0u8; 32], id(0xEE), 3, vec![near(5), near(7)]);
        sl.absorb(&[near(5), near(1), near(2), near(9)]);
        // Capacity 3 keeps the closest three only.
        assert_eq!(sl.ids(), vec![near(1), near(2), near(5)]);
    }

    #[test]
    fn test_next_batch_skips_queried() {
        let mut sl = Shortlist::new(
            [0u8; 32],
            id(0xEE),
            20,
            vec![near(1), near(2), near(3), near(4)],
        );
        assert_eq!(sl.next_batch(3), vec![near(1), near(2), near(3)]);

        sl.mark_queried(&near(1));
        sl.mark_queried(&near(3));
        assert_eq!(sl.next_batch(3), vec![near(2), near(4)]);
    }

    #[test]
    fn test_queried_survive_absorb() {
        let mut sl = Shortlist::new([0u8; 32], id(0xEE), 20, vec![near(8)]);
        sl.mark_queried(&near(8));
        sl.absorb(&[near(2), near(8)]);
        assert_eq!(sl.next_batch(3), vec![near(2)]);
    }

    #[test]
    fn test_best_is_closest() {
        let sl = Shortlist::new([0u8; 32], id(0xEE), 20, vec![near(9), near(2)]);
        assert_eq!(sl.best(), Some(near(2)));
    }

    #[test]
    fn test_closer_cache_target() {
        let sl = Shortlist::new(
            [0u8; 32],
            id(0xEE),
            20,
            vec![near(1), near(4), near(9)],
        );

        // Responder near(9): the closest connected strictly-closer entry.
        assert_eq!(
            sl.closer_cache_target(&near(9), |_| true),
            Some(near(1))
        );
        // Connectivity filter applies.
        assert_eq!(
            sl.closer_cache_target(&near(9), |id| *id != near(1)),
            Some(near(4))
        );
        // Nothing is closer than the closest responder.
        assert_eq!(sl.closer_cache_target(&near(1), |_| true), None);
    }
}
