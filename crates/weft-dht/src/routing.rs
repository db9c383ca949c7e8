//! Kademlia routing table: k-buckets with LRU discipline and a
//! replacement cache.
//!
//! Each of the 256 buckets holds up to K live peer ids ordered by
//! last-contact time (front = least-recently-seen) plus a FIFO cache of
//! up to K observed-but-unaccepted candidates. A full bucket never drops
//! a live member by itself: the engine probes the least-recently-seen
//! head and only evicts on failure, promoting the oldest replacement in
//! its place.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use weft_types::id::{bucket_index, cmp_distance, NodeId};
use weft_types::NUM_BUCKETS;

/// Result of offering an id to the routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// The id was appended to a live list with room.
    Added,
    /// The id was already live and moved to the most-recently-seen spot.
    Updated,
    /// The live list is full; the id landed in the replacement cache.
    /// The engine should probe the bucket head.
    Full { bucket: usize },
    /// The id is the local id and was not stored.
    Ignored,
}

/// A single k-bucket.
#[derive(Clone, Debug)]
struct Bucket {
    /// Live ids, front = least-recently-seen.
    live: VecDeque<NodeId>,
    /// Observed candidates waiting for a live slot, front = oldest.
    replacements: VecDeque<NodeId>,
    /// Last add, update, or closest-set read that drew from this bucket.
    last_used: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            live: VecDeque::new(),
            replacements: VecDeque::new(),
            last_used: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

/// The routing table: 256 buckets around a local id.
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

/// Inspection snapshot of one bucket.
#[derive(Clone, Debug)]
pub struct BucketSnapshot {
    /// Bucket index (0 = most distant).
    pub index: usize,
    /// Live ids, least-recently-seen first.
    pub live: Vec<NodeId>,
    /// Replacement candidates, oldest first.
    pub replacements: Vec<NodeId>,
}

impl RoutingTable {
    /// Create an empty table around `local_id` with bucket size `k`.
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        for _ in 0..NUM_BUCKETS {
            buckets.push(Bucket::new());
        }
        Self {
            local_id,
            k,
            buckets,
        }
    }

    /// The local node's id.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Offer an id to the table.
    ///
    /// A known live id is moved to the most-recently-seen position. A new
    /// id joins a live list with room (leaving the replacement cache if it
    /// was waiting there). When the live list is full the id is inserted
    /// into the replacement cache (FIFO, bounded at K, re-offering
    /// refreshes its position) and [`AddOutcome::Full`] asks the caller to
    /// probe the bucket head.
    pub fn add_or_update(&mut self, id: NodeId) -> AddOutcome {
        if id == self.local_id {
            return AddOutcome::Ignored;
        }
        let Some(idx) = bucket_index(&self.local_id, &id) else {
            return AddOutcome::Ignored;
        };

        let k = self.k;
        let bucket = &mut self.buckets[idx];
        bucket.touch();

        if let Some(pos) = bucket.live.iter().position(|x| *x == id) {
            bucket.live.remove(pos);
            bucket.live.push_back(id);
            return AddOutcome::Updated;
        }

        if bucket.live.len() < k {
            if let Some(pos) = bucket.replacements.iter().position(|x| *x == id) {
                bucket.replacements.remove(pos);
            }
            bucket.live.push_back(id);
            return AddOutcome::Added;
        }

        if let Some(pos) = bucket.replacements.iter().position(|x| *x == id) {
            bucket.replacements.remove(pos);
        }
        bucket.replacements.push_back(id);
        if bucket.replacements.len() > k {
            bucket.replacements.pop_front();
        }
        AddOutcome::Full { bucket: idx }
    }

    /// Remove an id from its live list. Replacement candidates are kept.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let Some(idx) = bucket_index(&self.local_id, id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.live.iter().position(|x| x == id) {
            bucket.live.remove(pos);
            debug!(peer = hex::encode(id), bucket = idx, "peer removed from routing table");
            return true;
        }
        false
    }

    /// The least-recently-seen live id of a bucket.
    pub fn head_of(&self, bucket: usize) -> Option<NodeId> {
        self.buckets.get(bucket)?.live.front().copied()
    }

    /// Drop the least-recently-seen live id of a bucket.
    pub fn evict(&mut self, bucket: usize) -> Option<NodeId> {
        let evicted = self.buckets.get_mut(bucket)?.live.pop_front();
        if let Some(id) = &evicted {
            debug!(peer = hex::encode(id), bucket, "bucket head evicted");
        }
        evicted
    }

    /// Move the oldest replacement, if any, to the live list's back.
    ///
    /// Does nothing when the live list is already full.
    pub fn promote_replacement(&mut self, bucket: usize) -> Option<NodeId> {
        let k = self.k;
        let b = self.buckets.get_mut(bucket)?;
        if b.live.len() >= k {
            return None;
        }
        let promoted = b.replacements.pop_front()?;
        b.live.push_back(promoted);
        debug!(peer = hex::encode(promoted), bucket, "replacement promoted");
        Some(promoted)
    }

    /// Return up to `count` known ids ordered by ascending XOR distance
    /// to `target`.
    ///
    /// Buckets are visited starting at the target's bucket and spreading
    /// outward with alternating offsets; every visited non-empty bucket
    /// counts as used. The collected ids are then sorted globally, so the
    /// result is exactly the closest-`count` set of the table.
    pub fn find_closest(&mut self, target: &NodeId, count: usize) -> Vec<NodeId> {
        let start = bucket_index(&self.local_id, target).unwrap_or(NUM_BUCKETS - 1);
        let mut ids: Vec<NodeId> = Vec::new();

        let mut visit = |bucket: &mut Bucket| {
            if !bucket.live.is_empty() {
                bucket.touch();
                ids.extend(bucket.live.iter().copied());
            }
        };

        visit(&mut self.buckets[start]);
        for offset in 1..NUM_BUCKETS {
            if let Some(below) = start.checked_sub(offset) {
                visit(&mut self.buckets[below]);
            }
            if start + offset < NUM_BUCKETS {
                visit(&mut self.buckets[start + offset]);
            }
        }

        ids.sort_by(|a, b| cmp_distance(a, b, target));
        ids.truncate(count);
        ids
    }

    /// Whether an id is currently live.
    pub fn contains(&self, id: &NodeId) -> bool {
        bucket_index(&self.local_id, id)
            .map(|idx| self.buckets[idx].live.iter().any(|x| x == id))
            .unwrap_or(false)
    }

    /// Whether an id is waiting in a replacement cache.
    pub fn in_replacements(&self, id: &NodeId) -> bool {
        bucket_index(&self.local_id, id)
            .map(|idx| self.buckets[idx].replacements.iter().any(|x| x == id))
            .unwrap_or(false)
    }

    /// Total number of live ids.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    /// Whether no live ids are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every non-empty bucket.
    pub fn dump(&self) -> Vec<BucketSnapshot> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.live.is_empty() || !b.replacements.is_empty())
            .map(|(index, b)| BucketSnapshot {
                index,
                live: b.live.iter().copied().collect(),
                replacements: b.replacements.iter().copied().collect(),
            })
            .collect()
    }

    /// Indices of buckets unused for longer than `interval`.
    pub fn stale_buckets(&self, interval: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| now.duration_since(b.last_used) > interval)
            .map(|(i, _)| i)
            .collect()
    }

    /// Mark a bucket as freshly used (after a refresh lookup).
    pub fn mark_bucket_used(&mut self, bucket: usize) {
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.touch();
        }
    }

    /// Generate a random id that maps into `bucket`.
    ///
    /// The id shares the local id's first `bucket` bits, differs at bit
    /// `bucket`, and is random after it, which is exactly the membership
    /// condition for that bucket.
    pub fn random_id_in_bucket(&self, bucket: usize) -> NodeId {
        let mut id = self.local_id;
        let mut rng = rand::thread_rng();

        flip_bit(&mut id, bucket);
        for bit in (bucket + 1)..(NUM_BUCKETS) {
            if rng.gen::<bool>() {
                flip_bit(&mut id, bit);
            }
        }
        id
    }
}

/// Flip one bit, numbering from the most significant bit of byte 0.
fn flip_bit(id: &mut NodeId, bit: usize) {
    id[bit / 8] ^= 0x80 >> (bit % 8);
}
