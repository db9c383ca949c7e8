//! # weft-dht
//!
//! The weft DHT engine: a Kademlia-style overlay over a pluggable
//! message-oriented peer link.
//!
//! This crate implements:
//! - the routing table: 256 k-buckets with LRU discipline and a FIFO
//!   replacement cache
//! - the request/response tracker correlating message ids with one-shot
//!   waiters and per-request deadlines
//! - the protocol engine dispatching inbound frames and driving replies
//! - iterative FIND_NODE / FIND_VALUE lookups with alpha-parallel probes
//! - the in-memory value store with TTLs, quorum publishing, republish
//!   and replica repair
//! - the maintenance scheduler (bucket refresh, seen-request GC,
//!   republish, repair, bucket-head liveness)
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | K (bucket size, reply fan-out) | 20 |
//! | alpha (lookup parallelism) | 3 |
//! | Write quorum W | 10 |
//! | Store TTL | 1 hour |
//! | Cache TTL | 15 minutes |
//! | Request deadline | 5 seconds |
//! | Ping deadline | 3 seconds |
//! | Existence-probe deadline | 2 seconds |

pub mod config;
pub mod engine;
pub mod link;
mod lookup;
pub mod routing;
pub mod store;
mod tasks;
pub mod tracker;

pub use config::DhtConfig;
pub use engine::Node;
pub use link::{LinkEvent, NodeHooks, PeerLink};

/// Bucket size and closest-set reply fan-out.
pub const K: usize = 20;

/// Lookup parallelism factor.
pub const ALPHA: usize = 3;

/// Number of buckets in the routing table (one per bit of the id space).
pub const NUM_BUCKETS: usize = weft_types::NUM_BUCKETS;

/// Write quorum: STORE acks required for a successful publish.
pub const WRITE_QUORUM: usize = K.div_ceil(2);

/// Maximum simultaneous dial hints in flight.
pub const MAX_DIALS: usize = 4;

/// Lifetime of a stored record in milliseconds (1 hour).
pub const STORE_TTL_MS: u64 = 3_600_000;

/// Lifetime of an opportunistically cached record (TTL / 4).
pub const CACHE_TTL_MS: u64 = STORE_TTL_MS / 4;

/// Bucket refresh interval in milliseconds (15 minutes).
pub const REFRESH_INTERVAL_MS: u64 = 900_000;

/// Seen-request garbage collection interval in milliseconds (1 minute).
pub const CLEANUP_INTERVAL_MS: u64 = 60_000;

/// Publisher republish interval in milliseconds (1 hour).
pub const REPUBLISH_INTERVAL_MS: u64 = 3_600_000;

/// Replica repair interval in milliseconds (10 seconds).
pub const REPAIR_INTERVAL_MS: u64 = 10_000;

/// Bucket-head liveness interval in milliseconds (5 minutes).
pub const LIVELINESS_INTERVAL_MS: u64 = 300_000;

/// Deadline for FIND_NODE / FIND_VALUE / STORE requests in milliseconds.
pub const RPC_TIMEOUT_MS: u64 = 5_000;

/// Deadline for liveness pings in milliseconds.
pub const PING_TIMEOUT_MS: u64 = 3_000;

/// Deadline for HAS_VALUE existence probes in milliseconds.
pub const HAS_VALUE_TIMEOUT_MS: u64 = 2_000;

/// Settling delay before publish STOREs, letting fresh peers connect.
pub const SETTLE_DELAY_MS: u64 = 1_500;

/// Pause between lookup retries when no candidate is connected yet.
pub const LOOKUP_RETRY_PAUSE_MS: u64 = 100;

/// Error types for DHT operations.
///
/// Protocol handlers absorb their errors locally (malformed frames are
/// dropped, timeouts fall through to waiters); only publishing surfaces
/// an error to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// Too few replicas acknowledged a publish before their deadlines.
    #[error("write quorum not met: {acks} of {needed} acks")]
    QuorumNotMet { acks: usize, needed: usize },
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
