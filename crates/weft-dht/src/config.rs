//! Protocol tuning knobs.
//!
//! [`DhtConfig`] collects every timing and sizing parameter of the engine.
//! `Default` reproduces the protocol constants from the crate root; tests
//! and simulations compress the intervals instead of patching constants.

use std::time::Duration;

use crate::{
    ALPHA, CACHE_TTL_MS, CLEANUP_INTERVAL_MS, HAS_VALUE_TIMEOUT_MS, K, LIVELINESS_INTERVAL_MS,
    LOOKUP_RETRY_PAUSE_MS, MAX_DIALS, PING_TIMEOUT_MS, REFRESH_INTERVAL_MS, REPAIR_INTERVAL_MS,
    REPUBLISH_INTERVAL_MS, RPC_TIMEOUT_MS, SETTLE_DELAY_MS, STORE_TTL_MS, WRITE_QUORUM,
};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket size and closest-set fan-out (K).
    pub k: usize,
    /// Lookup probe parallelism (alpha).
    pub alpha: usize,
    /// STORE acks required for a successful publish (W).
    pub write_quorum: usize,
    /// Maximum simultaneous dial hints in flight.
    pub max_dials: usize,
    /// Lifetime of a received or published record.
    pub store_ttl: Duration,
    /// Lifetime of an opportunistically cached record.
    pub cache_ttl: Duration,
    /// How stale a bucket may get before a refresh lookup.
    pub refresh_interval: Duration,
    /// Age at which seen-request entries are collected.
    pub seen_ttl: Duration,
    /// Publisher republish period.
    pub republish_interval: Duration,
    /// Replica repair period.
    pub repair_interval: Duration,
    /// Bucket-head liveness probe period.
    pub liveliness_interval: Duration,
    /// Deadline for FIND_NODE / FIND_VALUE / STORE requests.
    pub rpc_timeout: Duration,
    /// Deadline for liveness pings.
    pub ping_timeout: Duration,
    /// Deadline for HAS_VALUE existence probes.
    pub has_value_timeout: Duration,
    /// Settling delay between a publish lookup and its STOREs.
    pub settle_delay: Duration,
    /// Pause between lookup rounds when no candidate is connected yet.
    pub lookup_retry_pause: Duration,
    /// Fruitless waits tolerated before a stalled candidate is skipped.
    pub lookup_stall_rounds: u32,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            write_quorum: WRITE_QUORUM,
            max_dials: MAX_DIALS,
            store_ttl: Duration::from_millis(STORE_TTL_MS),
            cache_ttl: Duration::from_millis(CACHE_TTL_MS),
            refresh_interval: Duration::from_millis(REFRESH_INTERVAL_MS),
            seen_ttl: Duration::from_millis(CLEANUP_INTERVAL_MS),
            republish_interval: Duration::from_millis(REPUBLISH_INTERVAL_MS),
            repair_interval: Duration::from_millis(REPAIR_INTERVAL_MS),
            liveliness_interval: Duration::from_millis(LIVELINESS_INTERVAL_MS),
            rpc_timeout: Duration::from_millis(RPC_TIMEOUT_MS),
            ping_timeout: Duration::from_millis(PING_TIMEOUT_MS),
            has_value_timeout: Duration::from_millis(HAS_VALUE_TIMEOUT_MS),
            settle_delay: Duration::from_millis(SETTLE_DELAY_MS),
            lookup_retry_pause: Duration::from_millis(LOOKUP_RETRY_PAUSE_MS),
            lookup_stall_rounds: 30,
        }
    }
}
