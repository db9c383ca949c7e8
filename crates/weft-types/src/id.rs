//! Node and message identifiers with the XOR distance metric.
//!
//! Node ids are 256 bits. Two ids are compared for closeness to a target by
//! XOR-ing each with the target and comparing the results as big-endian
//! byte strings; `[u8; 32]`'s lexicographic `Ord` is exactly that order.
//!
//! The bucket index of a foreign id relative to the local id is the
//! position of the most-significant set bit of their XOR (0 = leftmost
//! bit), which equals the number of leading zero bits. Identical ids have
//! no bucket.

use std::cmp::Ordering;

use rand::RngCore;

use crate::{IdError, Result, ID_LEN, MSG_ID_LEN};

/// A 256-bit node identifier.
pub type NodeId = [u8; ID_LEN];

/// A 64-bit request correlation identifier.
pub type MessageId = [u8; MSG_ID_LEN];

/// Generate a fresh node id.
///
/// The id is the BLAKE3 digest of 32 fresh random bytes, which spreads ids
/// uniformly over the 256-bit space regardless of the RNG's bit structure.
pub fn new_node_id() -> NodeId {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    *blake3::hash(&seed).as_bytes()
}

/// Hash user key bytes into the 256-bit id space.
pub fn key_id(key: &[u8]) -> NodeId {
    *blake3::hash(key).as_bytes()
}

/// Generate a random message id for request correlation.
pub fn new_message_id() -> MessageId {
    let mut id = [0u8; MSG_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Compute the XOR distance between two node ids.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> NodeId {
    let mut out = [0u8; ID_LEN];
    for i in 0..ID_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare two ids by XOR distance to a target.
///
/// Returns `Less` when `a` is strictly closer to `target` than `b`.
pub fn cmp_distance(a: &NodeId, b: &NodeId, target: &NodeId) -> Ordering {
    xor_distance(a, target).cmp(&xor_distance(b, target))
}

/// Determine the bucket index of `other` relative to `local`.
///
/// The index is the number of leading zero bits of `local XOR other`:
/// bucket 0 holds ids differing in the first bit (most distant), bucket
/// 255 ids differing only in the last bit. Returns `None` iff the ids are
/// identical.
pub fn bucket_index(local: &NodeId, other: &NodeId) -> Option<usize> {
    let distance = xor_distance(local, other);
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            return Some(i * 8 + byte.leading_zeros() as usize);
        }
    }
    None
}

/// Encode a node id as lowercase hex.
pub fn node_id_to_hex(id: &NodeId) -> String {
    hex::encode(id)
}

/// Parse a node id from hex, enforcing the exact 32-byte length.
pub fn node_id_from_hex(s: &str) -> Result<NodeId> {
    let bytes = hex::decode(s).map_err(|e| IdError::InvalidHex(e.to_string()))?;
    let got = bytes.len();
    bytes.try_into().map_err(|_| IdError::InvalidLength {
        got,
        expected: ID_LEN,
    })
}
