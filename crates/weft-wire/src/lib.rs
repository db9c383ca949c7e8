//! # weft-wire
//!
//! Binary wire codec for the weft DHT protocol.
//!
//! Every frame is a single type byte followed by a fixed layout with
//! big-endian multi-byte fields. The transport delivers whole frames;
//! this crate never buffers or reassembles partial ones.
//!
//! ## Frame table
//!
//! | Type | Code | Body |
//! |---|---|---|
//! | PING | 0x01 | `node_id[32]` |
//! | PONG | 0x02 | `node_id[32]` |
//! | FIND_NODE | 0x03 | `msg_id[8] target[32]` |
//! | FIND_NODE_RESPONSE | 0x04 | `msg_id[8] count[1] node_id[32]*count` |
//! | STORE | 0x05 | `msg_id[8] key[32] len[4] record_json[len]` |
//! | FIND_VALUE | 0x06 | `msg_id[8] key[32]` |
//! | FIND_VALUE_RESPONSE | 0x07 | `msg_id[8] found[1]` then record or node list |
//! | STORE_ACK | 0x08 | `msg_id[8]` |
//! | HAS_VALUE | 0x09 | `msg_id[8] key[32]` |
//! | HAS_VALUE_RESPONSE | 0x0A | `msg_id[8] has[1]` |
//! | SIGNAL_* | 0xF0..0xF2 | opaque, forwarded to the transport |
//!
//! Record payloads are JSON with the value bytes in base64 (see
//! [`weft_types::record::Record`]).

pub mod codec;

/// Maximum record JSON payload length accepted or produced (64 KiB).
///
/// The length field is 4 bytes; the cap is enforced before any
/// allocation so a hostile length cannot balloon memory.
pub const MAX_RECORD_PAYLOAD: usize = 64 * 1024;

/// Maximum node ids in a single response (one-byte count field).
pub const MAX_NODES_PER_REPLY: usize = 255;

/// Error types for frame encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame ended before the layout was satisfied.
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// Bytes remained after the layout was fully parsed.
    #[error("trailing bytes after frame: {0}")]
    TrailingBytes(usize),

    /// The type byte is not in the protocol table.
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),

    /// A node list exceeds the one-byte count field.
    #[error("too many nodes for one response: {0}")]
    TooManyNodes(usize),

    /// A record payload length exceeds [`MAX_RECORD_PAYLOAD`].
    #[error("record payload too large: {len} bytes, max {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// A one-byte flag held something other than 0 or 1.
    #[error("invalid flag byte: {0:#04x}")]
    InvalidFlag(u8),

    /// The record JSON failed to encode or decode.
    #[error("record payload error: {0}")]
    Record(String),
}

/// Convenience result type for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;
