//! # weft-net
//!
//! A framed-TCP transport implementing the [`weft_dht::PeerLink`] port.
//!
//! Every connection starts with a hello handshake: both sides write
//! their 32-byte node id and read the peer's. After that, frames flow as
//! `[length:4 BE][bytes:length]` in both directions. Peer identity at
//! this layer is exactly the handshake id; the engine cross-checks it
//! against the ids embedded in PING/PONG and asks for a drop on
//! mismatch.
//!
//! Dialing needs an address, so the link keeps an id-to-address book fed
//! by explicit registration and by successful dials. A `connect_hint`
//! for an id without a known address fails silently, as the port allows.

pub mod tcp;

pub use tcp::TcpLink;

/// Maximum accepted frame length: the wire-level record cap plus header
/// headroom. Enforced before allocation on the read path.
pub const MAX_FRAME_LEN: usize = 128 * 1024;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Socket or stream I/O failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// The hello handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer presented this node's own id.
    #[error("connected to self")]
    SelfConnection,
}

/// Convenience result type for transport operations.
pub type Result<T> = std::result::Result<T, NetError>;
