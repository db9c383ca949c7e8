//! # weft-types
//!
//! Identifier and record primitives shared by every weft crate.
//!
//! This crate defines:
//! - 256-bit node identifiers with the XOR distance metric and
//!   most-significant-differing-bit bucket indexing
//! - 64-bit random message identifiers for request correlation
//! - the versioned [`Record`](record::Record) value tuple with its
//!   (timestamp, publisher) total order

pub mod id;
pub mod record;

/// Length of a node identifier in bytes.
pub const ID_LEN: usize = 32;

/// Length of a message identifier in bytes.
pub const MSG_ID_LEN: usize = 8;

/// Number of routing buckets (one per bit of the 256-bit id space).
pub const NUM_BUCKETS: usize = 256;

/// Error types for identifier parsing.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// The input is not valid hex.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// The decoded value has the wrong length.
    #[error("invalid id length: {got} bytes, expected {expected}")]
    InvalidLength { got: usize, expected: usize },
}

/// Convenience result type for id parsing.
pub type Result<T> = std::result::Result<T, IdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(ID_LEN, 32);
        assert_eq!(MSG_ID_LEN, 8);
        assert_eq!(NUM_BUCKETS, 256);
    }

    #[test]
    fn test_error_display() {
        let err = IdError::InvalidLength {
            got: 16,
            expected: 32,
        };
        assert!(err.to_string().contains("16"));
        assert!(err.to_string().contains("32"));
    }
}
