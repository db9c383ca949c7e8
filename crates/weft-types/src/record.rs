//! Versioned value records and their conflict-resolution order.
//!
//! A record carries opaque value bytes, a millisecond publish timestamp,
//! and the hex id of the publishing node. Replicas resolve concurrent
//! writes with last-write-wins over the `(ts, publisher)` pair: later
//! timestamps win, and equal timestamps fall back to the larger publisher
//! hex. Publisher hex is fixed-length lowercase, so string order equals
//! numeric order.
//!
//! On the wire a record is JSON with the value bytes in base64; the
//! publisher field is literally named `pub`.

use serde::{Deserialize, Serialize};

/// A versioned value stored in the DHT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque value bytes, base64 in the JSON encoding.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Publish time in milliseconds since the Unix epoch.
    pub ts: u64,
    /// Hex node id of the publisher.
    #[serde(rename = "pub")]
    pub publisher: String,
}

impl Record {
    /// Return whether `self` wins over `other` under last-write-wins.
    ///
    /// `a` is newer than `b` iff `a.ts > b.ts`, or the timestamps are
    /// equal and `a.publisher > b.publisher` lexicographically. For
    /// distinct `(ts, publisher)` pairs exactly one direction holds.
    pub fn is_newer_than(&self, other: &Record) -> bool {
        self.ts > other.ts || (self.ts == other.ts && self.publisher > other.publisher)
    }
}

/// Serde support for byte vectors as base64 strings.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u64, publisher: &str) -> Record {
        Record {
            data: b"value".to_vec(),
            ts,
            publisher: publisher.to_string(),
        }
    }

    #[test]
    fn test_newer_by_timestamp() {
        let a = record(200, "aa");
        let b = record(100, "ff");
        assert!(a.is_newer_than(&b));
        assert!(!b.is_newer_than(&a));
    }

    #[test]
    fn test_newer_by_publisher_tiebreak() {
        let a = record(100, "bb");
        let b = record(100, "aa");
        assert!(a.is_newer_than(&b));
        assert!(!b.is_newer_than(&a));
    }

    #[test]
    fn test_order_is_total() {
        // For distinct (ts, pub) pairs exactly one direction wins.
        let pairs = [
            (record(1, "aa"), record(2, "aa")),
            (record(5, "aa"), record(5, "ab")),
            (record(9, "ff"), record(3, "00")),
        ];
        for (a, b) in &pairs {
            assert_ne!(a.is_newer_than(b), b.is_newer_than(a));
        }
    }

    #[test]
    fn test_equal_records_not_newer() {
        let a = record(7, "cc");
        let b = record(7, "cc");
        assert!(!a.is_newer_than(&b));
        assert!(!b.is_newer_than(&a));
    }

    #[test]
    fn test_json_shape() {
        let r = Record {
            data: b"world".to_vec(),
            ts: 1234,
            publisher: "ab".repeat(32),
        };
        let json = serde_json::to_value(&r).expect("serialize");
        assert_eq!(json["data"], "d29ybGQ=");
        assert_eq!(json["ts"], 1234);
        // The publisher field is named `pub` on the wire.
        assert!(json.get("pub").is_some());
        assert!(json.get("publisher").is_none());

        let back: Record = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, r);
    }

    #[test]
    fn test_json_rejects_bad_base64() {
        let result: std::result::Result<Record, _> =
            serde_json::from_str(r#"{"data":"%%%","ts":1,"pub":"aa"}"#);
        assert!(result.is_err());
    }
}
