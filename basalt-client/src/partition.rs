//! Partition bounds and partition-key helpers.
//!
//! A tablet owns a contiguous range of the partition-key space. Keys are
//! opaque byte strings ordered lexicographically; an empty bound means
//! "unbounded" on that side. Hash-partitioned tables prefix every key with
//! a big-endian 16-bit hash code.

use bytes::{BufMut, Bytes, BytesMut};

/// Width of the leading hash code on hash-partitioned keys, in bytes.
pub const PARTITION_HASH_CODE_LEN: usize = 2;

/// The key range `[start, end)` owned by one tablet.
///
/// An empty `start` means the range is unbounded below; an empty `end`
/// means unbounded above.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Partition {
    start: Bytes,
    end: Bytes,
}

impl Partition {
    /// Creates a partition covering `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if both bounds are non-empty and `start >= end`.
    #[must_use]
    pub fn new(start: Bytes, end: Bytes) -> Self {
        assert!(
            start.is_empty() || end.is_empty() || start < end,
            "partition start must be < end"
        );
        Self { start, end }
    }

    /// Creates the partition covering the whole key space.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            start: Bytes::new(),
            end: Bytes::new(),
        }
    }

    /// Returns true if this partition contains the given partition key.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        (self.start.is_empty() || key >= self.start.as_ref())
            && (self.end.is_empty() || key < self.end.as_ref())
    }

    /// The inclusive lower bound, empty if unbounded below.
    #[must_use]
    pub const fn start_key(&self) -> &Bytes {
        &self.start
    }

    /// The exclusive upper bound, empty if unbounded above.
    #[must_use]
    pub const fn end_key(&self) -> &Bytes {
        &self.end
    }
}

/// Decodes the leading hash code from a hash-partitioned key.
///
/// # Panics
///
/// Panics if the key is shorter than [`PARTITION_HASH_CODE_LEN`].
#[must_use]
pub fn decode_hash_code(partition_key: &[u8]) -> u16 {
    assert!(
        partition_key.len() >= PARTITION_HASH_CODE_LEN,
        "partition key too short for a hash code: {} bytes",
        partition_key.len()
    );
    u16::from_be_bytes([partition_key[0], partition_key[1]])
}

/// Encodes a hash code as the leading bytes of a partition key.
#[must_use]
pub fn encode_hash_code(hash_code: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(PARTITION_HASH_CODE_LEN);
    buf.put_u16(hash_code);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_key() {
        let partition = Partition::new(Bytes::from_static(b"\x00\x10"), Bytes::from_static(b"\x00\x20"));

        assert!(partition.contains_key(b"\x00\x10"));
        assert!(partition.contains_key(b"\x00\x15abc"));
        assert!(partition.contains_key(b"\x00\x1f\xff"));
        assert!(!partition.contains_key(b"\x00\x0f"));
        assert!(!partition.contains_key(b"\x00\x20"));
        assert!(!partition.contains_key(b"\x00\x21"));
    }

    #[test]
    fn test_unbounded_contains_everything() {
        let partition = Partition::unbounded();
        assert!(partition.contains_key(b""));
        assert!(partition.contains_key(b"\xff\xff\xff"));
    }

    #[test]
    fn test_half_open_bounds() {
        let lower = Partition::new(Bytes::new(), Bytes::from_static(b"\x80\x00"));
        assert!(lower.contains_key(b""));
        assert!(lower.contains_key(b"\x7f\xff"));
        assert!(!lower.contains_key(b"\x80\x00"));

        let upper = Partition::new(Bytes::from_static(b"\x80\x00"), Bytes::new());
        assert!(upper.contains_key(b"\x80\x00"));
        assert!(upper.contains_key(b"\xff\xff"));
        assert!(!upper.contains_key(b"\x7f\xff"));
    }

    #[test]
    #[should_panic(expected = "start must be < end")]
    fn test_inverted_bounds() {
        let _ = Partition::new(Bytes::from_static(b"\x02"), Bytes::from_static(b"\x01"));
    }

    #[test]
    fn test_hash_code_round_trip() {
        let key = encode_hash_code(0x1234);
        assert_eq!(key.as_ref(), &[0x12, 0x34]);
        assert_eq!(decode_hash_code(&key), 0x1234);
    }

    #[test]
    #[should_panic(expected = "too short")]
    fn test_hash_code_short_key() {
        let _ = decode_hash_code(b"\x01");
    }
}
