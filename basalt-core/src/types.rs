//! Strongly-typed identifiers for Basalt entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! All IDs are 64-bit to handle large-scale deployments.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `TableId` with `TabletId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Table and tablet identification.
define_id!(TableId, "table", "Unique identifier for a user table.");
define_id!(TabletId, "tablet", "Unique identifier for a tablet (one shard of a table).");

// Partitioning.
define_id!(
    PartitionListVersion,
    "plv",
    "Monotonic version of a table's current tablet partitioning. A mismatch indicates a split."
);

// Batching.
define_id!(
    SequenceNumber,
    "seq",
    "Per-batcher monotonic ordinal assigned to an operation at admission."
);

// Retryable write tracking.
define_id!(
    RequestId,
    "req",
    "Identifier for a retryable write request, scoped to a single tablet."
);

/// A hybrid logical/physical timestamp observed from tablet server responses.
///
/// Hybrid times only move forward: the client clock keeps the maximum value
/// ever observed, and read points ratchet the same way.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct HybridTime(u64);

impl HybridTime {
    /// The lowest possible hybrid time.
    pub const MIN: Self = Self(0);

    /// Creates a hybrid time from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ht({})", self.0)
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ht-{}", self.0)
    }
}

impl From<u64> for HybridTime {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<HybridTime> for u64 {
    fn from(time: HybridTime) -> Self {
        time.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let table = TableId::new(7);
        let tablet = TabletId::new(7);

        assert_eq!(table.get(), tablet.get());
        assert_eq!(format!("{table}"), "table-7");
        assert_eq!(format!("{tablet}"), "tablet-7");
    }

    #[test]
    fn test_sequence_number_next() {
        let seq = SequenceNumber::new(41);
        assert_eq!(seq.next(), SequenceNumber::new(42));
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_sequence_number_overflow() {
        let _ = SequenceNumber::new(u64::MAX).next();
    }

    #[test]
    fn test_hybrid_time_ordering() {
        assert!(HybridTime::MIN < HybridTime::new(1));
        assert!(HybridTime::new(100) < HybridTime::new(200));
        assert_eq!(format!("{:?}", HybridTime::new(5)), "ht(5)");
    }
}
