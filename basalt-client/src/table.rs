//! Client-side table handles.
//!
//! A `TableHandle` is the batcher's view of a user table: identity, the
//! partitioning scheme (which decides hash-code stamping), and the
//! staleness flag on the table's partition list. The partition list goes
//! stale when the metadata cache observes a newer version on the master,
//! typically after a tablet split.

use std::sync::atomic::{AtomicBool, Ordering};

use basalt_core::TableId;

/// How a table maps partition keys to tablets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    /// Keys carry a leading 16-bit hash code; tablets own hash ranges.
    Hash,
    /// Tablets own lexicographic key ranges directly.
    Range,
}

/// The client-side handle for one user table.
#[derive(Debug)]
pub struct TableHandle {
    id: TableId,
    name: String,
    scheme: PartitionScheme,
    partition_list_stale: AtomicBool,
}

impl TableHandle {
    /// Creates a handle for the given table.
    #[must_use]
    pub fn new(id: TableId, name: impl Into<String>, scheme: PartitionScheme) -> Self {
        Self {
            id,
            name: name.into(),
            scheme,
            partition_list_stale: AtomicBool::new(false),
        }
    }

    /// The table's unique identifier.
    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    /// The table's human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table's partitioning scheme.
    #[must_use]
    pub const fn partition_scheme(&self) -> PartitionScheme {
        self.scheme
    }

    /// Returns true if keys of this table carry a leading hash code.
    #[must_use]
    pub fn is_hash_partitioned(&self) -> bool {
        self.scheme == PartitionScheme::Hash
    }

    /// Marks the table's partition list as stale.
    ///
    /// Called when a lookup reports that the master holds a newer partition
    /// list than the one this client built its operations against. A retry
    /// at the session level will observe the flag and refresh.
    pub fn mark_partition_list_stale(&self) {
        self.partition_list_stale.store(true, Ordering::Release);
    }

    /// Returns true if the partition list has been marked stale.
    #[must_use]
    pub fn is_partition_list_stale(&self) -> bool {
        self.partition_list_stale.load(Ordering::Acquire)
    }

    /// Clears the stale flag, reporting whether a refresh was due.
    ///
    /// Returns true exactly once per staleness event: the caller that
    /// observes `true` must invalidate the table in the metadata cache so
    /// the next lookup fetches fresh partitions.
    pub fn maybe_refresh_partition_list(&self) -> bool {
        self.partition_list_stale.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_flag_round_trip() {
        let table = TableHandle::new(TableId::new(1), "orders", PartitionScheme::Hash);
        assert!(!table.is_partition_list_stale());

        table.mark_partition_list_stale();
        assert!(table.is_partition_list_stale());

        // Only the first refresh observes the staleness event.
        assert!(table.maybe_refresh_partition_list());
        assert!(!table.maybe_refresh_partition_list());
        assert!(!table.is_partition_list_stale());
    }

    #[test]
    fn test_partition_scheme() {
        let hash = TableHandle::new(TableId::new(1), "h", PartitionScheme::Hash);
        let range = TableHandle::new(TableId::new(2), "r", PartitionScheme::Range);
        assert!(hash.is_hash_partitioned());
        assert!(!range.is_hash_partitioned());
    }
}
