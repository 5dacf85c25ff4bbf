//! The metadata-cache contract and the remote tablet handle.
//!
//! The metadata cache maps (table, partition key) to the tablet currently
//! owning that key. Lookups are asynchronous and may fail, return a stale
//! view, or complete after the caller has moved on; the batcher copes with
//! all three. The cache implementation lives with the client runtime - the
//! batcher only consumes this trait.

use std::sync::Arc;

use async_trait::async_trait;
use basalt_core::{PartitionListVersion, Result, TabletId};
use bytes::Bytes;

use crate::partition::Partition;
use crate::table::TableHandle;

/// The client-side handle for one remote tablet.
///
/// Opaque to the batcher except for identity (grouping), partition bounds
/// (containment check), and the partition-list version it was created from
/// (staleness gate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTablet {
    tablet_id: TabletId,
    partition: Partition,
    partition_list_version: PartitionListVersion,
}

impl RemoteTablet {
    /// Creates a tablet handle.
    #[must_use]
    pub const fn new(
        tablet_id: TabletId,
        partition: Partition,
        partition_list_version: PartitionListVersion,
    ) -> Self {
        Self {
            tablet_id,
            partition,
            partition_list_version,
        }
    }

    /// The tablet's unique identifier.
    #[must_use]
    pub const fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// The key range this tablet owns.
    #[must_use]
    pub const fn partition(&self) -> &Partition {
        &self.partition
    }

    /// The version of the table's partition list this handle was built from.
    #[must_use]
    pub const fn partition_list_version(&self) -> PartitionListVersion {
        self.partition_list_version
    }
}

/// Resolves partition keys to tablets.
#[async_trait]
pub trait MetaCache: Send + Sync {
    /// Resolves the tablet owning `partition_key` in `table`.
    ///
    /// The caller enforces the deadline by racing this future against a
    /// timer; implementations should still stop work promptly when the
    /// future is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error when the tablet cannot be resolved, including
    /// [`basalt_core::Error::Stale`] when the master holds a newer
    /// partition list than the cache.
    async fn lookup_tablet_by_key(
        &self,
        table: Arc<TableHandle>,
        partition_key: Bytes,
    ) -> Result<Arc<RemoteTablet>>;

    /// Drops all cached tablet locations for `table`.
    fn invalidate_table_cache(&self, table: &TableHandle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_remote_tablet_accessors() {
        let tablet = RemoteTablet::new(
            TabletId::new(3),
            Partition::new(Bytes::from_static(b"\x00\x00"), Bytes::from_static(b"\x80\x00")),
            PartitionListVersion::new(2),
        );
        assert_eq!(tablet.tablet_id(), TabletId::new(3));
        assert_eq!(tablet.partition_list_version(), PartitionListVersion::new(2));
        assert!(tablet.partition().contains_key(b"\x10\x00"));
        assert!(!tablet.partition().contains_key(b"\x90\x00"));
    }
}
