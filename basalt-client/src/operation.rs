//! The row-operation contract consumed by the batcher.
//!
//! Operations are owned by the caller; the batcher only reads their routing
//! attributes (table, partition key, op family) and stamps the hash code on
//! hash-partitioned families. The per-row payload and its wire encoding are
//! opaque here - the transport encodes operations when it builds requests.

use std::fmt;
use std::sync::Arc;

use basalt_core::{PartitionListVersion, Result};
use bytes::Bytes;

use crate::meta_cache::RemoteTablet;
use crate::table::TableHandle;

/// The family of a row operation.
///
/// The family decides both which API shape the payload uses and whether the
/// hash-code stamping in `Batcher::add` applies to an empty partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// A QL (CQL-compatible) read.
    QlRead,
    /// A QL (CQL-compatible) write.
    QlWrite,
    /// A Redis-compatible read.
    RedisRead,
    /// A Redis-compatible write.
    RedisWrite,
    /// A PostgreSQL-compatible read.
    PgsqlRead,
    /// A PostgreSQL-compatible write.
    PgsqlWrite,
}

impl OperationKind {
    /// Returns true for the read families.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::QlRead | Self::RedisRead | Self::PgsqlRead)
    }

    /// Returns true for the write families.
    #[must_use]
    pub const fn is_write(self) -> bool {
        !self.is_read()
    }

    /// The default dispatch group for this family.
    ///
    /// Reads default to strong (leader) reads; operations wanting
    /// consistent-prefix reads override [`RowOperation::group`].
    #[must_use]
    pub const fn default_group(self) -> OpGroup {
        if self.is_write() {
            OpGroup::Write
        } else {
            OpGroup::LeaderRead
        }
    }
}

/// Which kind of per-tablet RPC carries an operation.
///
/// The variant order is the dispatch sort order within one tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpGroup {
    /// Carried by a write RPC.
    Write,
    /// Carried by a strong-consistency read RPC.
    LeaderRead,
    /// Carried by a consistent-prefix read RPC.
    ConsistentPrefixRead,
}

/// A user-issued row operation, as seen by the batcher.
pub trait RowOperation: fmt::Debug + Send + Sync {
    /// The table this operation targets.
    fn table(&self) -> Arc<TableHandle>;

    /// The operation's family.
    fn kind(&self) -> OperationKind;

    /// The dispatch group this operation belongs to.
    fn group(&self) -> OpGroup {
        self.kind().default_group()
    }

    /// The encoded partition key used to route this operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot produce a key, e.g. because
    /// required key columns are unbound.
    fn partition_key(&self) -> Result<Bytes>;

    /// The partition-list version this operation was built against, if the
    /// caller pinned one. Dispatch refuses to send the operation to a
    /// tablet carrying a different version.
    fn partition_list_version(&self) -> Option<PartitionListVersion> {
        None
    }

    /// Records the decoded hash code for downstream wire encoding.
    ///
    /// Only called for hash-partitioned tables.
    fn set_hash_code(&self, hash_code: u16);

    /// A tablet pre-resolved by the caller, bypassing the metadata cache.
    fn tablet(&self) -> Option<Arc<RemoteTablet>> {
        None
    }

    /// Marks the target table's partition list as stale.
    fn mark_table_partition_list_as_stale(&self) {
        self.table().mark_partition_list_stale();
    }

    /// Clears the table's staleness flag, reporting whether the partition
    /// list needs a metadata-cache refresh. See
    /// [`TableHandle::maybe_refresh_partition_list`].
    fn maybe_refresh_table_partition_list(&self) -> bool {
        self.table().maybe_refresh_partition_list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert!(OperationKind::QlRead.is_read());
        assert!(OperationKind::PgsqlRead.is_read());
        assert!(OperationKind::RedisWrite.is_write());
        assert!(!OperationKind::QlWrite.is_read());
    }

    #[test]
    fn test_default_groups() {
        assert_eq!(OperationKind::QlWrite.default_group(), OpGroup::Write);
        assert_eq!(OperationKind::RedisRead.default_group(), OpGroup::LeaderRead);
    }

    #[test]
    fn test_group_sort_order() {
        assert!(OpGroup::Write < OpGroup::LeaderRead);
        assert!(OpGroup::LeaderRead < OpGroup::ConsistentPrefixRead);
    }
}
