//! Accumulation of per-operation errors during a flush.
//!
//! The batcher reports one error per failed operation; the user drains the
//! collector after the flush callback fires. The collector is append-only
//! between drains so no error is ever dropped on a race.

use std::sync::{Arc, Mutex};

use basalt_core::Error;
use tracing::debug;

use crate::operation::RowOperation;

/// One collected failure: the operation and what happened to it.
#[derive(Debug, Clone)]
pub struct CollectedError {
    /// The operation that failed.
    pub operation: Arc<dyn RowOperation>,
    /// The failure.
    pub error: Error,
}

/// Collects per-operation errors for one batcher.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Mutex<Vec<CollectedError>>,
}

impl ErrorCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for one operation.
    pub fn add_error(&self, operation: Arc<dyn RowOperation>, error: Error) {
        debug!(op = ?operation, %error, "collected operation error");
        self.errors
            .lock()
            .expect("error collector lock poisoned")
            .push(CollectedError { operation, error });
    }

    /// Returns the number of errors collected since the last drain.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors
            .lock()
            .expect("error collector lock poisoned")
            .len()
    }

    /// Drains and returns all collected errors, oldest first.
    #[must_use]
    pub fn get_and_clear_errors(&self) -> Vec<CollectedError> {
        std::mem::take(
            &mut *self
                .errors
                .lock()
                .expect("error collector lock poisoned"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, RowOperation};
    use crate::table::{PartitionScheme, TableHandle};
    use basalt_core::{Result, TableId};
    use bytes::Bytes;

    #[derive(Debug)]
    struct NoopOperation {
        table: Arc<TableHandle>,
    }

    impl RowOperation for NoopOperation {
        fn table(&self) -> Arc<TableHandle> {
            Arc::clone(&self.table)
        }

        fn kind(&self) -> OperationKind {
            OperationKind::QlWrite
        }

        fn partition_key(&self) -> Result<Bytes> {
            Ok(Bytes::from_static(b"\x00\x01"))
        }

        fn set_hash_code(&self, _hash_code: u16) {}
    }

    fn noop_op() -> Arc<dyn RowOperation> {
        Arc::new(NoopOperation {
            table: Arc::new(TableHandle::new(TableId::new(1), "t", PartitionScheme::Range)),
        })
    }

    #[test]
    fn test_collect_and_drain() {
        let collector = ErrorCollector::new();
        assert_eq!(collector.error_count(), 0);

        collector.add_error(
            noop_op(),
            Error::Io {
                message: "connection reset".to_string(),
            },
        );
        collector.add_error(
            noop_op(),
            Error::NotFound {
                message: "tablet gone".to_string(),
            },
        );
        assert_eq!(collector.error_count(), 2);

        let drained = collector.get_and_clear_errors();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0].error, Error::Io { .. }));
        assert!(matches!(drained[1].error, Error::NotFound { .. }));

        assert_eq!(collector.error_count(), 0);
        assert!(collector.get_and_clear_errors().is_empty());
    }
}
