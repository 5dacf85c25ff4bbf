//! In-flight operation tracking.
//!
//! An `InFlightOp` wraps one admitted operation for the window between a
//! successful `Batcher::add` and its terminal outcome. The per-op state is
//! atomic: the buffered transition uses a compare-exchange so that an abort
//! racing a successful lookup observes either the pre-transition state (and
//! the abort path fails the op) or the post-transition state (and the
//! dispatch path owns it).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use basalt_core::SequenceNumber;
use bytes::Bytes;

use crate::meta_cache::RemoteTablet;
use crate::operation::RowOperation;

/// A list of in-flight operations, as carried by one RPC.
pub type InFlightOps = Vec<Arc<InFlightOp>>;

const STATE_LOOKING_UP_TABLET: u8 = 0;
const STATE_BUFFERED_TO_TABLET_SERVER: u8 = 1;

/// Where an admitted operation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightOpState {
    /// A metadata-cache lookup is outstanding for this op.
    LookingUpTablet,
    /// The tablet is resolved; the op sits in the ready queue or in an RPC.
    BufferedToTabletServer,
}

/// One admitted operation owned by a batcher.
pub struct InFlightOp {
    operation: Arc<dyn RowOperation>,
    partition_key: Bytes,
    sequence_number: SequenceNumber,
    tablet: OnceLock<Arc<RemoteTablet>>,
    state: AtomicU8,
}

impl InFlightOp {
    /// Wraps an operation at admission, in state `LookingUpTablet`.
    pub(crate) fn new(
        operation: Arc<dyn RowOperation>,
        partition_key: Bytes,
        sequence_number: SequenceNumber,
    ) -> Self {
        Self {
            operation,
            partition_key,
            sequence_number,
            tablet: OnceLock::new(),
            state: AtomicU8::new(STATE_LOOKING_UP_TABLET),
        }
    }

    /// The wrapped user operation.
    #[must_use]
    pub fn operation(&self) -> &Arc<dyn RowOperation> {
        &self.operation
    }

    /// The encoded partition key extracted at admission.
    #[must_use]
    pub const fn partition_key(&self) -> &Bytes {
        &self.partition_key
    }

    /// The admission ordinal, unique within the owning batcher.
    #[must_use]
    pub const fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// The resolved tablet, once lookup has completed successfully.
    #[must_use]
    pub fn tablet(&self) -> Option<&Arc<RemoteTablet>> {
        self.tablet.get()
    }

    /// The op's current state.
    #[must_use]
    pub fn state(&self) -> InFlightOpState {
        match self.state.load(Ordering::Acquire) {
            STATE_LOOKING_UP_TABLET => InFlightOpState::LookingUpTablet,
            STATE_BUFFERED_TO_TABLET_SERVER => InFlightOpState::BufferedToTabletServer,
            other => unreachable!("corrupt in-flight op state: {other}"),
        }
    }

    /// Attaches the resolved tablet.
    ///
    /// # Panics
    ///
    /// Panics if a tablet was already attached.
    pub(crate) fn set_tablet(&self, tablet: Arc<RemoteTablet>) {
        assert!(
            self.tablet.set(tablet).is_ok(),
            "tablet attached twice to {self:?}"
        );
    }

    /// Attempts the `LookingUpTablet` -> `BufferedToTabletServer` transition.
    ///
    /// Returns false if the op was not in `LookingUpTablet`, which means an
    /// abort (or a duplicate lookup completion) got there first.
    pub(crate) fn mark_buffered(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_LOOKING_UP_TABLET,
                STATE_BUFFERED_TO_TABLET_SERVER,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl fmt::Debug for InFlightOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightOp")
            .field("seq", &self.sequence_number)
            .field("state", &self.state())
            .field("tablet", &self.tablet.get().map(|t| t.tablet_id()))
            .field("op", &self.operation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;
    use crate::partition::Partition;
    use crate::table::{PartitionScheme, TableHandle};
    use basalt_core::{PartitionListVersion, Result, TableId, TabletId};

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

    fn in_flight_op() -> InFlightOp {
        let table = Arc::new(TableHandle::new(TableId::new(1), "t", PartitionScheme::Range));
        InFlightOp::new(
            Arc::new(NoopOperation { table }),
            Bytes::from_static(b"\x00\x01"),
            SequenceNumber::new(0),
        )
    }

    #[test]
    fn test_initial_state() {
        let op = in_flight_op();
        assert_eq!(op.state(), InFlightOpState::LookingUpTablet);
        assert!(op.tablet().is_none());
    }

    #[test]
    fn test_buffered_transition_once() {
        let op = in_flight_op();
        assert!(op.mark_buffered());
        assert_eq!(op.state(), InFlightOpState::BufferedToTabletServer);

        // A second transition attempt must lose.
        assert!(!op.mark_buffered());
    }

    #[test]
    fn test_tablet_attach() {
        let op = in_flight_op();
        let tablet = Arc::new(RemoteTablet::new(
            TabletId::new(9),
            Partition::unbounded(),
            PartitionListVersion::new(1),
        ));
        op.set_tablet(Arc::clone(&tablet));
        assert_eq!(op.tablet().unwrap().tablet_id(), TabletId::new(9));
    }

    #[test]
    #[should_panic(expected = "attached twice")]
    fn test_tablet_attach_twice() {
        let op = in_flight_op();
        let tablet = Arc::new(RemoteTablet::new(
            TabletId::new(9),
            Partition::unbounded(),
            PartitionListVersion::new(1),
        ));
        op.set_tablet(Arc::clone(&tablet));
        op.set_tablet(tablet);
    }
}
