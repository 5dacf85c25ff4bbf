//! The transaction contract consumed by the batcher.
//!
//! A batcher executing inside a transaction must let the transaction
//! initialize its metadata before any RPC leaves the client. The prepare
//! step is synchronous-or-callback: it either reports "ready now" or keeps
//! the provided callback and invokes it later, at which point the batcher
//! re-enters dispatch.

use std::sync::Arc;
use std::time::Instant;

use basalt_core::{HybridTime, Result};
use tracing::Span;

use crate::in_flight_op::{InFlightOp, InFlightOps};

/// One dispatch group: a maximal run of ready ops sharing a single
/// (tablet, op-group kind). Becomes exactly one outgoing RPC.
#[derive(Debug, Clone)]
pub struct OpsGroup {
    /// The ops of this group, ordered by admission sequence number.
    pub ops: InFlightOps,
    /// Whether the RPC for this group must carry transaction metadata.
    /// Set for the first group of a transactional batch.
    pub need_metadata: bool,
}

impl OpsGroup {
    /// The tablet every op of this group resolved to.
    ///
    /// # Panics
    ///
    /// Panics if the group is empty or its first op has no tablet; groups
    /// are only formed from fully resolved ops.
    #[must_use]
    pub fn tablet(&self) -> &Arc<crate::meta_cache::RemoteTablet> {
        self.ops
            .first()
            .and_then(|op| op.tablet())
            .expect("dispatch group without a resolved tablet")
    }
}

/// The groups of one batch, handed to the transaction for prepare.
#[derive(Debug, Clone, Default)]
pub struct OpsInfo {
    /// The dispatch groups, in sorted queue order.
    pub groups: Vec<OpsGroup>,
}

impl OpsInfo {
    /// Total number of ops across all groups.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.groups.iter().map(|group| group.ops.len()).sum()
    }
}

/// Callback handed to [`Transaction::prepare`]; invoked once when a
/// deferred prepare completes (or fails).
pub type PrepareReadyCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// A transaction gating dispatch of its batchers.
pub trait Transaction: Send + Sync {
    /// Asks the transaction to make itself ready for the given groups.
    ///
    /// Returns true if dispatch may proceed immediately. Returns false if
    /// the transaction kept `ready_callback` and will invoke it when ready;
    /// the callback must fire at most once and never synchronously from
    /// inside this call.
    fn prepare(
        &self,
        ops_info: &OpsInfo,
        force_consistent_read: bool,
        deadline: Instant,
        initial: bool,
        ready_callback: PrepareReadyCallback,
    ) -> bool;

    /// Tells the transaction how many operations this flush will feed it.
    /// Not called for flushes retrying ops the transaction already expects.
    fn expect_operations(&self, count: usize);

    /// Reports that the given ops finished flushing with `status`.
    ///
    /// Not called for ops the session will retry - those stay accounted to
    /// the transaction until a retry resolves them.
    fn flushed(&self, ops: &[Arc<InFlightOp>], used_read_time: Option<HybridTime>, status: &Result<()>);

    /// The transaction's trace span; per-RPC spans are linked under it.
    fn span(&self) -> Span {
        Span::none()
    }
}
