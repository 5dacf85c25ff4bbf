//! Consistent read point.
//!
//! Tracks the highest hybrid time observed from tablet server responses so
//! that subsequent reads through the same point never go backwards in time.

use std::sync::atomic::{AtomicU64, Ordering};

use basalt_core::HybridTime;

/// A monotonically advancing read timestamp.
#[derive(Debug, Default)]
pub struct ConsistentReadPoint {
    observed_hybrid_time: AtomicU64,
}

impl ConsistentReadPoint {
    /// Creates a read point at [`HybridTime::MIN`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ratchets the read point forward to `propagated` if it is newer.
    pub fn update_clock(&self, propagated: HybridTime) {
        self.observed_hybrid_time
            .fetch_max(propagated.get(), Ordering::AcqRel);
    }

    /// The highest hybrid time observed so far.
    #[must_use]
    pub fn observed_hybrid_time(&self) -> HybridTime {
        HybridTime::new(self.observed_hybrid_time.load(Ordering::Acquire))
    }
}
