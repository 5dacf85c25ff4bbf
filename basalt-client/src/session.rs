//! The session-facing notification contract.
//!
//! The session owns its batchers; a batcher holds only a weak reference
//! back and upgrades it for the duration of a single notification, so the
//! session/batcher pair never forms a strong cycle. Notifications are
//! always delivered with the batcher lock released - the session lock
//! orders before the batcher lock.

use crate::batcher::Batcher;

/// The owner of a batcher, notified at flush boundaries.
pub trait Session: Send + Sync {
    /// Called once when the batcher begins flushing, before any dispatch
    /// work progresses. Session-level accounting (e.g. moving the batcher
    /// out of the "current" slot) happens here.
    fn flush_started(&self, batcher: &Batcher);

    /// Called once when the batcher's admitted set drains to empty and the
    /// batcher completes, before the user callback runs.
    fn flush_finished(&self, batcher: &Batcher);
}
