//! The client context shared by all batchers of one driver instance.
//!
//! Owns the handles a batcher borrows: the metadata cache, the RPC
//! messenger, the runtime that drives lookups and calls, the optional
//! callback runtime, the observed-hybrid-time clock, and the per-tablet
//! retryable-request-id allocator.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use basalt_core::{HybridTime, RequestId, TabletId};
use tokio::runtime::Handle;

use crate::meta_cache::MetaCache;
use crate::rpc::Messenger;

/// Supplies the backpressure score attached to outgoing write calls.
pub trait RejectionScoreSource: Send + Sync {
    /// The score in `[0.0, 1.0]` for the given attempt number.
    fn get(&self, attempt_num: u32) -> f64;
}

/// Outstanding retryable requests against one tablet.
#[derive(Debug, Default)]
struct TabletRequests {
    next_id: u64,
    running: BTreeSet<u64>,
}

/// Shared driver state for one logical client.
pub struct ClientContext {
    meta_cache: Arc<dyn MetaCache>,
    messenger: Arc<dyn Messenger>,
    runtime: Handle,
    callback_runtime: Option<Handle>,
    latest_observed_hybrid_time: AtomicU64,
    requests: Mutex<HashMap<TabletId, TabletRequests>>,
}

impl ClientContext {
    /// Creates a context driving its lookups and calls on `runtime`.
    ///
    /// Flush callbacks run inline unless a callback runtime is attached
    /// with [`Self::with_callback_runtime`].
    #[must_use]
    pub fn new(
        meta_cache: Arc<dyn MetaCache>,
        messenger: Arc<dyn Messenger>,
        runtime: Handle,
    ) -> Self {
        Self {
            meta_cache,
            messenger,
            runtime,
            callback_runtime: None,
            latest_observed_hybrid_time: AtomicU64::new(HybridTime::MIN.get()),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Routes user-facing flush callbacks onto the given runtime.
    #[must_use]
    pub fn with_callback_runtime(mut self, runtime: Handle) -> Self {
        self.callback_runtime = Some(runtime);
        self
    }

    /// The metadata cache used for tablet resolution.
    #[must_use]
    pub fn meta_cache(&self) -> &Arc<dyn MetaCache> {
        &self.meta_cache
    }

    /// The transport used for outgoing calls.
    #[must_use]
    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    /// Spawns background work (lookups, RPC calls) on the driver runtime.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    /// Runs a user-facing callback, on the callback runtime when one is
    /// attached, inline otherwise.
    pub(crate) fn run_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        match &self.callback_runtime {
            Some(handle) => {
                handle.spawn(async move { callback() });
            }
            None => callback(),
        }
    }

    /// Ratchets the clock forward to `observed` if it is newer.
    pub fn update_latest_observed_hybrid_time(&self, observed: HybridTime) {
        self.latest_observed_hybrid_time
            .fetch_max(observed.get(), Ordering::AcqRel);
    }

    /// The highest hybrid time observed from any tablet server so far.
    #[must_use]
    pub fn latest_observed_hybrid_time(&self) -> HybridTime {
        HybridTime::new(self.latest_observed_hybrid_time.load(Ordering::Acquire))
    }

    /// Allocates a retryable request id for `tablet` and reports the
    /// smallest id still running there.
    ///
    /// Tablet servers use the minimum to garbage-collect replay state for
    /// requests that can no longer be retried.
    #[must_use]
    pub fn next_request_id_and_min_running(&self, tablet: TabletId) -> (RequestId, RequestId) {
        let mut requests = self.requests.lock().expect("request tracker lock poisoned");
        let entry = requests.entry(tablet).or_default();
        let id = entry.next_id;
        entry.next_id += 1;
        entry.running.insert(id);
        let min_running = *entry.running.first().expect("just inserted");
        (RequestId::new(id), RequestId::new(min_running))
    }

    /// Releases a retryable request id once its call has reported.
    pub fn request_finished(&self, tablet: TabletId, request_id: RequestId) {
        let mut requests = self.requests.lock().expect("request tracker lock poisoned");
        if let Some(entry) = requests.get_mut(&tablet) {
            entry.running.remove(&request_id.get());
        }
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field(
                "latest_observed_hybrid_time",
                &self.latest_observed_hybrid_time(),
            )
            .field("has_callback_runtime", &self.callback_runtime.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_cache::RemoteTablet;
    use crate::rpc::{ReadRequest, ReadResponse, RpcError, WriteRequest, WriteResponse};
    use crate::table::TableHandle;
    use async_trait::async_trait;
    use basalt_core::Result;
    use bytes::Bytes;

    struct UnreachableMetaCache;

    #[async_trait]
    impl MetaCache for UnreachableMetaCache {
        async fn lookup_tablet_by_key(
            &self,
            _table: Arc<TableHandle>,
            _partition_key: Bytes,
        ) -> Result<Arc<RemoteTablet>> {
            unreachable!("not used in these tests")
        }

        fn invalidate_table_cache(&self, _table: &TableHandle) {}
    }

    struct UnreachableMessenger;

    #[async_trait]
    impl Messenger for UnreachableMessenger {
        async fn write(&self, _request: WriteRequest) -> std::result::Result<WriteResponse, RpcError> {
            unreachable!("not used in these tests")
        }

        async fn read(&self, _request: ReadRequest) -> std::result::Result<ReadResponse, RpcError> {
            unreachable!("not used in these tests")
        }
    }

    fn client(runtime: Handle) -> ClientContext {
        ClientContext::new(
            Arc::new(UnreachableMetaCache),
            Arc::new(UnreachableMessenger),
            runtime,
        )
    }

    #[tokio::test]
    async fn test_hybrid_time_ratchet() {
        let client = client(Handle::current());
        assert_eq!(client.latest_observed_hybrid_time(), HybridTime::MIN);

        client.update_latest_observed_hybrid_time(HybridTime::new(500));
        client.update_latest_observed_hybrid_time(HybridTime::new(300));
        assert_eq!(client.latest_observed_hybrid_time(), HybridTime::new(500));
    }

    #[tokio::test]
    async fn test_request_id_allocation() {
        let client = client(Handle::current());
        let tablet = TabletId::new(7);

        let (first, min_first) = client.next_request_id_and_min_running(tablet);
        assert_eq!(first, RequestId::new(0));
        assert_eq!(min_first, RequestId::new(0));

        let (second, min_second) = client.next_request_id_and_min_running(tablet);
        assert_eq!(second, RequestId::new(1));
        assert_eq!(min_second, RequestId::new(0));

        // Finishing the oldest request advances the minimum.
        client.request_finished(tablet, first);
        let (third, min_third) = client.next_request_id_and_min_running(tablet);
        assert_eq!(third, RequestId::new(2));
        assert_eq!(min_third, RequestId::new(1));

        // Other tablets allocate independently.
        let (other, _) = client.next_request_id_and_min_running(TabletId::new(8));
        assert_eq!(other, RequestId::new(0));
    }

    #[tokio::test]
    async fn test_inline_callback_without_runtime() {
        let client = client(Handle::current());
        let ran = Arc::new(AtomicU64::new(0));
        let ran_clone = Arc::clone(&ran);
        client.run_callback(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_runtime_submission() {
        let client = client(Handle::current()).with_callback_runtime(Handle::current());
        let (tx, rx) = tokio::sync::oneshot::channel();
        client.run_callback(Box::new(move || {
            tx.send(()).unwrap();
        }));
        rx.await.unwrap();
    }
}
