//! The batcher: groups row operations into per-tablet calls.
//!
//! A batcher has a single-use lifecycle: the session creates one, feeds it
//! operations, flushes it exactly once, and drains its errors after the
//! flush callback fires. Internally it coordinates four asynchronous
//! streams of events - user calls, metadata-cache lookup completions, the
//! transaction readiness callback, and RPC completions - behind one
//! non-reentrant mutex.
//!
//! # Lock ordering
//!
//! The session lock orders before the batcher lock. The batcher lock is
//! never held across a user callback, a session notification, a
//! transaction call, an RPC send, or a lookup submission; those may chain
//! straight back into the batcher and the mutex is non-reentrant.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use basalt_core::{ClientErrorCode, Error, Result, SequenceNumber, TabletId};
use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::client::{ClientContext, RejectionScoreSource};
use crate::error_collector::{CollectedError, ErrorCollector};
use crate::in_flight_op::{InFlightOp, InFlightOpState, InFlightOps};
use crate::meta_cache::RemoteTablet;
use crate::operation::{OpGroup, OperationKind, RowOperation};
use crate::partition::decode_hash_code;
use crate::read_point::ConsistentReadPoint;
use crate::rpc::{
    ConsistencyLevel, FlushExtraResult, GroupRpc, ReadRpc, RpcData, RpcError, WriteResponse,
    WriteRpc,
};
use crate::session::Session;
use crate::transaction::{OpsGroup, OpsInfo, Transaction};

/// Deadline applied to lookups and calls when the session sets none.
pub const FLUSH_DEADLINE_DEFAULT: Duration = Duration::from_secs(60);

/// The user-visible message of the sentinel flush error.
///
/// When operations fail individually, the flush status carries this fixed
/// message and the per-op detail stays in the error collector.
pub const ERROR_REACHING_TABLET_SERVERS_MSG: &str =
    "errors occurred while reaching out to the tablet servers";

/// Callback invoked exactly once when the flush completes or aborts.
pub type FlushCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Lifecycle state of a batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherState {
    /// Accepting `add` calls; flush not yet requested.
    GatheringOps,
    /// Flush requested; tablet lookups may still be outstanding.
    ResolvingTablets,
    /// Groups formed; waiting for the transaction to become ready.
    TransactionPrepare,
    /// Dispatch may proceed; draining the admitted set.
    TransactionReady,
    /// All admitted ops reached a terminal outcome.
    Complete,
    /// The batch was aborted.
    Aborted,
}

impl BatcherState {
    /// Returns true for the two terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    /// A short name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GatheringOps => "gathering-ops",
            Self::ResolvingTablets => "resolving-tablets",
            Self::TransactionPrepare => "transaction-prepare",
            Self::TransactionReady => "transaction-ready",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tunables for one batcher.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// When set, fold per-op errors into the flush status instead of the
    /// fixed sentinel. Diagnostic aid for tests that don't want to dig
    /// through the error collector.
    pub combine_errors: bool,
    /// Allow the transport to complete the final group's call on the
    /// current thread. Earlier groups must not, they still need to return
    /// so the remaining calls get sent.
    pub allow_local_calls_in_curr_thread: bool,
    /// Probability of treating a successful lookup as a containment
    /// mismatch. Fault injection for tests; keep 0.0 in production.
    pub lookup_mismatch_probability: f64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            combine_errors: false,
            allow_local_calls_in_curr_thread: true,
            lookup_mismatch_probability: 0.0,
        }
    }
}

/// State behind the batcher mutex.
struct BatcherInner {
    state: BatcherState,
    /// The admitted set, keyed by the op's unique sequence number.
    ops: HashMap<SequenceNumber, Arc<InFlightOp>>,
    /// Resolved ops awaiting sort and grouping.
    ops_queue: Vec<Arc<InFlightOp>>,
    /// Dispatch groups formed from the sorted queue.
    ops_info: OpsInfo,
    next_sequence_number: SequenceNumber,
    outstanding_lookups: usize,
    flush_callback: Option<FlushCallback>,
    combined_error: Option<Error>,
    deadline: Instant,
}

/// Groups a stream of row operations into per-tablet calls.
///
/// See the module docs for the lifecycle and locking rules.
pub struct Batcher {
    weak_self: Weak<Batcher>,
    client: Arc<ClientContext>,
    weak_session: Weak<dyn Session>,
    transaction: Option<Arc<dyn Transaction>>,
    read_point: Option<Arc<ConsistentReadPoint>>,
    force_consistent_read: bool,
    config: BatcherConfig,
    error_collector: ErrorCollector,
    had_errors: AtomicBool,
    rejection_score_source: Mutex<Option<Arc<dyn RejectionScoreSource>>>,
    inner: Mutex<BatcherInner>,
}

impl Batcher {
    /// Creates a batcher with the default configuration.
    #[must_use]
    pub fn new(
        client: Arc<ClientContext>,
        session: Weak<dyn Session>,
        transaction: Option<Arc<dyn Transaction>>,
        read_point: Option<Arc<ConsistentReadPoint>>,
        force_consistent_read: bool,
    ) -> Arc<Self> {
        Self::with_config(
            client,
            session,
            transaction,
            read_point,
            force_consistent_read,
            BatcherConfig::default(),
        )
    }

    /// Creates a batcher with a custom configuration.
    #[must_use]
    pub fn with_config(
        client: Arc<ClientContext>,
        session: Weak<dyn Session>,
        transaction: Option<Arc<dyn Transaction>>,
        read_point: Option<Arc<ConsistentReadPoint>>,
        force_consistent_read: bool,
        config: BatcherConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            client,
            weak_session: session,
            transaction,
            read_point,
            force_consistent_read,
            config,
            error_collector: ErrorCollector::new(),
            had_errors: AtomicBool::new(false),
            rejection_score_source: Mutex::new(None),
            inner: Mutex::new(BatcherInner {
                state: BatcherState::GatheringOps,
                ops: HashMap::new(),
                ops_queue: Vec::new(),
                ops_info: OpsInfo::default(),
                next_sequence_number: SequenceNumber::new(0),
                outstanding_lookups: 0,
                flush_callback: None,
                combined_error: None,
                deadline: Instant::now() + FLUSH_DEADLINE_DEFAULT,
            }),
        })
    }

    /// The shared client context.
    #[must_use]
    pub fn client(&self) -> &Arc<ClientContext> {
        &self.client
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BatcherState {
        self.locked().state
    }

    /// Sets the deadline for dependent lookups and calls.
    pub fn set_deadline(&self, deadline: Instant) {
        self.locked().deadline = deadline;
    }

    /// Returns true while any admitted op has not reached a terminal
    /// outcome.
    #[must_use]
    pub fn has_pending_operations(&self) -> bool {
        !self.locked().ops.is_empty()
    }

    /// Number of ops still buffered, i.e. admitted but not yet flushing.
    /// Once flushing begins the ops are in flight, not buffered, and this
    /// returns 0.
    #[must_use]
    pub fn count_buffered_operations(&self) -> usize {
        let inner = self.locked();
        if inner.state == BatcherState::GatheringOps {
            inner.ops.len()
        } else {
            0
        }
    }

    /// Attaches the backpressure source consulted by outgoing write calls.
    pub fn set_rejection_score_source(&self, source: Arc<dyn RejectionScoreSource>) {
        *self
            .rejection_score_source
            .lock()
            .expect("rejection score lock poisoned") = Some(source);
    }

    /// The backpressure score for the given attempt, 0.0 without a source.
    #[must_use]
    pub fn rejection_score(&self, attempt_num: u32) -> f64 {
        self.rejection_score_source
            .lock()
            .expect("rejection score lock poisoned")
            .as_ref()
            .map_or(0.0, |source| source.get(attempt_num))
    }

    /// Drains the per-op errors accumulated so far, oldest first.
    #[must_use]
    pub fn get_and_clear_pending_errors(&self) -> Vec<CollectedError> {
        self.error_collector.get_and_clear_errors()
    }

    /// Admits one operation and starts resolving its tablet.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the batcher is no longer gathering ops;
    /// the op is not admitted. Propagates partition-key extraction errors.
    pub fn add(&self, operation: Arc<dyn RowOperation>) -> Result<()> {
        let state = self.state();
        if state != BatcherState::GatheringOps {
            error!(op = ?operation, state = state.name(), "rejected add");
            return Err(Error::Internal {
                message: format!("adding op to batcher in state {state}"),
            });
        }

        // Start the lookup as soon as the op arrives so that by the time
        // the user calls flush, resolution is already under way.
        let partition_key = operation.partition_key()?;

        // A stale partition list means the table may have split since the
        // cache last looked; refetch before routing against it.
        if operation.maybe_refresh_table_partition_list() {
            self.client
                .meta_cache()
                .invalidate_table_cache(&operation.table());
        }

        if operation.table().is_hash_partitioned() {
            match operation.kind() {
                OperationKind::QlRead | OperationKind::PgsqlRead => {
                    if !partition_key.is_empty() {
                        operation.set_hash_code(decode_hash_code(&partition_key));
                    }
                }
                OperationKind::QlWrite
                | OperationKind::RedisRead
                | OperationKind::RedisWrite
                | OperationKind::PgsqlWrite => {
                    operation.set_hash_code(decode_hash_code(&partition_key));
                }
            }
        }

        let in_flight = self.add_in_flight_op(Arc::clone(&operation), partition_key.clone())?;
        debug!(op = ?in_flight, "looking up tablet");

        if let Some(tablet) = operation.tablet() {
            // Caller-driven routing: skip the cache.
            self.tablet_lookup_finished(&in_flight, Ok(tablet));
        } else {
            let batcher = self.shared_from_this();
            let meta_cache = Arc::clone(self.client.meta_cache());
            let table = operation.table();
            let deadline = self.locked().deadline;
            self.client.spawn(async move {
                let result = match tokio::time::timeout_at(
                    deadline.into(),
                    meta_cache.lookup_tablet_by_key(table, partition_key),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::TimedOut {
                        operation: "tablet lookup",
                    }),
                };
                batcher.tablet_lookup_finished(&in_flight, result);
            });
        }
        Ok(())
    }

    /// Begins the flush. Called exactly once per batcher.
    ///
    /// The callback runs exactly once, after every admitted op reaches a
    /// terminal outcome (immediately for an empty batch).
    ///
    /// # Panics
    ///
    /// Panics if called twice or after an abort, i.e. when the batcher is
    /// not in `GatheringOps`.
    pub fn flush_async(&self, callback: FlushCallback, is_within_transaction_retry: bool) {
        let session;
        let operations_count;
        {
            let mut inner = self.locked();
            assert_eq!(
                inner.state,
                BatcherState::GatheringOps,
                "flush_async in state {}",
                inner.state
            );
            inner.state = BatcherState::ResolvingTablets;
            inner.flush_callback = Some(callback);
            operations_count = inner.ops.len();
            session = self.weak_session.upgrade();
        }

        // Session accounting runs before batcher internals progress, and
        // with the batcher lock released: session lock before batcher lock.
        if let Some(session) = session {
            session.flush_started(self);
        }

        if let Some(transaction) = &self.transaction {
            // Ops retried within the same transaction are already expected.
            if !is_within_transaction_retry {
                transaction.expect_operations(operations_count);
            }
        }

        // Nothing buffered: complete right away. Otherwise the last
        // terminal op outcome completes the batch.
        self.check_for_finished_flush();

        // Lookups may have already drained while ops were being added.
        self.flush_buffers_if_ready();
    }

    /// Terminates the batch: fails every buffered op with `error` and runs
    /// the pending flush callback, if any, with the abort status.
    ///
    /// Ops still looking up their tablet are not forcibly cancelled; their
    /// completion handler observes the aborted state and fails them then.
    /// Repeated aborts keep the first callback invocation only.
    pub fn abort(&self, error: Error) {
        let callback;
        {
            let mut inner = self.locked();
            inner.state = BatcherState::Aborted;

            let buffered: Vec<Arc<InFlightOp>> = inner
                .ops
                .values()
                .filter(|op| op.state() == InFlightOpState::BufferedToTabletServer)
                .cloned()
                .collect();
            for op in &buffered {
                debug!(op = ?op, "aborting op");
                self.mark_in_flight_op_failed_locked(&mut inner, op, error.clone());
            }

            callback = inner.flush_callback.take();
        }
        if let Some(callback) = callback {
            self.run_flush_callback(callback, Err(error));
        }
    }

    /// The owning handle for callbacks that outlive the current frame.
    /// Everything that can call this runs while some `Arc` of the batcher
    /// is alive (user call, lookup task, RPC task), so the upgrade holds.
    fn shared_from_this(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("batcher used after its last owner dropped")
    }

    fn locked(&self) -> MutexGuard<'_, BatcherInner> {
        self.inner.lock().expect("batcher lock poisoned")
    }

    /// Admits the op under the lock, assigning its sequence number.
    fn add_in_flight_op(
        &self,
        operation: Arc<dyn RowOperation>,
        partition_key: Bytes,
    ) -> Result<Arc<InFlightOp>> {
        let mut inner = self.locked();
        if inner.state != BatcherState::GatheringOps {
            let message = format!("adding op to batcher in state {}", inner.state);
            error!(op = ?operation, state = inner.state.name(), "rejected add");
            return Err(Error::Internal { message });
        }
        let sequence_number = inner.next_sequence_number;
        inner.next_sequence_number = sequence_number.next();

        let in_flight = Arc::new(InFlightOp::new(operation, partition_key, sequence_number));
        let displaced = inner.ops.insert(sequence_number, Arc::clone(&in_flight));
        assert!(displaced.is_none(), "sequence number {sequence_number} reused");
        inner.outstanding_lookups += 1;
        Ok(in_flight)
    }

    /// Invoked once per admitted op when its tablet resolution finishes.
    fn tablet_lookup_finished(&self, op: &Arc<InFlightOp>, mut result: Result<Arc<RemoteTablet>>) {
        // Take the lock early to atomically test for an abort and change
        // the op state.
        let all_lookups_finished;
        let mut op_failed = false;
        {
            let mut inner = self.locked();
            inner.outstanding_lookups -= 1;
            all_lookups_finished = inner.outstanding_lookups == 0;

            if inner.state == BatcherState::Aborted {
                debug!(op = ?op, "lookup finished for aborted batch");
                self.mark_in_flight_op_failed_locked(
                    &mut inner,
                    op,
                    Error::Aborted {
                        message: "batch aborted".to_string(),
                        client_code: None,
                    },
                );
                return;
            }

            if inner.state != BatcherState::ResolvingTablets
                && inner.state != BatcherState::GatheringOps
            {
                error!(state = inner.state.name(), op = ?op, "lookup finished in unexpected state");
                return;
            }

            let mut containment_mismatch = None;
            if let Ok(tablet) = &result {
                let contains = tablet.partition().contains_key(op.partition_key());
                let injected_mismatch = self.config.lookup_mismatch_probability > 0.0
                    && rand::random::<f64>() < self.config.lookup_mismatch_probability;
                if contains && !injected_mismatch {
                    op.set_tablet(Arc::clone(tablet));
                } else {
                    let message = format!(
                        "row for op {:?} not in partition [{:?}, {:?}) of tablet {}, partition key: {:?}",
                        op.operation(),
                        tablet.partition().start_key(),
                        tablet.partition().end_key(),
                        tablet.tablet_id(),
                        op.partition_key(),
                    );
                    error!(tablet = %tablet.tablet_id(), "{message}");
                    containment_mismatch = Some(Error::Internal { message });
                }
            }
            if let Some(mismatch) = containment_mismatch {
                result = Err(mismatch);
            }

            debug!(
                op = ?op,
                ok = result.is_ok(),
                outstanding = inner.outstanding_lookups,
                "tablet lookup finished"
            );

            match result {
                Ok(_) => {
                    if op.mark_buffered() {
                        inner.ops_queue.push(Arc::clone(op));
                    } else {
                        error!(state = ?op.state(), "finished lookup for op in unexpected state");
                    }
                }
                Err(lookup_error) => {
                    op_failed = true;
                    self.mark_in_flight_op_failed_locked(&mut inner, op, lookup_error);
                }
            }
        }

        if op_failed {
            // A pure-failure flush completes here, without dispatch.
            self.check_for_finished_flush();
        }
        if all_lookups_finished {
            self.flush_buffers_if_ready();
        }
    }

    /// Fails the op: removes it from the admitted set and records its
    /// error. Caller holds the batcher lock.
    fn mark_in_flight_op_failed_locked(
        &self,
        inner: &mut BatcherInner,
        op: &Arc<InFlightOp>,
        error: Error,
    ) {
        let removed = inner.ops.remove(&op.sequence_number());
        assert!(removed.is_some(), "op {op:?} missing from the admitted set");

        if error.client_code() == Some(ClientErrorCode::TablePartitionListStale) {
            // The cache saw a newer partition list on the master. Flag the
            // table so the session's retry routes against fresh partitions.
            op.operation().mark_table_partition_list_as_stale();
        }
        self.combine_error_locked(inner, op, error);
    }

    /// Records one op's error. Caller holds the batcher lock.
    fn combine_error_locked(&self, inner: &mut BatcherInner, op: &Arc<InFlightOp>, error: Error) {
        self.error_collector
            .add_error(Arc::clone(op.operation()), error.clone());
        if self.config.combine_errors {
            match &inner.combined_error {
                None => inner.combined_error = Some(error),
                Some(existing) => {
                    if !existing.is_combined()
                        && std::mem::discriminant(existing) != std::mem::discriminant(&error)
                    {
                        inner.combined_error = Some(Error::Combined {
                            message: "multiple failures",
                        });
                    }
                }
            }
        }
        self.had_errors.store(true, Ordering::Release);
    }

    /// Re-entry point for a deferred transaction prepare.
    fn transaction_ready(&self, status: Result<()>) {
        match status {
            Ok(()) => self.execute_operations(false),
            Err(error) => self.abort(error),
        }
    }

    /// The dispatch gate: sorts, groups, and hands off to execution once
    /// every lookup has reported and the flush has been requested.
    fn flush_buffers_if_ready(&self) {
        {
            let mut inner = self.locked();
            if inner.outstanding_lookups != 0 {
                // The final lookup re-enters here.
                debug!(outstanding = inner.outstanding_lookups, "ops still in lookup");
                return;
            }
            if inner.state != BatcherState::ResolvingTablets {
                return;
            }
            if inner.ops_queue.is_empty() {
                // Nothing to prepare; the finished-flush check completes
                // the batch.
                inner.state = BatcherState::TransactionReady;
                return;
            }
            inner.state = BatcherState::TransactionPrepare;
        }

        if self.had_errors.load(Ordering::Acquire) {
            // Abort the ops that did resolve instead of sending a partial
            // batch: session-level retries rely on sequence order covering
            // the whole batch.
            self.abort(Error::Aborted {
                message: "tablet resolution failed for some ops, aborted the whole batch"
                    .to_string(),
                client_code: Some(ClientErrorCode::AbortedBatchDueToFailedTabletLookup),
            });
            return;
        }

        let mut version_mismatch = None;
        {
            let mut inner = self.locked();
            inner.ops_queue.sort_by_key(|op| {
                let tablet = op.tablet().expect("queued op without a resolved tablet");
                (
                    tablet.tablet_id(),
                    op.operation().group(),
                    op.sequence_number(),
                )
            });

            let mut groups: Vec<OpsGroup> = Vec::new();
            let mut current_key: Option<(TabletId, OpGroup)> = None;
            for op in &inner.ops_queue {
                let tablet = op.tablet().expect("queued op without a resolved tablet");

                // An op admitted against partition list V must not be sent
                // to a tablet that has since re-split.
                if let Some(expected) = op.operation().partition_list_version() {
                    let actual = tablet.partition_list_version();
                    if expected != actual {
                        // The table re-split under us; flag it so the
                        // session's retry routes against fresh partitions.
                        op.operation().mark_table_partition_list_as_stale();
                        version_mismatch = Some(Error::Aborted {
                            message: format!(
                                "op {:?} expected table partition list version {expected}, \
                                 but tablet {} has version {actual}",
                                op.operation(),
                                tablet.tablet_id(),
                            ),
                            client_code: Some(ClientErrorCode::TablePartitionListVersionMismatch),
                        });
                        break;
                    }
                }

                let key = (tablet.tablet_id(), op.operation().group());
                if current_key != Some(key) {
                    groups.push(OpsGroup {
                        ops: Vec::new(),
                        need_metadata: false,
                    });
                    current_key = Some(key);
                }
                if let Some(group) = groups.last_mut() {
                    group.ops.push(Arc::clone(op));
                }
            }

            if version_mismatch.is_none() {
                if self.transaction.is_some() {
                    // Transaction metadata travels with the first call.
                    if let Some(first) = groups.first_mut() {
                        first.need_metadata = true;
                    }
                }
                inner.ops_info = OpsInfo { groups };
            }
        }

        if let Some(error) = version_mismatch {
            self.abort(error);
            return;
        }

        self.execute_operations(true);
    }

    /// Runs the transaction prepare (if any) and sends the per-group calls.
    fn execute_operations(&self, initial: bool) {
        if let Some(transaction) = &self.transaction {
            // The transaction initializes metadata used by the calls. If it
            // is not ready yet it keeps the callback and we yield here.
            let (ops_info, deadline) = {
                let inner = self.locked();
                (inner.ops_info.clone(), inner.deadline)
            };
            let batcher = self.shared_from_this();
            let ready = transaction.prepare(
                &ops_info,
                self.force_consistent_read,
                deadline,
                initial,
                Box::new(move |status| batcher.transaction_ready(status)),
            );
            if !ready {
                return;
            }
        }

        {
            let mut inner = self.locked();
            if inner.state != BatcherState::TransactionPrepare {
                // Aborted while preparing.
                if inner.state != BatcherState::Aborted {
                    error!(
                        state = inner.state.name(),
                        "batcher in unexpected state at the moment the transaction became ready"
                    );
                }
                return;
            }
            inner.state = BatcherState::TransactionReady;
        }

        let (groups, need_consistent_read, deadline) = {
            let mut inner = self.locked();
            if inner.ops_queue.is_empty() {
                return;
            }
            // Consistent read is not required when the whole batch fits
            // into one call.
            let need_consistent_read = self.force_consistent_read
                || self.transaction.is_some()
                || inner.ops_info.groups.len() > 1;

            let grouped: usize = inner.ops_info.groups.iter().map(|g| g.ops.len()).sum();
            if grouped != inner.ops_queue.len() {
                error!(
                    grouped,
                    queued = inner.ops_queue.len(),
                    "ready queue was modified while forming dispatch groups"
                );
            }
            // The calls own their op slices now.
            inner.ops_queue.clear();
            let deadline = inner.deadline;
            (
                std::mem::take(&mut inner.ops_info).groups,
                need_consistent_read,
                deadline,
            )
        };
        if groups.is_empty() {
            return;
        }

        let last_index = groups.len() - 1;
        let rpcs: Vec<GroupRpc> = groups
            .iter()
            .enumerate()
            .map(|(index, group)| {
                let allow_local_calls =
                    self.config.allow_local_calls_in_curr_thread && index == last_index;
                self.create_rpc(group, allow_local_calls, need_consistent_read, deadline)
            })
            .collect();

        for rpc in rpcs {
            if let Some(transaction) = &self.transaction {
                rpc.span().follows_from(transaction.span().id());
            }
            rpc.send();
        }
    }

    /// Builds the call for one dispatch group.
    fn create_rpc(
        &self,
        group: &OpsGroup,
        allow_local_calls: bool,
        need_consistent_read: bool,
        deadline: Instant,
    ) -> GroupRpc {
        assert!(!group.ops.is_empty(), "empty dispatch group");
        let tablet = Arc::clone(group.tablet());
        let op_group = group.ops[0].operation().group();
        debug!(
            tablet = %tablet.tablet_id(),
            group = ?op_group,
            ops = group.ops.len(),
            "dispatching group"
        );
        let data = RpcData {
            batcher: self.shared_from_this(),
            tablet,
            ops: group.ops.clone(),
            allow_local_calls,
            need_consistent_read,
            need_metadata: group.need_metadata,
            deadline,
        };
        match op_group {
            OpGroup::Write => GroupRpc::Write(WriteRpc::new(data)),
            OpGroup::LeaderRead => GroupRpc::Read(ReadRpc::new(data, ConsistencyLevel::Strong)),
            OpGroup::ConsistentPrefixRead => {
                GroupRpc::Read(ReadRpc::new(data, ConsistencyLevel::ConsistentPrefix))
            }
        }
    }

    /// Folds a whole-call failure into every op the call carried.
    fn process_rpc_status(&self, ops: &InFlightOps, status: &Result<()>) {
        let mut inner = self.locked();
        if inner.state != BatcherState::TransactionReady {
            warn!(
                state = inner.state.name(),
                ok = status.is_ok(),
                "rpc response in unexpected state, dropped"
            );
            return;
        }
        if let Err(error) = status {
            for op in ops {
                self.combine_error_locked(&mut inner, op, error.clone());
            }
        }
    }

    /// Handles a completed write call: whole-call status, clock
    /// propagation, and per-row errors.
    pub(crate) fn process_write_response(
        &self,
        ops: &InFlightOps,
        tablet_id: TabletId,
        result: &std::result::Result<WriteResponse, RpcError>,
    ) {
        let status = result
            .as_ref()
            .map(|_| ())
            .map_err(|error| Error::from(error.clone()));
        self.process_rpc_status(ops, &status);

        let Ok(response) = result else { return };
        if let Some(propagated) = response.propagated_hybrid_time {
            self.client.update_latest_observed_hybrid_time(propagated);
        }

        for per_row in &response.per_row_errors {
            if per_row.row_index >= ops.len() {
                error!(
                    row_index = per_row.row_index,
                    sent = ops.len(),
                    tablet = %tablet_id,
                    "per-row error for an out-of-bound op index"
                );
                continue;
            }
            let op = &ops[per_row.row_index];
            debug!(op = ?op, error = %per_row.error, "per-row error");
            let mut inner = self.locked();
            self.combine_error_locked(&mut inner, op, per_row.error.clone());
        }
    }

    /// Handles a completed read call.
    pub(crate) fn process_read_response(&self, ops: &InFlightOps, status: &Result<()>) {
        self.process_rpc_status(ops, status);
    }

    /// Retires the ops of a completed call: transaction bookkeeping, read
    /// point advance, removal from the admitted set.
    pub(crate) fn remove_in_flight_ops_after_flushing(
        &self,
        ops: &InFlightOps,
        status: &Result<()>,
        extra: FlushExtraResult,
    ) {
        if let Some(transaction) = &self.transaction {
            let ops_will_be_retried = status
                .as_ref()
                .err()
                .is_some_and(Error::is_session_retriable);
            // Ops the session will retry stay accounted to the transaction
            // until the retry resolves them, so it keeps running.
            if !ops_will_be_retried {
                transaction.flushed(ops, extra.used_read_time, status);
            }
        }
        if status.is_ok() {
            if let (Some(read_point), Some(propagated)) =
                (&self.read_point, extra.propagated_hybrid_time)
            {
                read_point.update_clock(propagated);
            }
        }

        let mut inner = self.locked();
        for op in ops {
            let removed = inner.ops.remove(&op.sequence_number());
            assert!(removed.is_some(), "op {op:?} missing from the admitted set");
        }
    }

    /// Completes the batch once the admitted set drains.
    pub(crate) fn check_for_finished_flush(&self) {
        let session;
        {
            let mut inner = self.locked();
            if !inner.ops.is_empty() {
                return;
            }
            match inner.state {
                // Complete: a second caller raced us past the drain.
                // GatheringOps: a lookup failed while ops were still being
                // added. Aborted: the abort path already ran the callback.
                BatcherState::Complete | BatcherState::GatheringOps | BatcherState::Aborted => {
                    return;
                }
                BatcherState::ResolvingTablets | BatcherState::TransactionReady => {}
                BatcherState::TransactionPrepare => {
                    error!(state = inner.state.name(), "batcher finished in unexpected state");
                    return;
                }
            }
            session = self.weak_session.upgrade();
            inner.state = BatcherState::Complete;
        }

        // Outside the lock: the session lock orders before the batcher
        // lock.
        if let Some(session) = session {
            session.flush_finished(self);
        }

        let (callback, status) = {
            let mut inner = self.locked();
            let status = if let Some(error) = inner.combined_error.clone() {
                Err(error)
            } else if self.had_errors.load(Ordering::Acquire) {
                // The caller fetches per-op detail from the error
                // collector.
                Err(Error::Io {
                    message: ERROR_REACHING_TABLET_SERVERS_MSG.to_string(),
                })
            } else {
                Ok(())
            };
            (inner.flush_callback.take(), status)
        };
        match callback {
            Some(callback) => self.run_flush_callback(callback, status),
            None => error!("flush finished without a pending callback"),
        }
    }

    /// Hands the flush callback to the callback runtime, consuming it.
    fn run_flush_callback(&self, callback: FlushCallback, status: Result<()>) {
        self.client.run_callback(Box::new(move || callback(status)));
    }
}

impl fmt::Debug for Batcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher")
            .field("force_consistent_read", &self.force_consistent_read)
            .field("had_errors", &self.had_errors.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let Ok(inner) = self.inner.get_mut() else {
            return;
        };
        for op in inner.ops.values() {
            error!(op = ?op, "orphaned in-flight op");
        }
        assert!(
            inner.ops.is_empty(),
            "batcher dropped with {} in-flight ops",
            inner.ops.len()
        );
        assert!(
            inner.state.is_terminal(),
            "batcher dropped in state {}",
            inner.state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(BatcherState::Complete.is_terminal());
        assert!(BatcherState::Aborted.is_terminal());
        assert!(!BatcherState::GatheringOps.is_terminal());
        assert!(!BatcherState::ResolvingTablets.is_terminal());
        assert!(!BatcherState::TransactionPrepare.is_terminal());
        assert!(!BatcherState::TransactionReady.is_terminal());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(BatcherState::GatheringOps.name(), "gathering-ops");
        assert_eq!(format!("{}", BatcherState::Aborted), "aborted");
    }

    #[test]
    fn test_config_defaults() {
        let config = BatcherConfig::default();
        assert!(!config.combine_errors);
        assert!(config.allow_local_calls_in_curr_thread);
        assert!((config.lookup_mismatch_probability - 0.0).abs() < f64::EPSILON);
    }
}
