//! Per-tablet RPCs and the transport contract.
//!
//! Dispatch turns each group of the sorted ready queue into exactly one
//! RPC: writes go out as write RPCs, reads as strong or consistent-prefix
//! read RPCs. The RPC owns its slice of in-flight ops until the response is
//! processed; completion feeds statuses back into the batcher and then
//! removes the ops from the admitted set.
//!
//! Wire encoding is the messenger's concern - requests carry operation
//! handles, not bytes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use basalt_core::{Error, HybridTime, RequestId, TabletId};
use thiserror::Error as ThisError;
use tracing::{debug_span, Instrument, Span};

use crate::batcher::Batcher;
use crate::in_flight_op::InFlightOps;
use crate::meta_cache::RemoteTablet;
use crate::operation::RowOperation;

/// Transport-level RPC failures.
#[derive(Debug, Clone, ThisError)]
pub enum RpcError {
    /// The connection to the tablet server could not be established or broke.
    #[error("connection to tablet server failed: {message}")]
    ConnectionFailed {
        /// What the transport reported.
        message: String,
    },

    /// The call did not complete before its deadline.
    #[error("rpc timed out after {elapsed_ms}ms")]
    TimedOut {
        /// How long the call ran before the deadline cut it off.
        elapsed_ms: u64,
    },

    /// The tablet server rejected the call as a whole.
    #[error("remote error: {0}")]
    Remote(Error),

    /// The messenger is shut down.
    #[error("messenger is shut down")]
    Shutdown,
}

impl From<RpcError> for Error {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Remote(inner) => inner,
            RpcError::TimedOut { .. } => Self::TimedOut { operation: "rpc" },
            other => Self::Io {
                message: other.to_string(),
            },
        }
    }
}

/// Read consistency carried by a read RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    /// Serve from the tablet leader.
    Strong,
    /// Serve a consistent prefix, possibly from a follower.
    ConsistentPrefix,
}

/// A batched write call for one tablet.
pub struct WriteRequest {
    /// The target tablet.
    pub tablet_id: TabletId,
    /// The operations to apply, in admission sequence order.
    pub operations: Vec<Arc<dyn RowOperation>>,
    /// Retryable request identifier drawn from the per-tablet allocator.
    pub request_id: RequestId,
    /// Smallest request id still running against this tablet.
    pub min_running_request_id: RequestId,
    /// Whether the batch requires a consistent-read snapshot.
    pub need_consistent_read: bool,
    /// Whether the call must carry transaction metadata.
    pub need_transaction_metadata: bool,
    /// Whether the transport may complete this call on the current thread.
    pub allow_local_calls: bool,
    /// Absolute deadline for the call.
    pub deadline: Instant,
    /// Backpressure score in `[0.0, 1.0]`, 0.0 when no source is attached.
    pub rejection_score: f64,
}

/// Per-row failure inside an otherwise successful write response.
#[derive(Debug, Clone)]
pub struct PerRowError {
    /// Index of the failed operation within the request's operation list.
    pub row_index: usize,
    /// The failure for that row.
    pub error: Error,
}

/// Response to a [`WriteRequest`].
#[derive(Debug, Clone, Default)]
pub struct WriteResponse {
    /// Hybrid time propagated by the tablet server, if any.
    pub propagated_hybrid_time: Option<HybridTime>,
    /// The read time the server used, for transactional bookkeeping.
    pub used_read_time: Option<HybridTime>,
    /// Failures for individual rows; the call itself succeeded.
    pub per_row_errors: Vec<PerRowError>,
}

/// A batched read call for one tablet.
pub struct ReadRequest {
    /// The target tablet.
    pub tablet_id: TabletId,
    /// The operations to serve, in admission sequence order.
    pub operations: Vec<Arc<dyn RowOperation>>,
    /// Read consistency for this call.
    pub consistency: ConsistencyLevel,
    /// Whether the batch requires a consistent-read snapshot.
    pub need_consistent_read: bool,
    /// Whether the call must carry transaction metadata.
    pub need_transaction_metadata: bool,
    /// Whether the transport may complete this call on the current thread.
    pub allow_local_calls: bool,
    /// Absolute deadline for the call.
    pub deadline: Instant,
}

/// Response to a [`ReadRequest`].
#[derive(Debug, Clone, Default)]
pub struct ReadResponse {
    /// Hybrid time propagated by the tablet server, if any.
    pub propagated_hybrid_time: Option<HybridTime>,
    /// The read time the server used, for transactional bookkeeping.
    pub used_read_time: Option<HybridTime>,
}

/// The RPC transport: encodes requests, talks to tablet servers.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends a write call and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns an [`RpcError`] when the call fails as a whole; per-row
    /// failures come back inside an `Ok` response.
    async fn write(&self, request: WriteRequest) -> Result<WriteResponse, RpcError>;

    /// Sends a read call and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns an [`RpcError`] when the call fails as a whole.
    async fn read(&self, request: ReadRequest) -> Result<ReadResponse, RpcError>;
}

/// Side results of a completed RPC, beyond the per-op statuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushExtraResult {
    /// Hybrid time propagated by the tablet server.
    pub propagated_hybrid_time: Option<HybridTime>,
    /// The read time the server actually used.
    pub used_read_time: Option<HybridTime>,
}

/// Everything an RPC needs from the dispatch path.
pub(crate) struct RpcData {
    pub(crate) batcher: Arc<Batcher>,
    pub(crate) tablet: Arc<RemoteTablet>,
    pub(crate) ops: InFlightOps,
    pub(crate) allow_local_calls: bool,
    pub(crate) need_consistent_read: bool,
    pub(crate) need_metadata: bool,
    pub(crate) deadline: Instant,
}

impl RpcData {
    fn operations(&self) -> Vec<Arc<dyn RowOperation>> {
        self.ops
            .iter()
            .map(|op| Arc::clone(op.operation()))
            .collect()
    }
}

/// A write RPC for one dispatch group.
pub(crate) struct WriteRpc {
    data: RpcData,
    request_id: RequestId,
    min_running_request_id: RequestId,
    span: Span,
}

impl WriteRpc {
    /// Builds the RPC and draws its retryable request id.
    pub(crate) fn new(data: RpcData) -> Arc<Self> {
        let (request_id, min_running_request_id) = data
            .batcher
            .client()
            .next_request_id_and_min_running(data.tablet.tablet_id());
        let span = debug_span!(
            "write_rpc",
            tablet = %data.tablet.tablet_id(),
            request = %request_id,
            ops = data.ops.len(),
        );
        Arc::new(Self {
            data,
            request_id,
            min_running_request_id,
            span,
        })
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Fires the call; completion re-enters the batcher.
    pub(crate) fn send(self: Arc<Self>) {
        let client = Arc::clone(self.data.batcher.client());
        let span = self.span.clone();
        client.spawn(
            async move {
                let request = WriteRequest {
                    tablet_id: self.data.tablet.tablet_id(),
                    operations: self.data.operations(),
                    request_id: self.request_id,
                    min_running_request_id: self.min_running_request_id,
                    need_consistent_read: self.data.need_consistent_read,
                    need_transaction_metadata: self.data.need_metadata,
                    allow_local_calls: self.data.allow_local_calls,
                    deadline: self.data.deadline,
                    rejection_score: self.data.batcher.rejection_score(1),
                };
                let started = Instant::now();
                let result = match tokio::time::timeout_at(
                    self.data.deadline.into(),
                    self.data.batcher.client().messenger().write(request),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::TimedOut {
                        elapsed_ms: elapsed_ms_since(started),
                    }),
                };
                self.finished(&result);
            }
            .instrument(span),
        );
    }

    fn finished(&self, result: &Result<WriteResponse, RpcError>) {
        let batcher = &self.data.batcher;
        let status = rpc_status(result);
        batcher.process_write_response(&self.data.ops, self.data.tablet.tablet_id(), result);
        let extra = result.as_ref().map(flush_extra_of_write).unwrap_or_default();
        batcher.remove_in_flight_ops_after_flushing(&self.data.ops, &status, extra);
        batcher
            .client()
            .request_finished(self.data.tablet.tablet_id(), self.request_id);
        batcher.check_for_finished_flush();
    }
}

/// A read RPC for one dispatch group.
pub(crate) struct ReadRpc {
    data: RpcData,
    consistency: ConsistencyLevel,
    span: Span,
}

impl ReadRpc {
    pub(crate) fn new(data: RpcData, consistency: ConsistencyLevel) -> Arc<Self> {
        let span = debug_span!(
            "read_rpc",
            tablet = %data.tablet.tablet_id(),
            consistency = ?consistency,
            ops = data.ops.len(),
        );
        Arc::new(Self {
            data,
            consistency,
            span,
        })
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Fires the call; completion re-enters the batcher.
    pub(crate) fn send(self: Arc<Self>) {
        let client = Arc::clone(self.data.batcher.client());
        let span = self.span.clone();
        client.spawn(
            async move {
                let request = ReadRequest {
                    tablet_id: self.data.tablet.tablet_id(),
                    operations: self.data.operations(),
                    consistency: self.consistency,
                    need_consistent_read: self.data.need_consistent_read,
                    need_transaction_metadata: self.data.need_metadata,
                    allow_local_calls: self.data.allow_local_calls,
                    deadline: self.data.deadline,
                };
                let started = Instant::now();
                let result = match tokio::time::timeout_at(
                    self.data.deadline.into(),
                    self.data.batcher.client().messenger().read(request),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::TimedOut {
                        elapsed_ms: elapsed_ms_since(started),
                    }),
                };
                self.finished(&result);
            }
            .instrument(span),
        );
    }

    fn finished(&self, result: &Result<ReadResponse, RpcError>) {
        let batcher = &self.data.batcher;
        let status = rpc_status(result);
        batcher.process_read_response(&self.data.ops, &status);
        let extra = result.as_ref().map(flush_extra_of_read).unwrap_or_default();
        batcher.remove_in_flight_ops_after_flushing(&self.data.ops, &status, extra);
        batcher.check_for_finished_flush();
    }
}

/// One dispatch group's outgoing call.
pub(crate) enum GroupRpc {
    Write(Arc<WriteRpc>),
    Read(Arc<ReadRpc>),
}

impl GroupRpc {
    pub(crate) fn span(&self) -> &Span {
        match self {
            Self::Write(rpc) => rpc.span(),
            Self::Read(rpc) => rpc.span(),
        }
    }

    pub(crate) fn send(self) {
        match self {
            Self::Write(rpc) => rpc.send(),
            Self::Read(rpc) => rpc.send(),
        }
    }
}

fn rpc_status<T>(result: &Result<T, RpcError>) -> basalt_core::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(error) => Err(Error::from(error.clone())),
    }
}

fn flush_extra_of_write(response: &WriteResponse) -> FlushExtraResult {
    FlushExtraResult {
        propagated_hybrid_time: response.propagated_hybrid_time,
        used_read_time: response.used_read_time,
    }
}

fn flush_extra_of_read(response: &ReadResponse) -> FlushExtraResult {
    FlushExtraResult {
        propagated_hybrid_time: response.propagated_hybrid_time,
        used_read_time: response.used_read_time,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms_since(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_conversion() {
        let remote = RpcError::Remote(Error::NotFound {
            message: "tablet gone".to_string(),
        });
        assert_eq!(
            Error::from(remote),
            Error::NotFound {
                message: "tablet gone".to_string()
            }
        );

        let timed_out = RpcError::TimedOut { elapsed_ms: 250 };
        assert_eq!(Error::from(timed_out), Error::TimedOut { operation: "rpc" });

        let connection = RpcError::ConnectionFailed {
            message: "refused".to_string(),
        };
        assert!(matches!(Error::from(connection), Error::Io { .. }));
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::TimedOut { elapsed_ms: 42 };
        assert_eq!(format!("{err}"), "rpc timed out after 42ms");
    }
}
