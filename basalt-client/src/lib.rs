//! Basalt Client - client-side batching for the Basalt distributed database.
//!
//! This crate implements the driver's batcher: it accepts a stream of row
//! operations, resolves each to its owning tablet through the metadata
//! cache, groups resolved operations into per-tablet calls, dispatches
//! them, and folds the per-operation outcomes into a single flush result.
//!
//! # Design (`TigerStyle`)
//!
//! - **Single-use batchers**: One gather/flush cycle per instance, cheap to
//!   create
//! - **No blocking**: Every slow interaction is fire-and-forget with a
//!   completion callback
//! - **Explicit ordering**: Operations keep their admission order inside
//!   each per-tablet call
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod batcher;
mod client;
mod error_collector;
mod in_flight_op;
mod meta_cache;
mod operation;
mod partition;
mod read_point;
mod rpc;
mod session;
mod table;
mod transaction;

pub use batcher::{
    Batcher, BatcherConfig, BatcherState, FlushCallback, ERROR_REACHING_TABLET_SERVERS_MSG,
    FLUSH_DEADLINE_DEFAULT,
};
pub use client::{ClientContext, RejectionScoreSource};
pub use error_collector::{CollectedError, ErrorCollector};
pub use in_flight_op::{InFlightOp, InFlightOpState, InFlightOps};
pub use meta_cache::{MetaCache, RemoteTablet};
pub use operation::{OpGroup, OperationKind, RowOperation};
pub use partition::{decode_hash_code, encode_hash_code, Partition, PARTITION_HASH_CODE_LEN};
pub use read_point::ConsistentReadPoint;
pub use rpc::{
    ConsistencyLevel, FlushExtraResult, Messenger, PerRowError, ReadRequest, ReadResponse,
    RpcError, WriteRequest, WriteResponse,
};
pub use session::Session;
pub use table::{PartitionScheme, TableHandle};
pub use transaction::{OpsGroup, OpsInfo, PrepareReadyCallback, Transaction};
