//! Basalt Core - Strongly-typed identifiers and the shared status model.
//!
//! This crate provides the Basalt-specific primitive types shared between
//! the client driver and its collaborators. It does NOT provide transport,
//! caching, or batching - those live in `basalt-client`.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `TableId` with a `TabletId`
//! - **Explicit error variants**: Every failure carries structured context
//! - **Explicit types**: Use u16/u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod types;

pub use error::{ClientErrorCode, Error, Result};
pub use types::{HybridTime, PartitionListVersion, RequestId, SequenceNumber, TableId, TabletId};
