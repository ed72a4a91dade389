// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local apply sink: where replicated records land.
//!
//! The relay only needs three things from local storage, captured by
//! [`ApplySink`]:
//!
//! 1. The last durably applied offset (`current_offset`)
//! 2. Idempotent single-record apply (`apply_record`)
//! 3. All-or-nothing batch apply that advances the offset (`apply_batch`)
//!
//! Implementations shipped here:
//!
//! - [`SqliteSink`]: durable key/value replica in SQLite (WAL mode)
//! - [`MemorySink`]: in-process replica for embedding and tests
//! - [`LoggingSink`]: decorator that logs and counts, then delegates
//!
//! # Example
//!
//! ```rust,no_run
//! use wal_relay::sink::{ApplySink, BoxFuture, SinkResult};
//! use wal_relay::{Offset, WalBatch, WalRecord};
//!
//! struct Discard;
//!
//! impl ApplySink for Discard {
//!     fn current_offset(&self) -> Option<Offset> {
//!         None
//!     }
//!
//!     fn apply_record(&self, _record: WalRecord) -> BoxFuture<'_, SinkResult<()>> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn apply_batch<'a>(&'a self, _batch: &'a WalBatch) -> BoxFuture<'a, SinkResult<()>> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

mod logging;
mod memory;
mod sqlite;

pub use logging::{LoggingSink, LoggingSinkStats};
pub use memory::MemorySink;
pub use sqlite::SqliteSink;

use crate::batch::{WalBatch, WalRecord};
use crate::offset::Offset;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type for sink operations.
pub type SinkResult<T> = std::result::Result<T, ApplyError>;

/// Why an apply did not take effect.
///
/// After any `ApplyError` the sink's durable offset is unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// Local storage rejected the write (I/O, locking, constraint).
    #[error("storage error: {0}")]
    Storage(String),

    /// The record cannot be represented locally.
    #[error("malformed record at {offset}: {reason}")]
    Malformed { offset: Offset, reason: String },
}

/// What the relay needs from local storage.
///
/// Implementations must make `apply_batch` atomic: either every record in
/// the batch is applied and `current_offset` becomes the batch position, or
/// nothing changes. Records at or below `current_offset` are no-ops, so
/// replaying a batch is harmless.
///
/// The relay calls the apply methods from a single task and never overlaps
/// them; `current_offset` may be called concurrently from other tasks.
pub trait ApplySink: Send + Sync + 'static {
    /// Last durably applied position, or `None` if nothing was ever applied.
    fn current_offset(&self) -> Option<Offset>;

    /// Apply a single record. A record at or below `current_offset` is a no-op.
    fn apply_record(&self, record: WalRecord) -> BoxFuture<'_, SinkResult<()>>;

    /// Apply a whole batch, all or nothing.
    fn apply_batch<'a>(&'a self, batch: &'a WalBatch) -> BoxFuture<'a, SinkResult<()>>;
}

/// Records of `batch` that are newer than `current`.
pub(crate) fn pending_records(batch: &WalBatch, current: Option<Offset>) -> Vec<&WalRecord> {
    batch
        .records()
        .iter()
        .filter(|r| current.map_or(true, |c| r.offset > c))
        .collect()
}
