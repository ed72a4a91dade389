// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upstream WAL stream sources.
//!
//! An [`UpstreamSource`] opens subscriptions; each subscription is a
//! [`BatchStream`] that yields batches strictly after the start offset, in
//! order. A stream is single-use: once it ends or fails, the relay drops it
//! and subscribes again from its last applied offset.
//!
//! ```text
//! subscribe(start) ──► BatchStream ──► Ok(Some(batch)) ... Ok(Some(batch))
//!                                  └─► Ok(None)   clean end, reconnect
//!                                  └─► Err(e)     failure, reconnect (or fatal)
//! ```

mod redis;

pub use self::redis::{compute_content_hash, maybe_decompress, RedisBatchStream, RedisSource};

use crate::batch::WalBatch;
use crate::error::Result;
use crate::offset::Offset;
use crate::sink::BoxFuture;

/// Something the relay can subscribe to.
pub trait UpstreamSource: Send + Sync + 'static {
    type Stream: BatchStream;

    /// Open a stream of batches strictly after `start`.
    fn subscribe<'a>(&'a self, start: Offset, namespace: &'a str) -> BoxFuture<'a, Result<Self::Stream>>;

    /// Human-readable upstream address, for logs and errors.
    fn describe(&self) -> String;
}

/// One live subscription.
pub trait BatchStream: Send + 'static {
    /// Wait for the next batch.
    ///
    /// `Ok(None)` means the upstream closed the stream cleanly. Dropping the
    /// returned future must be safe at any point (it is raced against
    /// shutdown).
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<WalBatch>>>;

    /// Latest upstream position known to this stream, if any.
    fn upstream_tail(&self) -> Option<Offset>;
}
