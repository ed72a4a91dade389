//! Logging decorator for apply sinks.
//!
//! [`LoggingSink`] is generic over [`ApplySink`], so it can only wrap
//! something that can actually apply. It logs, counts, then delegates and
//! returns the inner result unchanged.

use super::{ApplySink, BoxFuture, SinkResult};
use crate::batch::{WalBatch, WalRecord};
use crate::metrics;
use crate::offset::Offset;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Counters kept by a [`LoggingSink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggingSinkStats {
    pub records_received: u64,
    pub batches_received: u64,
    pub failures: u64,
}

/// Wraps a sink with per-call logging and counters.
pub struct LoggingSink<S: ApplySink> {
    inner: S,
    namespace: String,
    records: AtomicU64,
    batches: AtomicU64,
    failures: AtomicU64,
}

impl<S: ApplySink> LoggingSink<S> {
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
            records: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn stats(&self) -> LoggingSinkStats {
        LoggingSinkStats {
            records_received: self.records.load(Ordering::Relaxed),
            batches_received: self.batches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn note_result(&self, result: &SinkResult<()>, position: Offset) {
        if let Err(e) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(namespace = %self.namespace, position = %position, error = %e, "Apply failed");
        }
    }
}

impl<S: ApplySink> ApplySink for LoggingSink<S> {
    fn current_offset(&self) -> Option<Offset> {
        self.inner.current_offset()
    }

    fn apply_record(&self, record: WalRecord) -> BoxFuture<'_, SinkResult<()>> {
        Box::pin(async move {
            self.records.fetch_add(1, Ordering::Relaxed);
            info!(
                namespace = %self.namespace,
                offset = %record.offset,
                op = %record.op,
                key = %record.key,
                bytes = record.value_len(),
                "Received WAL record"
            );
            let position = record.offset;
            let result = self.inner.apply_record(record).await;
            self.note_result(&result, position);
            result
        })
    }

    fn apply_batch<'a>(&'a self, batch: &'a WalBatch) -> BoxFuture<'a, SinkResult<()>> {
        Box::pin(async move {
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.records.fetch_add(batch.len() as u64, Ordering::Relaxed);
            info!(
                namespace = %self.namespace,
                records = batch.len(),
                first = %batch.first_offset(),
                position = %batch.position(),
                "Received WAL batch"
            );
            metrics::record_batch_received(&self.namespace, batch.len(), batch.payload_bytes());
            let result = self.inner.apply_batch(batch).await;
            self.note_result(&result, batch.position());
            result
        })
    }
}
