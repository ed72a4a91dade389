//! Failure-injecting apply sink.
//!
//! Wraps a [`MemorySink`] and records every batch that was applied
//! successfully. Failures and blocking are switched on per test.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use wal_relay::sink::{BoxFuture, SinkResult};
use wal_relay::{ApplyError, ApplySink, MemorySink, Offset, WalBatch, WalRecord};

pub struct MockSink {
    inner: MemorySink,
    applied: Mutex<Vec<WalBatch>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
    block: AtomicBool,
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSink {
    pub fn new() -> Self {
        Self::wrap(MemorySink::new())
    }

    /// A sink that already holds data up to `offset`.
    pub fn starting_at(offset: Offset) -> Self {
        Self::wrap(MemorySink::starting_at(offset))
    }

    fn wrap(inner: MemorySink) -> Self {
        Self {
            inner,
            applied: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            block: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` apply attempts.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.fail_always.store(true, Ordering::SeqCst);
    }

    /// Block every apply until the future is dropped.
    pub fn block_applies(&self) {
        self.block.store(true, Ordering::SeqCst);
    }

    pub fn store(&self) -> &MemorySink {
        &self.inner
    }

    /// Batches applied successfully, in order.
    pub fn applied(&self) -> Vec<WalBatch> {
        self.applied.lock().unwrap().clone()
    }

    /// Offsets of every record applied successfully, in order.
    pub fn applied_offsets(&self) -> Vec<Offset> {
        self.applied()
            .iter()
            .flat_map(|b| b.records().iter().map(|r| r.offset))
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ApplySink for MockSink {
    fn current_offset(&self) -> Option<Offset> {
        self.inner.current_offset()
    }

    fn apply_record(&self, record: WalRecord) -> BoxFuture<'_, SinkResult<()>> {
        self.inner.apply_record(record)
    }

    fn apply_batch<'a>(&'a self, batch: &'a WalBatch) -> BoxFuture<'a, SinkResult<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.block.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.injected_failure() {
                return Err(ApplyError::Storage("injected failure".to_string()));
            }
            self.inner.apply_batch(batch).await?;
            self.applied.lock().unwrap().push(batch.clone());
            Ok(())
        })
    }
}
