//! In-memory apply sink.

use super::{pending_records, ApplyError, ApplySink, BoxFuture, SinkResult};
use crate::batch::{WalBatch, WalOp, WalRecord};
use crate::offset::{Offset, OffsetCell};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::trace;

/// Replica kept in a `BTreeMap`. Nothing survives the process.
///
/// Every record is validated before any is written, so a rejected batch
/// leaves both the map and the offset untouched.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<BTreeMap<String, Vec<u8>>>,
    offset: OffsetCell,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start as if everything up to `offset` had already been applied.
    pub fn starting_at(offset: Offset) -> Self {
        Self {
            state: Mutex::new(BTreeMap::new()),
            offset: OffsetCell::new(Some(offset)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_empty()
    }

    /// Copy of the whole replica.
    pub async fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().await.clone()
    }

    async fn apply_records(&self, records: &[&WalRecord], position: Offset) -> SinkResult<()> {
        for record in records {
            if record.op == WalOp::Put && record.value.is_none() {
                return Err(ApplyError::Malformed {
                    offset: record.offset,
                    reason: "PUT without value".to_string(),
                });
            }
        }

        let mut state = self.state.lock().await;
        for record in records {
            match &record.value {
                Some(value) if record.op == WalOp::Put => {
                    state.insert(record.key.clone(), value.clone());
                }
                _ => {
                    state.remove(&record.key);
                }
            }
            trace!(offset = %record.offset, op = %record.op, key = %record.key, "Applied record");
        }
        self.offset.publish(position);
        Ok(())
    }
}

impl ApplySink for MemorySink {
    fn current_offset(&self) -> Option<Offset> {
        self.offset.load()
    }

    fn apply_record(&self, record: WalRecord) -> BoxFuture<'_, SinkResult<()>> {
        Box::pin(async move {
            if self.offset.load().is_some_and(|c| record.offset <= c) {
                return Ok(());
            }
            let position = record.offset;
            self.apply_records(&[&record], position).await
        })
    }

    fn apply_batch<'a>(&'a self, batch: &'a WalBatch) -> BoxFuture<'a, SinkResult<()>> {
        Box::pin(async move {
            let pending = pending_records(batch, self.offset.load());
            if pending.is_empty() {
                return Ok(());
            }
            self.apply_records(&pending, batch.position()).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(records: Vec<WalRecord>) -> WalBatch {
        WalBatch::new(records).unwrap()
    }

    #[tokio::test]
    async fn test_apply_batch_advances_offset() {
        let sink = MemorySink::new();
        assert_eq!(sink.current_offset(), None);

        sink.apply_batch(&batch(vec![
            WalRecord::put(Offset::new(0, 1), "a", b"1".to_vec()),
            WalRecord::put(Offset::new(0, 2), "b", b"2".to_vec()),
            WalRecord::delete(Offset::new(0, 3), "a"),
        ]))
        .await
        .unwrap();

        assert_eq!(sink.current_offset(), Some(Offset::new(0, 3)));
        assert_eq!(sink.get("a").await, None);
        assert_eq!(sink.get("b").await, Some(b"2".to_vec()));
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn test_apply_record_is_idempotent() {
        let sink = MemorySink::new();
        let rec = WalRecord::put(Offset::new(0, 5), "k", b"v1".to_vec());
        sink.apply_record(rec).await.unwrap();

        // Same offset, different payload: must be ignored
        let replay = WalRecord::put(Offset::new(0, 5), "k", b"v2".to_vec());
        sink.apply_record(replay).await.unwrap();
        let older = WalRecord::delete(Offset::new(0, 4), "k");
        sink.apply_record(older).await.unwrap();

        assert_eq!(sink.get("k").await, Some(b"v1".to_vec()));
        assert_eq!(sink.current_offset(), Some(Offset::new(0, 5)));
    }

    #[tokio::test]
    async fn test_malformed_batch_changes_nothing() {
        let sink = MemorySink::new();
        let bad = batch(vec![
            WalRecord::put(Offset::new(0, 1), "a", b"1".to_vec()),
            WalRecord {
                offset: Offset::new(0, 2),
                op: WalOp::Put,
                key: "b".to_string(),
                value: None,
            },
        ]);

        let err = sink.apply_batch(&bad).await.unwrap_err();
        assert!(matches!(err, ApplyError::Malformed { offset, .. } if offset == Offset::new(0, 2)));
        assert_eq!(sink.current_offset(), None);
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn test_overlapping_batch_applies_only_new_records() {
        let sink = MemorySink::starting_at(Offset::new(0, 2));
        sink.apply_batch(&batch(vec![
            WalRecord::put(Offset::new(0, 1), "old", b"x".to_vec()),
            WalRecord::put(Offset::new(0, 2), "old2", b"x".to_vec()),
            WalRecord::put(Offset::new(0, 3), "new", b"y".to_vec()),
        ]))
        .await
        .unwrap();

        let snapshot = sink.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("new"));
        assert_eq!(sink.current_offset(), Some(Offset::new(0, 3)));
    }
}
