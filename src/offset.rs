// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WAL positions.
//!
//! An [`Offset`] names a point in the upstream write-ahead log as a
//! `(segment_id, offset)` pair. Offsets are totally ordered, segment first:
//!
//! ```text
//! (0, 9) < (0, 10) < (1, 0) < (1, 1) < (2, 0)
//! ```
//!
//! The text form is `"{segment_id}-{offset}"`, which is also the Redis stream
//! entry ID used by [`RedisSource`](crate::source::RedisSource). Redis orders
//! entry IDs with the same rule, so stream order and WAL order agree.
//!
//! [`OffsetCell`] is the publication point a sink uses to expose its durable
//! offset to concurrent readers (the liveness reporter, health checks).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::watch;

/// A position in the WAL.
///
/// Field order matters: the derived `Ord` compares `segment_id` first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub segment_id: u64,
    pub offset: u64,
}

impl Offset {
    /// Position before any record. Subscribing from here replays everything.
    pub const ORIGIN: Offset = Offset { segment_id: 0, offset: 0 };

    pub const fn new(segment_id: u64, offset: u64) -> Self {
        Self { segment_id, offset }
    }

    /// Number of whole segments between `self` and `tail`.
    ///
    /// Zero when `self` is in the tail segment or ahead of it.
    pub fn segment_lag(&self, tail: &Offset) -> u64 {
        tail.segment_id.saturating_sub(self.segment_id)
    }

    /// Records between `self` and `tail` when both sit in the same segment.
    ///
    /// Offsets are not contiguous across segments, so there is no answer
    /// once the segments differ.
    pub fn record_lag(&self, tail: &Offset) -> Option<u64> {
        (self.segment_id == tail.segment_id).then(|| tail.offset.saturating_sub(self.offset))
    }
}

/// Compare two offsets, segment first then intra-segment offset.
pub fn compare(a: &Offset, b: &Offset) -> Ordering {
    a.cmp(b)
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.segment_id, self.offset)
    }
}

/// Failure to parse an [`Offset`] from text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid offset '{input}': expected '<segment>-<offset>'")]
pub struct OffsetParseError {
    pub input: String,
}

impl FromStr for Offset {
    type Err = OffsetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || OffsetParseError { input: s.to_string() };
        let (segment, offset) = s.split_once('-').ok_or_else(err)?;
        Ok(Offset {
            segment_id: segment.parse().map_err(|_| err())?,
            offset: offset.parse().map_err(|_| err())?,
        })
    }
}

/// Atomically published "latest durable offset".
///
/// Writers call [`publish`](Self::publish) after a commit; readers call
/// [`load`](Self::load) or hold a [`subscribe`](Self::subscribe) receiver.
/// Published values only move forward.
#[derive(Debug)]
pub struct OffsetCell {
    tx: watch::Sender<Option<Offset>>,
}

impl OffsetCell {
    pub fn new(initial: Option<Offset>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn load(&self) -> Option<Offset> {
        *self.tx.borrow()
    }

    /// Advance to `offset`. Returns `false` (and changes nothing) if the cell
    /// already holds an equal or later position.
    pub fn publish(&self, offset: Offset) -> bool {
        self.tx.send_if_modified(|current| match current {
            Some(existing) if *existing >= offset => false,
            _ => {
                *current = Some(offset);
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Offset>> {
        self.tx.subscribe()
    }
}

impl Default for OffsetCell {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_segment_first() {
        assert!(Offset::new(0, 999) < Offset::new(1, 0));
        assert!(Offset::new(1, 0) < Offset::new(1, 1));
        assert_eq!(compare(&Offset::new(2, 5), &Offset::new(2, 5)), Ordering::Equal);
        assert_eq!(compare(&Offset::new(3, 0), &Offset::new(2, 100)), Ordering::Greater);
    }

    #[test]
    fn test_origin_is_minimum() {
        assert_eq!(Offset::ORIGIN, Offset::default());
        assert!(Offset::ORIGIN <= Offset::new(0, 0));
        assert!(Offset::ORIGIN < Offset::new(0, 1));
    }

    #[test]
    fn test_display_and_parse() {
        let off = Offset::new(12, 3456);
        assert_eq!(off.to_string(), "12-3456");
        assert_eq!("12-3456".parse::<Offset>().unwrap(), off);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Offset>().is_err());
        assert!("12".parse::<Offset>().is_err());
        assert!("a-1".parse::<Offset>().is_err());
        assert!("1-b".parse::<Offset>().is_err());
        assert!("1-2-3".parse::<Offset>().is_err());
        assert!("-1-2".parse::<Offset>().is_err());

        let err = "nope".parse::<Offset>().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_segment_lag() {
        let applied = Offset::new(3, 50);
        assert_eq!(applied.segment_lag(&Offset::new(3, 900)), 0);
        assert_eq!(applied.segment_lag(&Offset::new(14, 0)), 11);
        // Ahead of the reported tail (stale tail) is not negative lag
        assert_eq!(applied.segment_lag(&Offset::new(1, 0)), 0);
    }

    #[test]
    fn test_record_lag() {
        let applied = Offset::new(3, 50);
        assert_eq!(applied.record_lag(&Offset::new(3, 80)), Some(30));
        assert_eq!(applied.record_lag(&Offset::new(3, 10)), Some(0));
        assert_eq!(applied.record_lag(&Offset::new(4, 0)), None);
    }

    #[test]
    fn test_serde_roundtrip() {
        let off = Offset::new(7, 8);
        let json = serde_json::to_string(&off).unwrap();
        assert_eq!(json, r#"{"segment_id":7,"offset":8}"#);
        let back: Offset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, off);
    }

    #[test]
    fn test_offset_cell_only_advances() {
        let cell = OffsetCell::default();
        assert_eq!(cell.load(), None);

        assert!(cell.publish(Offset::new(0, 5)));
        assert!(!cell.publish(Offset::new(0, 5)));
        assert!(!cell.publish(Offset::new(0, 3)));
        assert_eq!(cell.load(), Some(Offset::new(0, 5)));

        assert!(cell.publish(Offset::new(1, 0)));
        assert_eq!(cell.load(), Some(Offset::new(1, 0)));
    }

    #[tokio::test]
    async fn test_offset_cell_subscribers_see_updates() {
        let cell = OffsetCell::new(Some(Offset::new(0, 1)));
        let mut rx = cell.subscribe();
        assert_eq!(*rx.borrow(), Some(Offset::new(0, 1)));

        cell.publish(Offset::new(0, 2));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Some(Offset::new(0, 2)));
    }
}
