// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WAL records and batches.
//!
//! A [`WalBatch`] is the unit of transfer and of apply-then-checkpoint
//! atomicity. It is never empty and its record offsets strictly increase, so
//! the batch position (the last record's offset) is always defined.
//!
//! ```text
//! WalBatch [(0,6) PUT a] [(0,7) DEL b] [(0,8) PUT c]
//!          first_offset = (0,6)        position = (0,8)
//! ```

use crate::error::{RelayError, Result};
use crate::offset::Offset;
use std::fmt;

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Put,
    Delete,
}

impl WalOp {
    /// Parse the wire form (`PUT` / `DEL`, case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PUT" => Some(Self::Put),
            "DEL" | "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Delete => "DEL",
        }
    }
}

impl fmt::Display for WalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single replicated mutation, terminating at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub offset: Offset,
    pub op: WalOp,
    pub key: String,
    /// Present for `Put`, absent for `Delete`.
    pub value: Option<Vec<u8>>,
}

impl WalRecord {
    pub fn put(offset: Offset, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            op: WalOp::Put,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(offset: Offset, key: impl Into<String>) -> Self {
        Self {
            offset,
            op: WalOp::Delete,
            key: key.into(),
            value: None,
        }
    }

    /// Payload size in bytes (0 for deletes).
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }
}

/// Ordered, non-empty run of records with strictly increasing offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalBatch {
    records: Vec<WalRecord>,
}

#[allow(clippy::len_without_is_empty)]
impl WalBatch {
    /// Build a batch, rejecting empty input and non-increasing offsets.
    pub fn new(records: Vec<WalRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(RelayError::InvalidBatch("batch has no records".to_string()));
        }
        for pair in records.windows(2) {
            if pair[1].offset <= pair[0].offset {
                return Err(RelayError::InvalidBatch(format!(
                    "offsets not strictly increasing: {} followed by {}",
                    pair[0].offset, pair[1].offset
                )));
            }
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[WalRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<WalRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn first_offset(&self) -> Offset {
        self.records[0].offset
    }

    /// The batch position: offset of the last record.
    pub fn position(&self) -> Offset {
        self.records[self.records.len() - 1].offset
    }

    /// Total payload bytes carried by the batch.
    pub fn payload_bytes(&self) -> usize {
        self.records.iter().map(WalRecord::value_len).sum()
    }

    /// The suffix of this batch strictly after `applied`.
    ///
    /// Returns `None` when every record is at or below `applied`.
    pub fn after(&self, applied: Offset) -> Option<WalBatch> {
        let start = self.records.partition_point(|r| r.offset <= applied);
        if start == self.records.len() {
            return None;
        }
        Some(WalBatch {
            records: self.records[start..].to_vec(),
        })
    }
}
