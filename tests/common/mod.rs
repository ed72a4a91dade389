//! Shared test utilities for relay, integration and property tests.
//!
//! This module provides:
//! - Redis testcontainer setup and WAL entry helpers
//! - A scripted in-process upstream
//! - A failure-injecting apply sink
//! - Batch construction helpers

#![allow(dead_code)]

pub mod containers;
pub mod fake_upstream;
pub mod mock_sink;

pub use containers::*;
pub use fake_upstream::*;
pub use mock_sink::*;

use wal_relay::{Offset, WalBatch, WalRecord};

/// PUT batch covering `first..=last` in `segment`. Key `k{n}`, value `v{n}`.
pub fn put_batch(segment: u64, first: u64, last: u64) -> WalBatch {
    let records = (first..=last)
        .map(|n| WalRecord::put(Offset::new(segment, n), format!("k{}", n), format!("v{}", n).into_bytes()))
        .collect();
    WalBatch::new(records).expect("test batch must be valid")
}

/// Initialize tracing once for tests that want log output (RUST_LOG).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
