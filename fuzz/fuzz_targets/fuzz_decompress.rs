//! Fuzz target for WAL payload decoding.
//!
//! `maybe_decompress` and the content hash must never panic on arbitrary
//! entry data.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wal_relay::source::{compute_content_hash, maybe_decompress};

fuzz_target!(|data: &[u8]| {
    if let Ok(plain) = maybe_decompress(data) {
        assert_eq!(compute_content_hash(&plain).len(), 64);
    }
});
