//! Fuzz target for lag calculation.
//!
//! `segment_lag` and `record_lag` must never panic or overflow on arbitrary
//! offsets.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wal_relay::Offset;

fuzz_target!(|data: (u64, u64, u64, u64)| {
    let applied = Offset::new(data.0, data.1);
    let tail = Offset::new(data.2, data.3);

    let lag = applied.segment_lag(&tail);
    assert!(lag <= tail.segment_id);
    if tail <= applied {
        assert_eq!(lag, 0);
    }
    let _ = applied.record_lag(&tail);
});
