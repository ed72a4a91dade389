//! Fuzz target for offset parsing and ordering.
//!
//! Parsing arbitrary stream entry IDs must never panic, and any two offsets
//! that do parse must order consistently.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;
use wal_relay::offset::compare;
use wal_relay::Offset;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    // Should never panic
    let (Ok(a), Ok(b)) = (a.parse::<Offset>(), b.parse::<Offset>()) else {
        return;
    };

    assert_eq!(compare(&a, &b).reverse(), compare(&b, &a));
    assert_eq!(compare(&a, &a), Ordering::Equal);

    // Text form parses back
    assert_eq!(a.to_string().parse::<Offset>().ok(), Some(a));
});
