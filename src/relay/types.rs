//! Relay state types.
//!
//! Defines the state machine for the relay lifecycle and the shared status
//! block that the relay updates and observers read.
//!
//! # State Transitions
//!
//! ```text
//!                 run()
//! Disconnected ──────────→ Connecting ←─────────────────┐
//!      │                    │      │                    │
//!      │                    │      │ subscribed         │ stream ended /
//!      │                    │      ↓                    │ stream error
//!      │                    │   Streaming ──────────────┘
//!      │                    │      │
//!      │      cancelled     │      │ cancelled
//!      └──────────────→ Draining ←─┘
//!                           │
//!                           ↓
//!                        Closed ←── (fatal error from Connecting/Streaming)
//! ```
//!
//! # State Descriptions
//!
//! - **Disconnected**: Initial state. No subscription.
//! - **Connecting**: Subscribing from the last applied offset, with backoff between attempts.
//! - **Streaming**: Receiving and applying batches.
//! - **Draining**: Cancelled. Stream dropped, nothing more is applied.
//! - **Closed**: Terminal. `run()` has returned or is about to.

use crate::error::{RelayError, Result};
use crate::offset::{Offset, OffsetCell};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;

/// State of the relay.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Streaming,
    Draining,
    Closed,
}

impl RelayState {
    /// Whether the transition table allows `self → next`.
    ///
    /// Staying in `Connecting` (another attempt) is allowed.
    pub fn can_transition_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Draining)
                | (Connecting, Connecting)
                | (Connecting, Streaming)
                | (Connecting, Draining)
                | (Connecting, Closed)
                | (Streaming, Connecting)
                | (Streaming, Draining)
                | (Streaming, Closed)
                | (Draining, Closed)
        )
    }

    /// Numeric code for the state gauge.
    pub fn as_code(self) -> u8 {
        match self {
            RelayState::Disconnected => 0,
            RelayState::Connecting => 1,
            RelayState::Streaming => 2,
            RelayState::Draining => 3,
            RelayState::Closed => 4,
        }
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayState::Disconnected => write!(f, "Disconnected"),
            RelayState::Connecting => write!(f, "Connecting"),
            RelayState::Streaming => write!(f, "Streaming"),
            RelayState::Draining => write!(f, "Draining"),
            RelayState::Closed => write!(f, "Closed"),
        }
    }
}

/// Shared, lock-free view of what the relay is doing.
///
/// The relay task is the only writer.
#[derive(Debug)]
pub struct RelayStatus {
    state: watch::Sender<RelayState>,
    last_applied: OffsetCell,
    upstream_tail: watch::Sender<Option<Offset>>,
    segment_lag: AtomicU64,
    degraded: AtomicBool,
    batches_applied: AtomicU64,
    records_applied: AtomicU64,
    duplicates_dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl Default for RelayStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStatus {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RelayState::Disconnected);
        let (upstream_tail, _) = watch::channel(None);
        Self {
            state,
            last_applied: OffsetCell::default(),
            upstream_tail,
            segment_lag: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            batches_applied: AtomicU64::new(0),
            records_applied: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// Move to `next`, enforcing the transition table.
    pub(crate) fn transition(&self, next: RelayState) -> Result<RelayState> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(RelayError::InvalidState {
                expected: format!("a state that can move to {}", next),
                actual: current.to_string(),
            });
        }
        self.state.send_replace(next);
        Ok(current)
    }

    pub fn last_applied(&self) -> Option<Offset> {
        self.last_applied.load()
    }

    pub(crate) fn set_last_applied(&self, offset: Offset) {
        self.last_applied.publish(offset);
    }

    pub fn upstream_tail(&self) -> Option<Offset> {
        *self.upstream_tail.borrow()
    }

    pub(crate) fn set_upstream_tail(&self, tail: Option<Offset>) {
        self.upstream_tail.send_replace(tail);
    }

    pub fn segment_lag(&self) -> u64 {
        self.segment_lag.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Store lag and degraded flag; returns the previous degraded flag.
    pub(crate) fn set_lag(&self, segments: u64, degraded: bool) -> bool {
        self.segment_lag.store(segments, Ordering::Release);
        self.degraded.swap(degraded, Ordering::AcqRel)
    }

    pub(crate) fn record_applied(&self, records: usize) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.records_applied.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayHealth {
        RelayHealth {
            state: self.state(),
            last_applied: self.last_applied(),
            upstream_tail: self.upstream_tail(),
            segment_lag: self.segment_lag(),
            degraded: self.is_degraded(),
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            records_applied: self.records_applied.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayHealth {
    pub state: RelayState,
    pub last_applied: Option<Offset>,
    pub upstream_tail: Option<Offset>,
    pub segment_lag: u64,
    pub degraded: bool,
    pub batches_applied: u64,
    pub records_applied: u64,
    pub duplicates_dropped: u64,
    pub reconnects: u64,
}

/// What `run()` returns after a cancellation-driven shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub last_applied: Option<Offset>,
    pub batches_applied: u64,
    pub records_applied: u64,
    pub duplicates_dropped: u64,
    pub reconnects: u64,
}

impl From<RelayHealth> for RunSummary {
    fn from(h: RelayHealth) -> Self {
        Self {
            last_applied: h.last_applied,
            batches_applied: h.batches_applied,
            records_applied: h.records_applied,
            duplicates_dropped: h.duplicates_dropped,
            reconnects: h.reconnects,
        }
    }
}
