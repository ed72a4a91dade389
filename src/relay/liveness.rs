//! Periodic liveness reporting.
//!
//! Independent of the relay task: reads the sink's durable offset on an
//! interval and logs it, so an operator can tell a healthy idle replica from
//! a stuck one.

use super::types::RelayStatus;
use crate::metrics;
use crate::offset::Offset;
use crate::resilience::wait_for_shutdown;
use crate::sink::ApplySink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// One liveness observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessReport {
    /// The sink has never applied anything.
    NoData,
    At(Offset),
}

impl LivenessReport {
    pub fn from_offset(offset: Option<Offset>) -> Self {
        offset.map_or(LivenessReport::NoData, LivenessReport::At)
    }
}

impl std::fmt::Display for LivenessReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LivenessReport::NoData => write!(f, "waiting for first record"),
            LivenessReport::At(o) => write!(f, "segment={}, offset={}", o.segment_id, o.offset),
        }
    }
}

/// Log the sink's current offset every `interval` until shutdown.
///
/// The first report is emitted one full interval after start.
pub async fn run_liveness_reporter<S: ApplySink>(
    sink: Arc<S>,
    status: Arc<RelayStatus>,
    namespace: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let current = sink.current_offset();
        let report = LivenessReport::from_offset(current);
        info!(
            namespace = %namespace,
            state = %status.state(),
            segment_lag = status.segment_lag(),
            degraded = status.is_degraded(),
            "Replica liveness: {}",
            report
        );
        if let Some(offset) = current {
            metrics::record_current_offset(&namespace, offset.segment_id, offset.offset);
        }
    }
}
