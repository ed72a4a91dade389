// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The relay: upstream stream → local apply sink.
//!
//! A [`Relay`] owns the subscription lifecycle for one namespace:
//!
//! 1. Ask the sink for its durable offset (or use the configured initial one)
//! 2. Subscribe to the upstream from that offset
//! 3. For each batch, in arrival order:
//!    - drop it if it ends at or below the last applied offset
//!    - trim an already-applied prefix if it overlaps
//!    - apply it through the sink, retrying a bounded number of times
//!    - recompute lag against the upstream tail and flip the degraded flag
//! 4. When the stream ends or fails, subscribe again from the latest applied
//!    offset
//!
//! # Graceful Shutdown
//!
//! Every suspension point (subscribe, next batch, apply, backoff sleep) is
//! raced against the shutdown signal with `tokio::select!`. On shutdown the
//! relay stops consuming, drops the stream and returns `Ok(RunSummary)`.
//! An apply interrupted by shutdown is abandoned whole; the sink's atomic
//! batch contract means nothing partial is left behind.
//!
//! # Errors
//!
//! `run()` returns `Err` only for faults the relay cannot recover from:
//! apply retries exhausted, upstream trimmed past the resume point, or the
//! upstream never reachable during startup. Everything else reconnects.

mod liveness;
mod types;

pub use liveness::{run_liveness_reporter, LivenessReport};
pub use types::{RelayHealth, RelayState, RelayStatus, RunSummary};

use crate::batch::WalBatch;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::offset::Offset;
use crate::resilience::{sleep_or_shutdown, wait_for_shutdown, RetryConfig};
use crate::sink::ApplySink;
use crate::source::{BatchStream, UpstreamSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

/// How a streaming session ended.
enum SessionEnd {
    Cancelled,
    Ended,
    Failed(RelayError),
}

/// Pause between streaming sessions.
///
/// Grows over consecutive sessions that applied nothing and starts over
/// once a session makes progress.
#[derive(Debug, Default)]
struct SessionBackoff {
    streak: usize,
}

impl SessionBackoff {
    fn next_delay(&mut self, policy: &RetryConfig, progressed: bool) -> Duration {
        if progressed {
            self.streak = 0;
        }
        self.streak += 1;
        policy.delay_for_attempt(self.streak)
    }
}

/// Replicates one namespace from an upstream source into a local sink.
pub struct Relay<S: ApplySink, U: UpstreamSource> {
    config: RelayConfig,
    sink: Arc<S>,
    source: Arc<U>,
    status: Arc<RelayStatus>,
    started: AtomicBool,
}

impl<S: ApplySink, U: UpstreamSource> Relay<S, U> {
    pub fn new(config: RelayConfig, sink: Arc<S>, source: Arc<U>) -> Self {
        Self {
            config,
            sink,
            source,
            status: Arc::new(RelayStatus::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Shared status block, readable while `run()` is in progress.
    pub fn status(&self) -> Arc<RelayStatus> {
        Arc::clone(&self.status)
    }

    pub fn state(&self) -> RelayState {
        self.status.state()
    }

    /// Receiver for state changes.
    pub fn state_receiver(&self) -> watch::Receiver<RelayState> {
        self.status.subscribe_state()
    }

    pub fn health(&self) -> RelayHealth {
        self.status.snapshot()
    }

    /// Run until cancelled or a fatal error.
    ///
    /// Send `true` on the shutdown channel to cancel. Returns `Ok` after a
    /// cancellation-driven drain, `Err` on a fatal fault. Can only be called
    /// once per relay.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RelayError::InvalidState {
                expected: RelayState::Disconnected.to_string(),
                actual: self.state().to_string(),
            });
        }

        let span = tracing::info_span!("relay", namespace = %self.config.namespace);

        async move {
            let result = self.run_sessions(&mut shutdown).await;
            let closed = self.enter(RelayState::Closed);

            match result.and(closed) {
                Ok(()) => {
                    let summary = RunSummary::from(self.status.snapshot());
                    info!(
                        last_applied = %display_offset(summary.last_applied),
                        batches = summary.batches_applied,
                        records = summary.records_applied,
                        "Relay closed"
                    );
                    Ok(summary)
                }
                Err(e) => {
                    error!(error = %e, "Relay stopped on fatal error");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Connect/stream/reconnect loop. `Ok` means cancelled and drained.
    async fn run_sessions(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let namespace = self.config.namespace.as_str();
        let startup = self.config.settings.startup_retry();
        let reconnect = self.config.settings.reconnect_retry();

        let mut last_applied = self.sink.current_offset().or(self.config.settings.initial_offset);
        if let Some(offset) = last_applied {
            self.status.set_last_applied(offset);
        }
        info!(
            upstream = %self.source.describe(),
            resume = %display_offset(last_applied),
            "Starting relay"
        );

        let mut established = false;
        let mut attempt = 0usize;
        let mut backoff = SessionBackoff::default();

        loop {
            if *shutdown.borrow() {
                return self.drain();
            }
            self.enter(RelayState::Connecting)?;

            let policy: &RetryConfig = if established { &reconnect } else { &startup };
            let start = last_applied.unwrap_or(Offset::ORIGIN);
            attempt += 1;

            let subscribed = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return self.drain(),
                r = timeout(policy.attempt_timeout, self.source.subscribe(start, namespace)) => r,
            };

            let failure = match subscribed {
                Ok(Ok(stream)) => {
                    metrics::record_subscribe(namespace, true);
                    if attempt > 1 {
                        info!(start = %start, attempt, "Subscribed after retry");
                    }
                    established = true;
                    attempt = 0;

                    let mut stream = stream;
                    self.enter(RelayState::Streaming)?;
                    self.update_lag(start, stream.upstream_tail());

                    let resumed_from = last_applied;
                    let outcome = self.stream_session(&mut stream, &mut last_applied, shutdown).await;
                    drop(stream);

                    match outcome {
                        SessionEnd::Cancelled => return self.drain(),
                        SessionEnd::Failed(e) if !e.is_retryable() => return Err(e),
                        SessionEnd::Failed(e) => {
                            warn!(error = %e, resume = %display_offset(last_applied), "Stream failed, reconnecting");
                            metrics::record_reconnect(namespace, "stream_error");
                        }
                        SessionEnd::Ended => {
                            info!(resume = %display_offset(last_applied), "Upstream closed stream, reconnecting");
                            metrics::record_reconnect(namespace, "stream_end");
                        }
                    }
                    self.status.record_reconnect();

                    let delay = backoff.next_delay(&reconnect, last_applied != resumed_from);
                    debug!(delay_ms = delay.as_millis() as u64, "Waiting before resubscribing");
                    if sleep_or_shutdown(delay, shutdown).await {
                        return self.drain();
                    }
                    continue;
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    metrics::record_subscribe(namespace, false);
                    return Err(e);
                }
                Ok(Err(e)) => e,
                Err(_) => RelayError::connection(
                    self.source.describe(),
                    format!("subscribe timed out after {}ms", policy.attempt_timeout.as_millis()),
                ),
            };

            metrics::record_subscribe(namespace, false);
            if policy.is_exhausted(attempt) {
                error!(attempt, error = %failure, "Failed to subscribe after max retries");
                return Err(RelayError::connection(
                    self.source.describe(),
                    format!("subscribe failed after {} attempts: {}", attempt, failure),
                ));
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Subscribe failed, retrying"
            );
            if sleep_or_shutdown(delay, shutdown).await {
                return self.drain();
            }
        }
    }

    /// Consume one subscription until it ends, fails or we are cancelled.
    async fn stream_session(
        &self,
        stream: &mut U::Stream,
        last_applied: &mut Option<Offset>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return SessionEnd::Cancelled,
                r = stream.next_batch() => r,
            };

            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) => return SessionEnd::Ended,
                Err(e) => return SessionEnd::Failed(e),
            };

            let Some(batch) = self.admit(batch, *last_applied) else {
                continue;
            };

            match self.apply_with_retry(&batch, shutdown).await {
                Ok(true) => {}
                Ok(false) => return SessionEnd::Cancelled,
                Err(e) => return SessionEnd::Failed(e),
            }

            let position = batch.position();
            *last_applied = Some(position);
            self.status.set_last_applied(position);
            self.status.record_applied(batch.len());
            debug!(position = %position, records = batch.len(), "Applied batch");

            self.update_lag(position, stream.upstream_tail());
        }
    }

    /// Enforce monotonicity against the last applied offset.
    ///
    /// Returns the part of `batch` that still needs applying, or `None` if
    /// it is entirely a duplicate.
    fn admit(&self, batch: WalBatch, last_applied: Option<Offset>) -> Option<WalBatch> {
        let Some(applied) = last_applied else {
            return Some(batch);
        };

        if batch.position() <= applied {
            let violation = RelayError::OrderingViolation {
                last_applied: applied,
                received: batch.position(),
            };
            warn!(error = %violation, records = batch.len(), "Dropping duplicate batch");
            self.status.record_duplicate();
            metrics::record_duplicate_dropped(&self.config.namespace, batch.len());
            return None;
        }

        if batch.first_offset() <= applied {
            let remainder = batch.after(applied)?;
            let trimmed = batch.len() - remainder.len();
            debug!(
                last_applied = %applied,
                first = %batch.first_offset(),
                trimmed,
                "Trimmed already-applied prefix of overlapping batch"
            );
            metrics::record_overlap_trimmed(&self.config.namespace, trimmed);
            return Some(remainder);
        }

        Some(batch)
    }

    /// Apply with bounded retry. `Ok(false)` means cancelled before success.
    async fn apply_with_retry(&self, batch: &WalBatch, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let policy = self.config.settings.apply_retry();
        let namespace = self.config.namespace.as_str();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return Ok(false),
                r = self.sink.apply_batch(batch) => r,
            };

            match result {
                Ok(()) => {
                    metrics::record_batch_applied(namespace, batch.len(), started.elapsed());
                    return Ok(true);
                }
                Err(e) if policy.is_exhausted(attempt) => {
                    error!(position = %batch.position(), attempt, error = %e, "Apply failed after max retries");
                    return Err(RelayError::Apply {
                        position: batch.position(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        position = %batch.position(),
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Apply failed, retrying"
                    );
                    metrics::record_apply_retry(namespace);
                    if sleep_or_shutdown(delay, shutdown).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Recompute lag against the upstream tail and update the degraded flag.
    fn update_lag(&self, applied: Offset, tail: Option<Offset>) {
        let namespace = self.config.namespace.as_str();
        let threshold = self.config.settings.segment_lag_threshold;
        let tail = tail.map_or(applied, |t| t.max(applied));
        self.status.set_upstream_tail(Some(tail));

        let lag = applied.segment_lag(&tail);
        let degraded = lag > threshold;
        let was_degraded = self.status.set_lag(lag, degraded);

        metrics::record_lag(namespace, lag, applied.record_lag(&tail));
        metrics::record_degraded(namespace, degraded);

        match (was_degraded, degraded) {
            (false, true) => warn!(
                segment_lag = lag,
                threshold,
                applied = %applied,
                tail = %tail,
                "Replica lagging upstream, marking degraded"
            ),
            (true, false) => info!(
                segment_lag = lag,
                threshold,
                applied = %applied,
                "Replica caught up, clearing degraded flag"
            ),
            _ => {}
        }
    }

    fn enter(&self, next: RelayState) -> Result<()> {
        let previous = self.status.transition(next)?;
        if previous != next {
            debug!(from = %previous, to = %next, "Relay state change");
            metrics::record_relay_state(&self.config.namespace, next.as_code());
        }
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        info!(last_applied = %display_offset(self.status.last_applied()), "Shutdown signal received, draining");
        self.enter(RelayState::Draining)
    }
}

fn display_offset(offset: Option<Offset>) -> String {
    offset.map_or_else(|| "none".to_string(), |o| o.to_string())
}
