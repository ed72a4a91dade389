//! # WAL Relay
//!
//! A replication relay that keeps a local replica in step with an upstream
//! write-ahead log.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               wal-relay                                   │
//! │                                                                           │
//! │  ┌────────────────┐    ┌──────────────────────┐    ┌───────────────────┐  │
//! │  │ UpstreamSource │───►│ Relay                │───►│ ApplySink         │  │
//! │  │ (Redis XREAD)  │    │ order + dedup + lag  │    │ (SQLite / memory) │  │
//! │  └────────────────┘    └──────────────────────┘    └───────────────────┘  │
//! │          ▲                        │                          │            │
//! │          │   resume from offset   │                          │            │
//! │          └────────────────────────┴──────────────────────────┘            │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **In order**: batches are applied in strictly increasing offset order
//! 2. **Atomic**: a batch is applied entirely or not at all
//! 3. **Resumable**: after any disconnect the relay subscribes again from the
//!    sink's last durable offset
//!
//! Delivery is at-least-once; duplicates from a resumed stream are dropped
//! or trimmed before they reach the sink.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use wal_relay::{LoggingSink, MemorySink, RedisSource, Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> wal_relay::Result<()> {
//!     let config = RelayConfig::default();
//!     let sink = Arc::new(LoggingSink::new(MemorySink::new(), &config.namespace));
//!     let source = Arc::new(RedisSource::new(&config.upstream)?);
//!
//!     let relay = Relay::new(config, sink, source);
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//!     // Runs until shutdown is signalled or a fatal error occurs
//!     let summary = relay.run(shutdown_rx).await?;
//!     println!("stopped at {:?}", summary.last_applied);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod metrics;
pub mod offset;
pub mod relay;
pub mod resilience;
pub mod sink;
pub mod source;

// Re-exports for convenience
pub use batch::{WalBatch, WalOp, WalRecord};
pub use config::{RelayConfig, RelaySettings, ReplicaConfig, UpstreamConfig};
pub use error::{RelayError, Result};
pub use offset::Offset;
pub use relay::{run_liveness_reporter, LivenessReport, Relay, RelayHealth, RelayState, RelayStatus, RunSummary};
pub use resilience::RetryConfig;
pub use sink::{ApplyError, ApplySink, LoggingSink, MemorySink, SqliteSink};
pub use source::{BatchStream, RedisSource, UpstreamSource};
