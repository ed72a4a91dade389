//! wal-relay: streams an upstream WAL into a local SQLite replica.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wal_relay::{run_liveness_reporter, LoggingSink, RedisSource, Relay, RelayConfig, RunSummary, SqliteSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Replicate an upstream write-ahead log into a local replica.
#[derive(Debug, Parser)]
#[command(name = "wal-relay", version, about)]
struct Args {
    /// Upstream Redis URL.
    #[arg(long)]
    upstream: Option<String>,

    /// Namespace to replicate.
    #[arg(long)]
    namespace: Option<String>,

    /// Directory for the replica database.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Segments behind upstream before the replica is flagged degraded.
    #[arg(long)]
    segment_lag_threshold: Option<u64>,

    /// JSON configuration file. CLI flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format, &args.log_level);

    match run(args).await {
        Ok(summary) => {
            info!(
                batches = summary.batches_applied,
                records = summary.records_applied,
                "wal-relay stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "wal-relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<RunSummary> {
    let config = load_config(&args)?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics endpoint listening on http://{}/metrics", addr);
    }

    std::fs::create_dir_all(&config.replica.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.replica.data_dir.display()))?;

    let replica = SqliteSink::open(&config.replica.data_dir, &config.namespace)
        .await
        .context("Failed to open replica")?;
    let sink = Arc::new(LoggingSink::new(replica, config.namespace.as_str()));
    let source = Arc::new(RedisSource::new(&config.upstream).context("Invalid upstream configuration")?);

    info!(
        namespace = %config.namespace,
        upstream = %config.upstream.redis_url,
        replica = %sink.inner().path().display(),
        segment_lag_threshold = config.settings.segment_lag_threshold,
        "Starting wal-relay"
    );

    let namespace = config.namespace.clone();
    let liveness_interval = config.settings.liveness_interval_duration();
    let drain_timeout = config.settings.drain_timeout_duration();
    let relay = Arc::new(Relay::new(config, Arc::clone(&sink), source));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let liveness = tokio::spawn(run_liveness_reporter(
        Arc::clone(&sink),
        relay.status(),
        namespace,
        liveness_interval,
        shutdown_rx.clone(),
    ));

    let mut relay_task = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move { relay.run(shutdown_rx).await }
    });

    let outcome = tokio::select! {
        joined = &mut relay_task => joined,
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(drain_timeout, &mut relay_task).await {
                Ok(joined) => joined,
                Err(_) => {
                    relay_task.abort();
                    liveness.abort();
                    sink.inner().close().await;
                    anyhow::bail!("Relay did not drain within {}ms", drain_timeout.as_millis());
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = liveness.await {
        warn!(error = %e, "Liveness reporter task failed");
    }
    sink.inner().close().await;

    let summary = outcome.context("Relay task panicked")??;
    Ok(summary)
}

fn load_config(args: &Args) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };

    if let Some(upstream) = &args.upstream {
        config.upstream.redis_url = upstream.clone();
    }
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.replica.data_dir = data_dir.clone();
    }
    if let Some(threshold) = args.segment_lag_threshold {
        config.settings.segment_lag_threshold = threshold;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(format: LogFormat, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let fmt_layer = tracing_subscriber::fmt::layer();

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
