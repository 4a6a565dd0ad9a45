//! Virement - handle-based token payment service.
//!
//! Runs the event synchronizer (live subscription + backfill) and the
//! request expiry sweep against a PostgreSQL ledger mirror. The
//! submission coordinator is wired here too and driven by the HTTP
//! layer, which lives in front of this process.
//!
//! # Usage
//!
//! ```bash
//! # Start with default config
//! virement
//!
//! # Start with environment overrides
//! DATABASE_URL=postgres://localhost/virement RPC_WS_URL=ws://localhost:8545 \
//!   TOKEN_ADDRESS=0x... virement
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use virement_core::error::SyncError;
use virement_core::metrics::init_metrics;
use virement_core::ports::{ChainGateway, LogNotifier};
use virement_core::services::{
    CoordinatorConfig, EventSynchronizer, SubmissionCoordinator, SynchronizerConfig,
};
use virement_evm::{EvmGateway, EvmGatewayConfig};
use virement_storage::{Database, DatabaseConfig, PgIdentityDirectory, PgLedger};

/// Virement CLI - payment ledger reconciliation service.
#[derive(Parser, Debug)]
#[command(name = "virement")]
#[command(about = "Virement - handle-based token payments over an EVM chain")]
#[command(version)]
struct Cli {
    /// EVM node WebSocket URL.
    #[arg(long, env = "RPC_WS_URL", default_value = "ws://127.0.0.1:8545")]
    rpc_ws_url: String,

    /// Deployed token contract address.
    #[arg(long, env = "TOKEN_ADDRESS")]
    token_address: String,

    /// EIP-155 chain id used when signing.
    #[arg(long, env = "CHAIN_ID", default_value = "11155111")]
    chain_id: u64,

    /// PostgreSQL database URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/virement"
    )]
    database_url: String,

    /// Network identifier keying the sync cursor. Defaults to
    /// "evm-<chain_id>".
    #[arg(long, env = "NETWORK_ID")]
    network_id: Option<String>,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Seconds between backfill sweeps.
    #[arg(long, env = "BACKFILL_INTERVAL_SECS", default_value = "60")]
    backfill_interval_secs: u64,

    /// Maximum block span per backfill range query.
    #[arg(long, env = "MAX_BACKFILL_SPAN", default_value = "1000")]
    max_backfill_span: u64,

    /// Seconds between request expiry sweeps.
    #[arg(long, env = "EXPIRY_SWEEP_SECS", default_value = "300")]
    expiry_sweep_secs: u64,

    /// Seconds to wait for a transfer receipt before reporting a
    /// (recoverable) timeout.
    #[arg(long, env = "RECEIPT_TIMEOUT_SECS", default_value = "120")]
    receipt_timeout_secs: u64,

    /// Confirmation depth treated as final.
    #[arg(long, env = "FINALITY_THRESHOLD", default_value = "12")]
    finality_threshold: u64,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Run database migrations and exit.
    #[arg(long)]
    migrate_only: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Prometheus metrics exporter (optional - failures don't crash the app)
    let metrics_enabled =
        match format!("0.0.0.0:{}", cli.metrics_port).parse::<std::net::SocketAddr>() {
            Ok(metrics_addr) => match PrometheusBuilder::new()
                .with_http_listener(metrics_addr)
                .install()
            {
                Ok(()) => {
                    init_metrics();
                    true
                }
                Err(e) => {
                    warn!(
                        "⚠️  Failed to start metrics exporter: {}. Continuing without metrics.",
                        e
                    );
                    false
                }
            },
            Err(e) => {
                warn!(
                    "⚠️  Invalid metrics address: {}. Continuing without metrics.",
                    e
                );
                false
            }
        };

    // ─────────────────────────────────────────────────────────────────────────
    // 🚀 STARTUP
    // ─────────────────────────────────────────────────────────────────────────
    info!("🚀 Starting Virement");
    debug!(rpc_ws_url = %cli.rpc_ws_url, "Chain endpoint");
    debug!(database_url = %mask_password(&cli.database_url), "Database endpoint");

    // ─────────────────────────────────────────────────────────────────────────
    // 🗄️ DATABASE
    // ─────────────────────────────────────────────────────────────────────────
    info!("🗄️  Connecting to database...");
    let db = Database::connect(&DatabaseConfig::new(&cli.database_url))
        .await
        .context("Failed to connect to database")?;

    db.migrate().await.context("Failed to run migrations")?;
    info!("🗄️  Database ready (migrations applied)");

    if cli.migrate_only {
        info!("🛑 --migrate-only flag set, exiting");
        return Ok(());
    }

    let db = Arc::new(db);
    let ledger = Arc::new(PgLedger::new(db.clone()));
    let identity = Arc::new(PgIdentityDirectory::new(&db));
    let notifier = Arc::new(LogNotifier);

    // ─────────────────────────────────────────────────────────────────────────
    // ⛓️ CHAIN CONNECTION
    // ─────────────────────────────────────────────────────────────────────────
    info!("⛓️  Connecting to EVM node...");
    let gateway = EvmGateway::connect(EvmGatewayConfig {
        ws_url: cli.rpc_ws_url.clone(),
        token_address: cli.token_address.clone(),
        chain_id: cli.chain_id,
    })
    .await
    .context("Failed to connect to EVM node")?;
    let gateway = Arc::new(gateway);

    let height = gateway.current_block_height().await?;
    let network_id = cli
        .network_id
        .clone()
        .unwrap_or_else(|| format!("evm-{}", cli.chain_id));
    info!(
        chain_id = cli.chain_id,
        network = %network_id,
        height,
        "🔗 Chain connected"
    );

    // ─────────────────────────────────────────────────────────────────────────
    // ⚡ SERVICES START
    // ─────────────────────────────────────────────────────────────────────────
    let coordinator = Arc::new(SubmissionCoordinator::new(
        CoordinatorConfig {
            receipt_timeout: Duration::from_secs(cli.receipt_timeout_secs),
            finality_threshold: cli.finality_threshold,
            ..Default::default()
        },
        gateway.clone(),
        ledger.clone(),
        identity.clone(),
        notifier.clone(),
    ));

    let synchronizer = EventSynchronizer::new(
        SynchronizerConfig {
            network_id,
            backfill_interval: Duration::from_secs(cli.backfill_interval_secs),
            max_backfill_span: cli.max_backfill_span,
            ..Default::default()
        },
        gateway.clone(),
        ledger.clone(),
        identity.clone(),
        notifier.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_handle = tokio::spawn(
        async move {
            if let Err(e) = synchronizer.run(shutdown_rx).await {
                match e {
                    SyncError::ShutdownRequested => {}
                    _ => error!(error = ?e, "❌ Synchronizer error"),
                }
            }
        }
        .instrument(info_span!("synchronizer")),
    );

    let expiry_coordinator = coordinator.clone();
    let mut expiry_shutdown_rx = shutdown_tx.subscribe();
    let expiry_interval = Duration::from_secs(cli.expiry_sweep_secs);
    let expiry_handle = tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(expiry_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = expiry_coordinator.expire_due_requests().await {
                            warn!(error = ?e, "⚠️  Expiry sweep failed");
                        }
                    }
                    changed = expiry_shutdown_rx.changed() => {
                        if changed.is_err() || *expiry_shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
        .instrument(info_span!("expiry")),
    );

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ READY
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ Virement ready");
    if metrics_enabled {
        info!(
            "   📊 Metrics:  http://localhost:{}/metrics",
            cli.metrics_port
        );
    } else {
        info!("   📊 Metrics:  disabled");
    }
    info!("   Press Ctrl+C to stop");

    shutdown_signal().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(30), sync_handle).await {
        Ok(_) => debug!("Synchronizer stopped"),
        Err(_) => warn!("⚠️  Synchronizer shutdown timed out"),
    }

    match tokio::time::timeout(Duration::from_secs(10), expiry_handle).await {
        Ok(_) => debug!("Expiry sweep stopped"),
        Err(_) => warn!("⚠️  Expiry sweep shutdown timed out"),
    }

    db.close().await;

    info!("🛑 Shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Mask password in database URL for logging.
fn mask_password(url_str: &str) -> String {
    match url::Url::parse(url_str) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => url_str.to_string(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
