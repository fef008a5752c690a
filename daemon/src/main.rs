// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PRISM Mirror Daemon
//!
//! Entry point for the `prism-daemon` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the embedded store, starts the
//! sync machine, and serves the status and metrics HTTP endpoints.
//!
//! The sync machine has no clean exit: if it returns, something is wrong
//! and the process exits non-zero so the supervisor restarts it. That is
//! the designed recovery path for contract violations and reconciliation
//! failures — state is durable, the cursor is advance-only, and a restart
//! resumes exactly where the mirror left off.

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use prism_sync::notify::{NotificationKind, WalletNotification};
use prism_sync::store::{LedgerStore, SledStore, StoreTxn};
use prism_sync::stream::node_api::HttpNodeClient;
use prism_sync::stream::socket::WsSocketSpawner;
use prism_sync::stream::{SyncMachine, SyncSettings};
use prism_sync::wallet::NullDeriver;

use cli::{Commands, PrismDaemonCli};
use logging::LogFormat;
use metrics::MirrorMetrics;

/// Capacity of the wallet-notification fan-out channel.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// How often the cursor gauge is refreshed from the store.
const CURSOR_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PrismDaemonCli::parse();

    match cli.command {
        Commands::Run(args) => run_daemon(args).await,
        Commands::Version => {
            println!("prism-daemon {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_daemon(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "prism_daemon=info,prism_sync=info,tower_http=warn",
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        network = %args.network,
        ws_url = %args.ws_url,
        node_url = %args.node_url,
        data_dir = %args.data_dir.display(),
        "starting prism-daemon"
    );

    // --- Embedded store ---
    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("failed to create data directory: {}", args.data_dir.display())
    })?;
    let store = Arc::new(
        SledStore::open(args.data_dir.join("mirror"))
            .with_context(|| format!("failed to open store in {}", args.data_dir.display()))?,
    );
    tracing::info!(path = %args.data_dir.display(), "store opened");

    // --- Metrics & fan-out ---
    let mirror_metrics = Arc::new(MirrorMetrics::new());
    let (notifications, notifications_rx) =
        prism_sync::notify::channel(NOTIFICATION_CHANNEL_CAPACITY);
    tokio::spawn(consume_notifications(
        notifications_rx,
        Arc::clone(&mirror_metrics),
    ));
    tokio::spawn(poll_cursor(
        Arc::clone(&store),
        Arc::clone(&mirror_metrics),
    ));

    // --- Sync machine ---
    let mut settings = SyncSettings::new(&args.network);
    settings.expected_peer_id = args.peer_id.clone();
    settings.expected_stream_id = args.stream_id.clone();
    if let Some(ms) = args.ack_timeout_ms {
        settings.ack_timeout = std::time::Duration::from_millis(ms);
    }

    let node = Arc::new(
        HttpNodeClient::new(&args.node_url)
            .with_context(|| format!("invalid node url: {}", args.node_url))?,
    );
    let spawner = Arc::new(WsSocketSpawner::new(&args.ws_url));
    let machine = SyncMachine::new(
        settings,
        Arc::clone(&store),
        node,
        Arc::new(NullDeriver),
        spawner,
        notifications,
    );
    let mut machine_task = tokio::spawn(machine.run());

    // --- Status/read API ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        network: args.network.clone(),
        started_at: chrono::Utc::now(),
        store: Arc::clone(&store),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.http_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!("status API listening on {api_addr}");

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&mirror_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!("metrics listening on {metrics_addr}");

    // --- Serve ---
    tokio::select! {
        result = &mut machine_task => {
            match result {
                Ok(Ok(())) => anyhow::bail!("sync machine exited unexpectedly"),
                Ok(Err(error)) => {
                    return Err(error).context("sync machine failed; restart to resume");
                }
                Err(join_error) => anyhow::bail!("sync machine panicked: {join_error}"),
            }
        }
        result = axum::serve(api_listener, api_router) => {
            result.context("status API server failed")?;
        }
        result = axum::serve(metrics_listener, metrics_router) => {
            result.context("metrics server failed")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    machine_task.abort();
    store.flush().ok();
    tracing::info!("prism-daemon stopped");
    Ok(())
}

/// Feeds wallet notifications into the metrics counters. Lag is counted,
/// not fatal — the mirror itself is the source of truth.
async fn consume_notifications(
    mut notifications: tokio::sync::broadcast::Receiver<WalletNotification>,
    metrics: Arc<MirrorMetrics>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                match notification.kind {
                    NotificationKind::VertexAccepted => {
                        metrics.wallet_updates_accepted_total.inc()
                    }
                    NotificationKind::VertexVoided => metrics.wallet_updates_voided_total.inc(),
                }
                tracing::debug!(
                    wallet = %notification.wallet_id,
                    vertex = %notification.vertex,
                    "wallet update"
                );
            }
            Err(RecvError::Lagged(missed)) => {
                metrics.notifications_lagged_total.inc_by(missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Refreshes the cursor gauge from the store on a fixed schedule.
async fn poll_cursor(store: Arc<SledStore>, metrics: Arc<MirrorMetrics>) {
    let mut ticker = tokio::time::interval(CURSOR_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let cursor = store.begin().and_then(|txn| {
            let cursor = txn.last_event_id();
            txn.rollback();
            cursor
        });
        if let Ok(Some(id)) = cursor {
            metrics.last_event_id.set(id as i64);
        }
    }
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
