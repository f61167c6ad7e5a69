// =============================================================================
// Lifecycle & Restart Manager (C6) -- owns process-wide startup and shutdown
// ordering and a single-writer restart flag. Grounded on the teacher's
// main.rs top-level orchestration (construct shared state, spawn subsystem
// tasks, wait on ctrl_c, graceful shutdown) and app_state.rs's atomic-flag
// idiom for cross-task signaling, generalized from "N market data streams"
// to "one price stream + one gateway + one health loop."
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::{Config, StrategyKind};
use crate::gateway;
use crate::health;
use crate::notifier;
use crate::price_stream::PriceStream;
use crate::strategy::StrategyCore;
use crate::venue::VenueAdapter;

/// Set by the Health Supervisor when it observes a fatal condition; polled by
/// the run loop below to trigger a drain-then-re-exec restart. A plain
/// `AtomicBool` rather than a channel because many tasks may read it and at
/// most one (this loop) ever acts on it -- the single-writer flag spec.md
/// §4.6 calls for.
pub static RESTART_REQUESTED: AtomicBool = AtomicBool::new(false);

const DRAIN_WINDOW: Duration = Duration::from_secs(3);

pub async fn run() -> Result<()> {
    let config = Arc::new(Config::from_env().context("configuration failed validation")?);
    info!(symbol = %config.symbol, strategy = ?config.strategy, "starting signal-to-execution engine");

    let ws_url = std::env::var("VENUE_WS_URL").unwrap_or_else(|_| {
        format!("wss://fstream.binance.com/ws/{}@markPrice", config.symbol.to_ascii_lowercase())
    });

    let hedge_mode = config.strategy == StrategyKind::Hedging;
    let venue = Arc::new(
        VenueAdapter::initialize(config.venue_api_key.clone(), config.venue_secret.clone(), &config.symbol, config.leverage, hedge_mode)
            .await
            .context("venue adapter failed to initialize")?,
    );

    let price_stream = PriceStream::new(venue.symbol().to_string());
    let (tick_tx, mut tick_rx) = tokio::sync::mpsc::channel(256);
    let (stream_shutdown_tx, stream_shutdown_rx) = oneshot::channel();
    let stream_task = {
        let stream = price_stream.clone();
        tokio::spawn(stream.run(ws_url, tick_tx, stream_shutdown_rx))
    };
    // Drains the raw-tick channel so a future price-update consumer can be
    // added without the bounded sender ever blocking on today's no-op reader.
    tokio::spawn(async move { while tick_rx.recv().await.is_some() {} });

    let notifier = notifier::build(config.notifier_token.clone(), config.notifier_chats.clone());
    let strategy = StrategyCore::new(config.clone(), venue.clone(), price_stream.clone(), notifier);

    strategy.startup_reconciliation().await.context("startup reconciliation failed")?;

    let bind_addr = std::env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:80".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind signal gateway on {bind_addr}"))?;
    info!(addr = %bind_addr, "signal gateway listening");

    let health_strategy = strategy.clone();
    let health_addr = bind_addr.clone();
    tokio::spawn(async move {
        health::run(health_strategy, health_addr).await;
    });

    let app = gateway::router(strategy.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, draining");
        }
        joined = server => {
            match joined {
                Ok(Ok(())) => info!("gateway server exited voluntarily"),
                Ok(Err(err)) => error!(error = %err, "gateway server failed"),
                Err(err) => error!(error = %err, "gateway server task panicked"),
            }
        }
        _ = wait_for_restart_request() => {
            warn!("fatal health condition observed, restarting process");
        }
    }

    strategy.cleanup().await;
    let _ = stream_shutdown_tx.send(());
    let _ = tokio::time::timeout(DRAIN_WINDOW, stream_task).await;

    if RESTART_REQUESTED.load(Ordering::SeqCst) {
        re_exec()?;
    }

    info!("signal-to-execution engine shut down cleanly");
    Ok(())
}

async fn wait_for_restart_request() {
    loop {
        if RESTART_REQUESTED.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Rust has no clean fork-free process replace equivalent to `os.execv`;
/// the idiomatic substitute is to spawn a detached copy of this executable
/// and let the current process exit once the drain window above completes.
fn re_exec() -> Result<()> {
    let exe = std::env::current_exe().context("cannot resolve current executable path for restart")?;
    std::process::Command::new(exe).spawn().context("failed to spawn restarted process image")?;
    Ok(())
}
