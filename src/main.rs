// =============================================================================
// Candle Feed — Main Entry Point
// =============================================================================
//
// Wires the upstream WebSocket client, the feed engine and the renderer API
// together. The engine is the only task that mutates candle state; everything
// else talks to it through channels.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod engine;
mod error;
mod market_data;
mod render_throttle;
mod runtime_config;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, MarketSnapshot};
use crate::engine::{AggregationContext, ContextLimits, FeedEngine};
use crate::market_data::upstream::{run_upstream, UpstreamConfig};
use crate::runtime_config::FeedConfig;

/// Frames buffered between the socket reader and the engine.
const FEED_CHANNEL_CAPACITY: usize = 1024;
const COMMAND_CHANNEL_CAPACITY: usize = 16;
const ACTION_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Feed starting up");

    let config_path =
        std::env::var("CANDLE_FEED_CONFIG").unwrap_or_else(|_| "feed_config.json".to_string());
    let mut config = FeedConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });
    config.apply_env();

    info!(
        symbol = %config.symbol,
        interval = %config.interval,
        market_type = %config.market_type,
        upstream = %config.upstream_base,
        exchange = %config.exchange,
        "Initial context"
    );

    // ── 2. Aggregation context & shared state ────────────────────────────
    let ctx = AggregationContext::new(
        config.symbol.clone(),
        config.interval,
        config.market_type,
        ContextLimits {
            max_candles: config.max_candles,
        },
    );

    let (feed_tx, feed_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (action_tx, action_rx) = mpsc::channel(ACTION_CHANNEL_CAPACITY);
    let (context_tx, context_rx) = watch::channel(ctx.key().clone());

    let state = Arc::new(AppState::new(
        MarketSnapshot::of(&ctx),
        config.max_control_logs,
        cmd_tx,
        action_tx,
    ));

    // ── 3. Feed engine ───────────────────────────────────────────────────
    let engine = FeedEngine::new(
        ctx,
        Duration::from_millis(config.throttle_ms),
        state.clone(),
        context_tx,
    );
    tokio::spawn(engine.run(feed_rx, cmd_rx));

    // ── 4. Upstream stream (reconnects forever) ──────────────────────────
    let upstream = UpstreamConfig {
        base: config.upstream_base.clone(),
        exchange: config.exchange.clone(),
        reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
    };
    tokio::spawn(run_upstream(upstream, context_rx, feed_tx, action_rx));

    // ── 5. Start the API server ──────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received -- stopping gracefully");

    // Persist whatever context the user last switched to.
    let current = state.context();
    config.symbol = current.symbol;
    config.interval = current.interval;
    config.market_type = current.market_type;
    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to save feed config on shutdown");
    }

    info!("Candle Feed shut down complete.");
    Ok(())
}
