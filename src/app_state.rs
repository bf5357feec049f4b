// =============================================================================
// Central Application State — read side of the candle feed
// =============================================================================
//
// The feed engine task owns the aggregation context and is the only writer of
// candle state. After every forwarded update it republishes a copy here, where
// the REST handlers read it and WebSocket clients receive it via broadcast.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the published copies.
//   - Channels (not locks) to reach the engine and the upstream socket.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::engine::context::{
    AggregationContext, ControlLogEntry, IngestCounters, LatestPrice,
};
use crate::engine::runner::EngineCommand;
use crate::market_data::aggregator::AggregatorStats;
use crate::market_data::candle_store::Candle;
use crate::types::{ContextKey, Interval, MarketType};

/// Buffered updates per WebSocket subscriber before it starts lagging.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Published views
// =============================================================================

/// Everything a renderer needs to draw the chart from scratch.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub context: ContextKey,
    pub candles: Vec<Candle>,
    pub latest_price: Option<LatestPrice>,
    /// Set after a reconnect until the next backfill lands.
    pub resync_pending: bool,
    pub counters: IngestCounters,
    pub aggregator: AggregatorStats,
}

impl MarketSnapshot {
    pub fn of(ctx: &AggregationContext) -> Self {
        Self {
            context: ctx.key().clone(),
            candles: ctx.candles().to_vec(),
            latest_price: ctx.latest_price(),
            resync_pending: ctx.resync_pending(),
            counters: ctx.counters(),
            aggregator: ctx.aggregator_stats(),
        }
    }
}

/// Messages pushed to renderers over the WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedUpdate {
    /// Whole series; sent on connect, after backfills and resets, and
    /// whenever the tail alone cannot bring a renderer up to date.
    Snapshot(MarketSnapshot),
    /// The last one or two candles (two right after a roll) plus the price.
    Tail {
        context: ContextKey,
        candles: Vec<Candle>,
        latest_price: Option<LatestPrice>,
    },
    /// An upstream control/log message.
    Log(ControlLogEntry),
}

impl FeedUpdate {
    pub fn tail(ctx: &AggregationContext) -> Self {
        let candles = ctx.candles();
        let from = candles.len().saturating_sub(2);
        Self::Tail {
            context: ctx.key().clone(),
            candles: candles[from..].to_vec(),
            latest_price: ctx.latest_price(),
        }
    }
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    /// Bumped on every publication; lets pollers detect change cheaply.
    pub state_version: AtomicU64,

    market: RwLock<MarketSnapshot>,
    recent_logs: RwLock<VecDeque<ControlLogEntry>>,
    max_logs: usize,

    pub upstream_connected: RwLock<bool>,
    pub last_frame_at: RwLock<Option<Instant>>,

    updates: broadcast::Sender<FeedUpdate>,
    commands: mpsc::Sender<EngineCommand>,
    actions: mpsc::Sender<serde_json::Value>,

    /// Used for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        initial: MarketSnapshot,
        max_logs: usize,
        commands: mpsc::Sender<EngineCommand>,
        actions: mpsc::Sender<serde_json::Value>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state_version: AtomicU64::new(1),
            market: RwLock::new(initial),
            recent_logs: RwLock::new(VecDeque::with_capacity(max_logs)),
            max_logs,
            upstream_connected: RwLock::new(false),
            last_frame_at: RwLock::new(None),
            updates,
            commands,
            actions,
            start_time: Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Read side ───────────────────────────────────────────────────────

    pub fn market(&self) -> MarketSnapshot {
        self.market.read().clone()
    }

    pub fn context(&self) -> ContextKey {
        self.market.read().context.clone()
    }

    /// Recent control messages, oldest first.
    pub fn logs(&self) -> Vec<ControlLogEntry> {
        self.recent_logs.read().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedUpdate> {
        self.updates.subscribe()
    }

    // ── Publication (engine task only) ──────────────────────────────────

    /// Replace the published market view and fan `update` out to renderers.
    pub fn publish(&self, snapshot: MarketSnapshot, update: FeedUpdate) {
        *self.market.write() = snapshot;
        self.increment_version();
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    pub fn push_log(&self, entry: ControlLogEntry) {
        {
            let mut logs = self.recent_logs.write();
            logs.push_back(entry.clone());
            while logs.len() > self.max_logs {
                logs.pop_front();
            }
        }
        self.increment_version();
        let _ = self.updates.send(FeedUpdate::Log(entry));
    }

    pub fn set_upstream_connected(&self, connected: bool) {
        *self.upstream_connected.write() = connected;
        self.increment_version();
    }

    pub fn touch_frame(&self) {
        *self.last_frame_at.write() = Some(Instant::now());
    }

    // ── Requests towards the engine / upstream ──────────────────────────

    /// Ask the engine to switch context and wait for the new key.
    pub async fn reset_context(
        &self,
        symbol: String,
        interval: Interval,
        market_type: MarketType,
    ) -> Result<ContextKey> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::ResetContext {
                symbol,
                interval,
                market_type,
                reply,
            })
            .await
            .context("feed engine is not running")?;
        rx.await.context("feed engine dropped the reset request")
    }

    /// Queue an outbound action for the upstream socket, verbatim.
    pub fn relay_action(&self, action: serde_json::Value) -> Result<()> {
        self.actions
            .try_send(action)
            .map_err(|e| anyhow::anyhow!("action queue unavailable: {e}"))
    }
}
