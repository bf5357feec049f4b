// =============================================================================
// Feed Engine — the one task that mutates candle state
// =============================================================================
//
// Multiplexes three inputs with `tokio::select!`:
//   1. Upstream signals (frames tagged with their context generation).
//   2. Host commands (context resets).
//   3. The render throttle's deadline, to release a parked price update.
//
// Each input is handled to completion before the next is polled, so the
// aggregation context never sees concurrent mutation.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::app_state::{AppState, FeedUpdate, MarketSnapshot};
use crate::engine::context::{AggregationContext, Applied, LatestPrice};
use crate::error::IngestError;
use crate::render_throttle::RenderThrottle;
use crate::types::{ContextKey, Interval, MarketType};

/// What the upstream connection reports to the engine.
#[derive(Debug)]
pub enum FeedSignal {
    Connected { generation: u64 },
    Frame { generation: u64, text: String },
    Disconnected { generation: u64, reason: String },
}

/// Requests from the HTTP layer.
#[derive(Debug)]
pub enum EngineCommand {
    ResetContext {
        symbol: String,
        interval: Interval,
        market_type: MarketType,
        reply: oneshot::Sender<ContextKey>,
    },
}

pub struct FeedEngine {
    ctx: AggregationContext,
    throttle: RenderThrottle<LatestPrice>,
    state: Arc<AppState>,
    context_tx: watch::Sender<ContextKey>,
    /// Live bucket as of the last publication. Buckets opened after it are
    /// what the next forward has to carry.
    tail_anchor: Option<i64>,
}

impl FeedEngine {
    pub fn new(
        ctx: AggregationContext,
        throttle_interval: Duration,
        state: Arc<AppState>,
        context_tx: watch::Sender<ContextKey>,
    ) -> Self {
        let tail_anchor = ctx.live_bucket_start();
        Self {
            ctx,
            throttle: RenderThrottle::new(throttle_interval),
            state,
            context_tx,
            tail_anchor,
        }
    }

    /// Run until both input channels are closed.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<FeedSignal>,
        mut commands: mpsc::Receiver<EngineCommand>,
    ) {
        info!(
            context = %self.ctx.key(),
            throttle_ms = self.throttle.min_interval().as_millis() as u64,
            "feed engine started"
        );
        let mut commands_open = true;

        loop {
            let deadline = self.throttle.deadline();
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal),
                    None => break,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                _ = sleep_until(deadline) => self.flush_throttle(Instant::now()),
            }
        }

        // Whatever the gate was still holding is the newest state.
        if self.throttle.has_pending() {
            self.throttle.clear();
            self.publish_forwarded();
        }
        info!("feed engine stopped -- upstream channel closed");
    }

    // ── Upstream ────────────────────────────────────────────────────────

    pub fn handle_signal(&mut self, signal: FeedSignal) {
        match signal {
            FeedSignal::Connected { generation } => {
                self.ctx.mark_connected(generation);
                if generation == self.ctx.generation() {
                    self.state.set_upstream_connected(true);
                    info!(context = %self.ctx.key(), "upstream connected -- awaiting backfill");
                }
            }
            FeedSignal::Disconnected { generation, reason } => {
                if generation == self.ctx.generation() {
                    self.state.set_upstream_connected(false);
                    warn!(context = %self.ctx.key(), reason = %reason, "upstream disconnected");
                }
            }
            FeedSignal::Frame { generation, text } => {
                self.state.touch_frame();
                let result = self.ctx.on_tagged_event(generation, &text);
                self.after_event(result, Instant::now());
            }
        }
    }

    fn after_event(&mut self, result: Result<Applied, IngestError>, now: Instant) {
        match result {
            Ok(Applied::Control(entry)) => {
                info!(
                    severity = %entry.message.severity,
                    text = %entry.message.text,
                    "upstream control message"
                );
                self.state.push_log(entry);
            }
            Ok(applied) if applied.is_structural() => self.publish_snapshot(now),
            Ok(_) => self.offer_price(now),
            // A gap tick still refreshed the displayed price.
            Err(e @ IngestError::TickGap { .. }) => {
                debug!(error = %e, "tick ahead of live bucket -- left for backfill");
                self.offer_price(now);
            }
            Err(e @ IngestError::OutOfOrderTick { .. }) => trace!(error = %e, "late tick dropped"),
            Err(e @ IngestError::ContextMismatch { .. }) => {
                debug!(error = %e, "stale-context frame dropped")
            }
            Err(e @ IngestError::MalformedEvent(_)) => warn!(error = %e, "frame dropped"),
            Err(e @ IngestError::StoreInvariantViolation { .. }) => {
                error!(error = %e, "store invariant violation healed");
                self.publish_snapshot(now);
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    pub fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::ResetContext {
                symbol,
                interval,
                market_type,
                reply,
            } => {
                let key = self.ctx.reset_context(symbol, interval, market_type).clone();
                // Pending renders belong to the old context.
                self.throttle.clear();
                self.state.set_upstream_connected(false);
                self.publish_snapshot(Instant::now());
                // The upstream supervisor reconnects for the new key.
                if self.context_tx.send(key.clone()).is_err() {
                    warn!("upstream supervisor is gone -- context change not propagated");
                }
                let _ = reply.send(key);
            }
        }
    }

    // ── Rendering ───────────────────────────────────────────────────────

    fn offer_price(&mut self, now: Instant) {
        let Some(price) = self.ctx.latest_price() else {
            return;
        };
        if self.throttle.offer(price, now).is_some() {
            self.publish_forwarded();
        }
    }

    pub fn flush_throttle(&mut self, now: Instant) {
        if self.throttle.poll(now).is_some() {
            self.publish_forwarded();
        }
    }

    /// Forward the current state as a tail when two candles are enough to
    /// catch a renderer up, as a full snapshot otherwise: more than one
    /// bucket opened since the last publication, or a new bucket evicted the
    /// oldest one.
    fn publish_forwarded(&mut self) {
        let opened = self.buckets_opened_since_publish();
        if opened > 1 || (opened == 1 && self.ctx.at_capacity()) {
            debug!(opened, "tail cannot cover the change -- sending snapshot");
            self.publish_full();
            return;
        }
        self.state
            .publish(MarketSnapshot::of(&self.ctx), FeedUpdate::tail(&self.ctx));
        self.tail_anchor = self.ctx.live_bucket_start();
    }

    fn buckets_opened_since_publish(&self) -> usize {
        let candles = self.ctx.candles();
        match self.tail_anchor {
            Some(anchor) => candles
                .iter()
                .rev()
                .take_while(|c| c.bucket_start > anchor)
                .count(),
            None => candles.len(),
        }
    }

    fn publish_snapshot(&mut self, now: Instant) {
        if let Some(price) = self.ctx.latest_price() {
            self.throttle.force(price, now);
        }
        self.publish_full();
    }

    fn publish_full(&mut self) {
        let snapshot = MarketSnapshot::of(&self.ctx);
        self.state
            .publish(snapshot.clone(), FeedUpdate::Snapshot(snapshot));
        self.tail_anchor = self.ctx.live_bucket_start();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
