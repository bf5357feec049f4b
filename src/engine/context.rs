// =============================================================================
// Aggregation Context — the single owner of one context's candle state
// =============================================================================
//
// A synchronous reducer: each inbound frame is classified and applied to
// completion before the next one is looked at. No I/O and no locks; the feed
// engine owns the context and publishes copies of its state.
// =============================================================================

use chrono::Utc;
use serde::Serialize;
use tracing::{info, trace, warn};

use crate::error::IngestError;
use crate::market_data::aggregator::{AggregatorStats, ObservationSource, TickAggregator};
use crate::market_data::candle_store::{BarOutcome, Candle, CandleStore, FoldOutcome};
use crate::market_data::classifier::{parse_frame, ControlMessage, StreamEvent, Tick};
use crate::market_data::reconciler::{reconcile, ReconcileReport};
use crate::types::{ContextKey, Interval, MarketType};

// =============================================================================
// Public value types
// =============================================================================

/// Display-only price, stamped with the wall-clock time it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatestPrice {
    pub price: f64,
    /// Unix milliseconds.
    pub updated_at: i64,
}

impl LatestPrice {
    fn now(price: f64) -> Self {
        Self {
            price,
            updated_at: Utc::now().timestamp_millis(),
        }
    }
}

/// A control/log message as kept for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlLogEntry {
    #[serde(flatten)]
    pub message: ControlMessage,
    /// ISO 8601 receive time.
    pub at: String,
}

/// Per-context counters for everything that did not reach the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounters {
    pub frames: u64,
    pub backfills: u64,
    pub malformed: u64,
    pub context_mismatched: u64,
    pub invariant_violations: u64,
}

/// What applying one event did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Backfilled(ReconcileReport),
    Tick(FoldOutcome),
    Bar(BarOutcome),
    Control(ControlLogEntry),
}

impl Applied {
    /// Whether the candle series itself changed shape (as opposed to the
    /// live candle moving).
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Backfilled(_))
    }
}

/// Sizing knobs that survive context resets.
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_candles: usize,
}

// =============================================================================
// AggregationContext
// =============================================================================

#[derive(Debug)]
pub struct AggregationContext {
    key: ContextKey,
    limits: ContextLimits,
    store: CandleStore,
    aggregator: TickAggregator,
    latest: Option<LatestPrice>,
    resync_pending: bool,
    counters: IngestCounters,
}

impl AggregationContext {
    pub fn new(
        symbol: impl Into<String>,
        interval: Interval,
        market_type: MarketType,
        limits: ContextLimits,
    ) -> Self {
        Self {
            key: ContextKey {
                symbol: symbol.into(),
                interval,
                market_type,
                generation: 1,
            },
            limits,
            store: CandleStore::new(interval, limits.max_candles),
            aggregator: TickAggregator::new(),
            latest: None,
            resync_pending: false,
            counters: IngestCounters::default(),
        }
    }

    // ── Read side ───────────────────────────────────────────────────────

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.key.generation
    }

    /// The ordered candle series, read-only.
    pub fn candles(&self) -> &[Candle] {
        self.store.snapshot()
    }

    pub fn latest_price(&self) -> Option<LatestPrice> {
        self.latest
    }

    /// Start of the live (newest) bucket.
    pub fn live_bucket_start(&self) -> Option<i64> {
        self.store.last().map(|c| c.bucket_start)
    }

    /// Whether the store holds `max_candles` buckets, so the next new bucket
    /// evicts the oldest one.
    pub fn at_capacity(&self) -> bool {
        self.store.is_full()
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    pub fn counters(&self) -> IngestCounters {
        self.counters
    }

    pub fn aggregator_stats(&self) -> AggregatorStats {
        self.aggregator.stats()
    }

    // ── Context lifecycle ───────────────────────────────────────────────

    /// Discard all candle state and start a new, empty context. The bumped
    /// generation invalidates anything still in flight for the old one.
    pub fn reset_context(
        &mut self,
        symbol: impl Into<String>,
        interval: Interval,
        market_type: MarketType,
    ) -> &ContextKey {
        let generation = self.key.generation + 1;
        self.key = ContextKey {
            symbol: symbol.into(),
            interval,
            market_type,
            generation,
        };
        self.store = CandleStore::new(interval, self.limits.max_candles);
        self.aggregator.reset_stats();
        self.latest = None;
        self.resync_pending = false;
        self.counters = IngestCounters::default();

        info!(context = %self.key, "context reset -- candle store discarded");
        &self.key
    }

    /// A fresh upstream connection for this context came up. Ticks alone
    /// cannot repair whatever was missed, so wait for a backfill.
    pub fn mark_connected(&mut self, generation: u64) {
        if generation == self.key.generation {
            self.resync_pending = true;
        }
    }

    // ── Write side ──────────────────────────────────────────────────────

    /// Apply one raw frame to the current context.
    pub fn on_event(&mut self, raw: &str) -> Result<Applied, IngestError> {
        self.counters.frames += 1;
        let result = parse_frame(raw).and_then(|event| self.apply(event));
        match &result {
            Err(IngestError::MalformedEvent(_)) => self.counters.malformed += 1,
            Err(IngestError::StoreInvariantViolation { .. }) => {
                self.counters.invariant_violations += 1
            }
            _ => {}
        }
        result
    }

    /// Apply one raw frame produced for context `generation`. Frames for any
    /// other generation are counted and dropped untouched.
    pub fn on_tagged_event(&mut self, generation: u64, raw: &str) -> Result<Applied, IngestError> {
        if generation != self.key.generation {
            self.counters.frames += 1;
            self.counters.context_mismatched += 1;
            return Err(IngestError::ContextMismatch {
                tagged: generation,
                current: self.key.generation,
            });
        }
        self.on_event(raw)
    }

    /// The reducer proper: `(state, event) -> state'`.
    pub fn apply(&mut self, event: StreamEvent) -> Result<Applied, IngestError> {
        trace!(context = %self.key, kind = event.kind(), "applying event");
        match event {
            StreamEvent::HistoryBatch { entries, skipped } => {
                let (series, report) = reconcile(self.key.interval, entries);
                if series.is_empty() {
                    warn!(
                        context = %self.key,
                        received = report.received,
                        "backfill left no usable candles -- clearing store"
                    );
                }
                if let Some(last) = series.last() {
                    self.latest = Some(LatestPrice::now(last.close));
                }
                let kept = self.store.replace(&series);
                self.resync_pending = false;
                self.counters.backfills += 1;

                info!(
                    context = %self.key,
                    received = report.received,
                    skipped,
                    discarded = report.discarded,
                    duplicates = report.duplicates,
                    kept,
                    "backfill applied"
                );
                Ok(Applied::Backfilled(report))
            }
            StreamEvent::Trade(tick) => self.observe(tick, ObservationSource::Trade),
            StreamEvent::SnapshotTick(tick) => self.observe(tick, ObservationSource::Snapshot),
            StreamEvent::Bar(bar) => {
                let outcome = self.aggregator.apply_bar(&mut self.store, bar)?;
                self.latest = Some(LatestPrice::now(bar.close));
                Ok(Applied::Bar(outcome))
            }
            StreamEvent::Control(message) => {
                let entry = ControlLogEntry {
                    message,
                    at: Utc::now().to_rfc3339(),
                };
                Ok(Applied::Control(entry))
            }
            StreamEvent::Unrecognized => Err(IngestError::malformed("unrecognized message shape")),
        }
    }

    fn observe(
        &mut self,
        tick: Tick,
        source: ObservationSource,
    ) -> Result<Applied, IngestError> {
        let result = self.aggregator.fold(&mut self.store, tick, source);
        // A tick too far ahead still carries the freshest price; a late one
        // never does.
        if matches!(result, Ok(_) | Err(IngestError::TickGap { .. })) {
            self.latest = Some(LatestPrice::now(tick.price));
        }
        result.map(Applied::Tick)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    const LIMITS: ContextLimits = ContextLimits { max_candles: 500 };

    fn ctx() -> AggregationContext {
        AggregationContext::new("BTC/USDT", Interval::OneMinute, MarketType::Spot, LIMITS)
    }

    fn starts(ctx: &AggregationContext) -> Vec<i64> {
        ctx.candles().iter().map(|c| c.bucket_start).collect()
    }

    #[test]
    fn ticks_walk_the_boundaries() {
        let mut c = ctx();
        c.on_event(r#"{"type":"trade","price":10.0,"time":125}"#).unwrap();
        c.on_event(r#"{"type":"trade","price":11.0,"time":179}"#).unwrap();
        c.on_event(r#"{"price":12.0,"time":180}"#).unwrap();

        assert_eq!(starts(&c), vec![120, 180]);
        assert_eq!(c.candles()[0].close, 11.0);
        assert_eq!(c.latest_price().map(|p| p.price), Some(12.0));
        assert_eq!(c.live_bucket_start(), Some(180));
    }

    #[test]
    fn late_tick_does_not_move_price() {
        let mut c = ctx();
        c.on_event(r#"{"type":"trade","price":10.0,"time":185}"#).unwrap();
        let err = c.on_event(r#"{"type":"trade","price":1.0,"time":125}"#).unwrap_err();
        assert!(matches!(err, IngestError::OutOfOrderTick { .. }));
        assert_eq!(c.latest_price().map(|p| p.price), Some(10.0));
        assert_eq!(starts(&c), vec![180]);
    }

    #[test]
    fn gap_tick_moves_price_but_not_candles() {
        let mut c = ctx();
        c.on_event(r#"{"type":"trade","price":10.0,"time":60}"#).unwrap();
        let err = c.on_event(r#"{"type":"trade","price":15.0,"time":300}"#).unwrap_err();
        assert!(matches!(err, IngestError::TickGap { .. }));
        assert_eq!(starts(&c), vec![60]);
        assert_eq!(c.latest_price().map(|p| p.price), Some(15.0));
    }

    #[test]
    fn backfill_dedups_and_replaces() {
        let mut c = ctx();
        c.on_event(r#"{"type":"trade","price":99.0,"time":6000}"#).unwrap();

        let applied = c
            .on_event(
                r#"{"type":"history","data":[
                    {"time":60,"open":1,"high":2,"low":1,"close":1.5},
                    {"time":60,"open":2,"high":3,"low":2,"close":2.5},
                    {"time":120,"open":3,"high":4,"low":3,"close":3.5}
                ]}"#,
            )
            .unwrap();

        assert!(applied.is_structural());
        assert_eq!(starts(&c), vec![60, 120]);
        assert_eq!(c.candles()[0].close, 2.5);
        assert_eq!(c.latest_price().map(|p| p.price), Some(3.5));
    }

    #[test]
    fn backfill_clears_resync_flag() {
        let mut c = ctx();
        c.mark_connected(c.generation());
        assert!(c.resync_pending());
        c.on_event(r#"{"type":"history","data":[]}"#).unwrap();
        assert!(!c.resync_pending());
    }

    #[test]
    fn connect_for_old_generation_is_ignored() {
        let mut c = ctx();
        let old = c.generation();
        c.reset_context("BTC/USDT", Interval::OneHour, MarketType::Spot);
        c.mark_connected(old);
        assert!(!c.resync_pending());
    }

    #[test]
    fn interval_switch_discards_candles_and_stale_backfill() {
        let mut c = ctx();
        let old = c.generation();
        c.on_event(r#"{"type":"trade","price":10.0,"time":125}"#).unwrap();

        c.reset_context("BTC/USDT", Interval::FifteenMinutes, MarketType::Spot);
        assert!(c.candles().is_empty());
        assert!(c.latest_price().is_none());
        assert_eq!(c.key().interval, Interval::FifteenMinutes);

        let err = c
            .on_tagged_event(
                old,
                r#"{"type":"history","data":[{"time":60,"open":1,"high":1,"low":1,"close":1}]}"#,
            )
            .unwrap_err();
        assert_eq!(
            err,
            IngestError::ContextMismatch {
                tagged: old,
                current: old + 1
            }
        );
        assert!(c.candles().is_empty());
        assert_eq!(c.counters().context_mismatched, 1);
    }

    #[test]
    fn control_messages_pass_through_without_touching_candles() {
        let mut c = ctx();
        c.on_event(r#"{"type":"trade","price":10.0,"time":60}"#).unwrap();
        let before = c.candles().to_vec();

        match c.on_event(r#"{"log":"relay restarting","type":"warning"}"#) {
            Ok(Applied::Control(entry)) => {
                assert_eq!(entry.message.text, "relay restarting");
                assert_eq!(entry.message.severity, Severity::Warning);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.candles(), before.as_slice());
        assert_eq!(c.latest_price().map(|p| p.price), Some(10.0));
    }

    #[test]
    fn tagged_and_untagged_frames_share_counters() {
        let mut c = ctx();
        let current = c.generation();
        c.on_tagged_event(current, r#"{"type":"trade","price":10.0,"time":60}"#)
            .unwrap();
        c.on_event(r#"{"type":"trade","price":11.0,"time":70}"#).unwrap();
        assert!(c.on_tagged_event(current + 5, "garbage").is_err());
        assert!(c.on_tagged_event(current, "garbage").is_err());

        let counters = c.counters();
        assert_eq!(counters.frames, 4);
        assert_eq!(counters.context_mismatched, 1);
        assert_eq!(counters.malformed, 1);
        assert_eq!(c.candles()[0].close, 11.0);
    }

    #[test]
    fn capacity_tracks_store_cap() {
        let mut c = AggregationContext::new(
            "BTC/USDT",
            Interval::OneMinute,
            MarketType::Spot,
            ContextLimits { max_candles: 2 },
        );
        c.on_event(r#"{"type":"trade","price":10.0,"time":60}"#).unwrap();
        assert!(!c.at_capacity());
        c.on_event(r#"{"type":"trade","price":11.0,"time":120}"#).unwrap();
        assert!(c.at_capacity());
        c.on_event(r#"{"type":"trade","price":12.0,"time":180}"#).unwrap();
        assert!(c.at_capacity());
        assert_eq!(starts(&c), vec![120, 180]);
    }

    #[test]
    fn junk_is_counted_not_applied() {
        let mut c = ctx();
        assert!(c.on_event("garbage").is_err());
        assert!(c.on_event(r#"{"hello":"world"}"#).is_err());
        assert_eq!(c.counters().malformed, 2);
        assert_eq!(c.counters().frames, 2);
        assert!(c.candles().is_empty());
    }

    #[test]
    fn kline_bar_fills_gap_that_ticks_cannot() {
        let mut c = ctx();
        c.on_event(r#"{"type":"trade","price":10.0,"time":60}"#).unwrap();
        assert!(c.on_event(r#"{"type":"trade","price":11.0,"time":300}"#).is_err());
        let applied = c
            .on_event(r#"{"type":"kline","time":300,"open":10.5,"high":11.5,"low":10.0,"close":11.0}"#)
            .unwrap();
        assert_eq!(applied, Applied::Bar(BarOutcome::Appended));
        c.on_event(r#"{"type":"trade","price":11.2,"time":330}"#).unwrap();
        assert_eq!(starts(&c), vec![60, 300]);
        assert_eq!(c.candles()[1].close, 11.2);
    }
}
