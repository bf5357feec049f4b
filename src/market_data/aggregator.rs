// =============================================================================
// Tick Aggregator — folds price observations into the candle store
// =============================================================================
//
// Trade ticks and ticker snapshots are both "price observations" and go
// through the same boundary policy; they only differ in arrival cadence.
// Boundary arithmetic is done once, here, so merge and roll decisions can
// never drift apart.
// =============================================================================

use serde::Serialize;
use tracing::{debug, trace};

use crate::error::IngestError;
use crate::market_data::candle_store::{BarOutcome, Candle, CandleStore, FoldOutcome};
use crate::market_data::classifier::Tick;

/// Where a price observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationSource {
    Trade,
    Snapshot,
}

impl std::fmt::Display for ObservationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trade => write!(f, "trade"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Running totals of what the aggregator did with its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub opened: u64,
    pub merged: u64,
    pub rolled: u64,
    pub bars_applied: u64,
    pub late_rejected: u64,
    pub gap_rejected: u64,
}

/// Applies the bucket boundary policy and keeps count of the outcomes.
#[derive(Debug, Default)]
pub struct TickAggregator {
    stats: AggregatorStats,
}

impl TickAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = AggregatorStats::default();
    }

    /// Fold one observation into `store`.
    ///
    /// Late observations come back as [`IngestError::OutOfOrderTick`] and
    /// observations more than one bucket ahead as [`IngestError::TickGap`];
    /// the store is untouched in both cases.
    pub fn fold(
        &mut self,
        store: &mut CandleStore,
        tick: Tick,
        source: ObservationSource,
    ) -> Result<FoldOutcome, IngestError> {
        let bucket_start = store.interval().bucket_start(tick.time);
        let result = store.fold_tick_into_last(tick.price, bucket_start);

        match &result {
            Ok(FoldOutcome::Opened) => {
                self.stats.opened += 1;
                debug!(%source, bucket_start, price = tick.price, "first candle opened");
            }
            Ok(FoldOutcome::Merged) => self.stats.merged += 1,
            Ok(FoldOutcome::Rolled) => {
                self.stats.rolled += 1;
                debug!(%source, bucket_start, price = tick.price, "rolled to new candle");
            }
            Err(IngestError::OutOfOrderTick { .. }) => {
                self.stats.late_rejected += 1;
                trace!(%source, bucket_start, "late observation rejected");
            }
            Err(IngestError::TickGap { .. }) => self.stats.gap_rejected += 1,
            Err(_) => {}
        }
        result
    }

    /// Apply an authoritative kline bar.
    pub fn apply_bar(
        &mut self,
        store: &mut CandleStore,
        bar: Candle,
    ) -> Result<BarOutcome, IngestError> {
        let result = store.append_bar(bar);
        match &result {
            Ok(_) => self.stats.bars_applied += 1,
            Err(IngestError::OutOfOrderTick { .. }) => self.stats.late_rejected += 1,
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Interval;

    fn tick(price: f64, time: i64) -> Tick {
        Tick { price, time }
    }

    #[test]
    fn boundary_walk_at_one_minute() {
        let mut store = CandleStore::new(Interval::OneMinute, 100);
        let mut agg = TickAggregator::new();

        assert_eq!(
            agg.fold(&mut store, tick(10.0, 125), ObservationSource::Trade),
            Ok(FoldOutcome::Opened)
        );
        assert_eq!(store.last().map(|c| c.bucket_start), Some(120));

        assert_eq!(
            agg.fold(&mut store, tick(11.0, 179), ObservationSource::Trade),
            Ok(FoldOutcome::Merged)
        );
        assert_eq!(store.snapshot().len(), 1);

        assert_eq!(
            agg.fold(&mut store, tick(12.0, 180), ObservationSource::Snapshot),
            Ok(FoldOutcome::Rolled)
        );
        assert_eq!(store.last().map(|c| c.bucket_start), Some(180));
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn late_tick_after_roll_is_rejected() {
        let mut store = CandleStore::new(Interval::OneMinute, 100);
        let mut agg = TickAggregator::new();
        agg.fold(&mut store, tick(10.0, 125), ObservationSource::Trade).unwrap();
        agg.fold(&mut store, tick(12.0, 180), ObservationSource::Trade).unwrap();
        let before = store.snapshot().to_vec();

        let err = agg
            .fold(&mut store, tick(99.0, 125), ObservationSource::Trade)
            .unwrap_err();
        assert_eq!(
            err,
            IngestError::OutOfOrderTick {
                bucket_start: 120,
                last_bucket_start: 180
            }
        );
        assert_eq!(store.snapshot(), before.as_slice());
        assert_eq!(agg.stats().late_rejected, 1);
    }

    #[test]
    fn gap_tick_creates_nothing() {
        let mut store = CandleStore::new(Interval::OneMinute, 100);
        let mut agg = TickAggregator::new();
        agg.fold(&mut store, tick(10.0, 60), ObservationSource::Trade).unwrap();

        let err = agg
            .fold(&mut store, tick(11.0, 300), ObservationSource::Snapshot)
            .unwrap_err();
        assert!(matches!(err, IngestError::TickGap { bucket_start: 300, .. }));
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(agg.stats().gap_rejected, 1);
    }

    #[test]
    fn trade_and_snapshot_follow_same_policy() {
        let mut a = CandleStore::new(Interval::FifteenMinutes, 100);
        let mut b = CandleStore::new(Interval::FifteenMinutes, 100);
        let mut agg = TickAggregator::new();
        let ticks = [(10.0, 900), (12.0, 1000), (9.0, 1799), (11.0, 1800), (8.0, 850)];

        for (price, time) in ticks {
            let ra = agg.fold(&mut a, tick(price, time), ObservationSource::Trade);
            let rb = agg.fold(&mut b, tick(price, time), ObservationSource::Snapshot);
            assert_eq!(ra, rb);
        }
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn stale_bar_counts_as_late() {
        let mut store = CandleStore::new(Interval::OneMinute, 100);
        let mut agg = TickAggregator::new();
        agg.fold(&mut store, tick(10.0, 180), ObservationSource::Trade).unwrap();
        assert!(agg.apply_bar(&mut store, Candle::flat(120, 9.0)).is_err());
        assert!(agg.apply_bar(&mut store, Candle::flat(180, 9.5)).is_ok());
        assert_eq!(agg.stats().late_rejected, 1);
        assert_eq!(agg.stats().bars_applied, 1);
    }
}
