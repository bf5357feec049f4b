// =============================================================================
// Backfill Reconciler — turns an unordered history batch into a clean series
// =============================================================================
//
// A backfill is an authoritative re-synchronisation: the reconciled series
// replaces the candle store wholesale instead of being merged bucket by
// bucket. Duplicates resolve to the entry received last.
// =============================================================================

use serde::Serialize;

use crate::market_data::candle_store::Candle;
use crate::types::Interval;

/// Strictly ordered, duplicate-free candle series. Only [`reconcile`] can
/// build one, which is what lets [`CandleStore::replace`] trust it.
///
/// [`CandleStore::replace`]: crate::market_data::candle_store::CandleStore::replace
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledSeries(Vec<Candle>);

impl ReconciledSeries {
    pub fn candles(&self) -> &[Candle] {
        &self.0
    }

    pub fn last(&self) -> Option<&Candle> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Counters describing what a reconciliation pass did with its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub received: usize,
    /// Unusable entries: inconsistent OHLC or a bucket off the interval grid.
    pub discarded: usize,
    /// Entries superseded by a later entry for the same bucket.
    pub duplicates: usize,
    pub kept: usize,
}

/// Sort, validate and deduplicate a raw backfill batch.
pub fn reconcile(interval: Interval, batch: Vec<Candle>) -> (ReconciledSeries, ReconcileReport) {
    let received = batch.len();

    let mut valid: Vec<Candle> = batch
        .into_iter()
        .filter(|c| c.is_consistent() && interval.is_aligned(c.bucket_start))
        .collect();
    let discarded = received - valid.len();

    // Stable sort keeps arrival order among equal buckets, so the last one in
    // each run is the latest received.
    valid.sort_by_key(|c| c.bucket_start);

    let mut series: Vec<Candle> = Vec::with_capacity(valid.len());
    for candle in valid {
        match series.last_mut() {
            Some(prev) if prev.bucket_start == candle.bucket_start => *prev = candle,
            _ => series.push(candle),
        }
    }

    let kept = series.len();
    let report = ReconcileReport {
        received,
        discarded,
        duplicates: received - discarded - kept,
        kept,
    };
    (ReconciledSeries(series), report)
}
