use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::IngestError;
use crate::market_data::reconciler::ReconciledSeries;
use crate::types::Interval;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One fixed-width OHLC bucket. Serialised in the shape chart renderers expect
/// (`{time, open, high, low, close}`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(rename = "time")]
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// A single-price candle, the shape every tick-opened bucket starts with.
    pub fn flat(bucket_start: i64, price: f64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// `low <= min(open, close) <= max(open, close) <= high`, with every
    /// price finite and positive.
    pub fn is_consistent(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if !prices.iter().all(|p| p.is_finite() && *p > 0.0) {
            return false;
        }
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high
    }

    fn absorb(&mut self, price: f64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
    }
}

/// What a tick did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// First candle of an empty store.
    Opened,
    /// Merged into the live bucket.
    Merged,
    /// Opened the bucket immediately after the live one.
    Rolled,
}

/// What an authoritative kline bar did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarOutcome {
    Appended,
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

// ---------------------------------------------------------------------------
// CandleStore -- ordered buckets for one (symbol, interval, market) context
// ---------------------------------------------------------------------------

/// Ordered candle series with strictly increasing, unique `bucket_start`.
///
/// Every mutating operation either keeps both properties or is rejected
/// without touching the series. When `max_candles` is exceeded the oldest
/// buckets are dropped from the front, which cannot break ordering.
#[derive(Debug, Clone)]
pub struct CandleStore {
    interval: Interval,
    candles: Vec<Candle>,
    max_candles: usize,
}

impl CandleStore {
    pub fn new(interval: Interval, max_candles: usize) -> Self {
        Self {
            interval,
            candles: Vec::new(),
            max_candles: max_candles.max(1),
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Read-only view of the full ordered series.
    pub fn snapshot(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// The next new bucket would evict the oldest one.
    pub fn is_full(&self) -> bool {
        self.candles.len() >= self.max_candles
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }

    /// Fold one price observation into the tail of the series.
    ///
    /// `observed_bucket_start` must already be floored to the store's
    /// interval; the aggregator does that so ticks and rolls share the same
    /// bucket arithmetic.
    pub fn fold_tick_into_last(
        &mut self,
        price: f64,
        observed_bucket_start: i64,
    ) -> Result<FoldOutcome, IngestError> {
        check_price(price)?;
        self.check_aligned(observed_bucket_start)?;

        let interval_len = self.interval.seconds();
        let Some(last) = self.candles.last_mut() else {
            self.candles.push(Candle::flat(observed_bucket_start, price));
            return Ok(FoldOutcome::Opened);
        };

        let last_bucket_start = last.bucket_start;
        if observed_bucket_start < last_bucket_start {
            return Err(IngestError::OutOfOrderTick {
                bucket_start: observed_bucket_start,
                last_bucket_start,
            });
        }
        if observed_bucket_start == last_bucket_start {
            last.absorb(price);
            return Ok(FoldOutcome::Merged);
        }
        if observed_bucket_start == last_bucket_start + interval_len {
            self.push_tail(Candle::flat(observed_bucket_start, price))?;
            return Ok(FoldOutcome::Rolled);
        }
        Err(IngestError::TickGap {
            bucket_start: observed_bucket_start,
            last_bucket_start,
        })
    }

    /// Apply a full OHLC bar from the exchange's kline feed.
    ///
    /// The bar replaces the live bucket or opens any later one; closed
    /// buckets are left to backfill.
    pub fn append_bar(&mut self, bar: Candle) -> Result<BarOutcome, IngestError> {
        self.check_candle(&bar)?;
        let Some(last) = self.candles.last_mut() else {
            self.candles.push(bar);
            return Ok(BarOutcome::Appended);
        };

        if bar.bucket_start < last.bucket_start {
            return Err(IngestError::OutOfOrderTick {
                bucket_start: bar.bucket_start,
                last_bucket_start: last.bucket_start,
            });
        }
        if bar.bucket_start == last.bucket_start {
            *last = bar;
            return Ok(BarOutcome::Replaced);
        }
        self.push_tail(bar)?;
        Ok(BarOutcome::Appended)
    }

    /// Insert a bucket in order, or overwrite an existing bucket's OHLC
    /// wholesale. O(1) at the tail, O(log n) search otherwise.
    pub fn upsert_bucket(&mut self, candle: Candle) -> Result<UpsertOutcome, IngestError> {
        self.check_candle(&candle)?;

        if let Some(last) = self.candles.last_mut() {
            if candle.bucket_start == last.bucket_start {
                *last = candle;
                return Ok(UpsertOutcome::Replaced);
            }
            if candle.bucket_start > last.bucket_start {
                self.push_tail(candle)?;
                return Ok(UpsertOutcome::Inserted);
            }
        }

        match self
            .candles
            .binary_search_by_key(&candle.bucket_start, |c| c.bucket_start)
        {
            Ok(idx) => {
                self.candles[idx] = candle;
                Ok(UpsertOutcome::Replaced)
            }
            Err(idx) => {
                self.candles.insert(idx, candle);
                self.verify_at(idx)?;
                self.enforce_cap();
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    /// Swap the whole series for a reconciled backfill. Only the keep-newest
    /// tail of `max_candles` buckets is retained.
    pub fn replace(&mut self, series: &ReconciledSeries) -> usize {
        let skip = series.len().saturating_sub(self.max_candles);
        self.clear();
        // Ascending input, so every upsert lands on the tail.
        for candle in &series.candles()[skip..] {
            if let Err(e) = self.upsert_bucket(*candle) {
                error!(error = %e, "reconciled entry rejected by candle store");
            }
        }
        self.candles.len()
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn check_aligned(&self, bucket_start: i64) -> Result<(), IngestError> {
        if self.interval.is_aligned(bucket_start) {
            Ok(())
        } else {
            Err(IngestError::malformed(format!(
                "bucket {bucket_start} is not aligned to {}",
                self.interval
            )))
        }
    }

    fn check_candle(&self, candle: &Candle) -> Result<(), IngestError> {
        self.check_aligned(candle.bucket_start)?;
        if candle.is_consistent() {
            Ok(())
        } else {
            Err(IngestError::malformed(format!(
                "inconsistent OHLC for bucket {}",
                candle.bucket_start
            )))
        }
    }

    fn push_tail(&mut self, candle: Candle) -> Result<(), IngestError> {
        self.candles.push(candle);
        let idx = self.candles.len() - 1;
        self.verify_at(idx)?;
        self.enforce_cap();
        Ok(())
    }

    /// Check the entry at `idx` against its neighbours. On a violation the
    /// entry is removed again; debug builds panic instead.
    fn verify_at(&mut self, idx: usize) -> Result<(), IngestError> {
        let current = self.candles[idx].bucket_start;
        let before_ok = idx == 0 || self.candles[idx - 1].bucket_start < current;
        let after_ok = self
            .candles
            .get(idx + 1)
            .map_or(true, |next| current < next.bucket_start);
        if before_ok && after_ok {
            return Ok(());
        }

        debug_assert!(false, "candle store ordering violated at bucket {current}");
        self.candles.remove(idx);
        error!(bucket_start = current, "candle store ordering violated -- entry discarded");
        Err(IngestError::StoreInvariantViolation {
            bucket_start: current,
            detail: "bucket out of order with its neighbours".into(),
        })
    }

    fn enforce_cap(&mut self) {
        if self.candles.len() > self.max_candles {
            let excess = self.candles.len() - self.max_candles;
            self.candles.drain(..excess);
        }
    }
}

fn check_price(price: f64) -> Result<(), IngestError> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(IngestError::malformed(format!("unusable price {price}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
