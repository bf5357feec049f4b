// =============================================================================
// Ingest error taxonomy
// =============================================================================
//
// Every variant is non-fatal: the event that produced it is dropped and the
// candle store is left exactly as it was before the event arrived.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    /// Raw frame could not be parsed or carried unusable values.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Observation belongs to a bucket older than the live one.
    #[error("out-of-order observation for bucket {bucket_start} (live bucket {last_bucket_start})")]
    OutOfOrderTick {
        bucket_start: i64,
        last_bucket_start: i64,
    },

    /// Observation is more than one bucket ahead of the live one. Only a
    /// backfill or a kline may open that bucket.
    #[error("tick for bucket {bucket_start} skips ahead of live bucket {last_bucket_start}")]
    TickGap {
        bucket_start: i64,
        last_bucket_start: i64,
    },

    /// Frame was produced for a context that has since been replaced.
    #[error("frame tagged for generation {tagged} but current generation is {current}")]
    ContextMismatch { tagged: u64, current: u64 },

    /// Ordering invariant broken. The offending entry has been discarded.
    #[error("store invariant violated at bucket {bucket_start}: {detail}")]
    StoreInvariantViolation { bucket_start: i64, detail: String },
}

impl IngestError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedEvent(detail.into())
    }
}
