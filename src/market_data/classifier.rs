// =============================================================================
// Event Classifier — raw upstream frames into a closed set of event kinds
// =============================================================================
//
// Classification is structural: it looks at which fields are present and what
// JSON type they have, never at their values. Nothing downstream of this
// module inspects raw JSON.
// =============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::error::IngestError;
use crate::market_data::candle_store::Candle;
use crate::types::Severity;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// A single price observation, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub price: f64,
    pub time: i64,
}

/// Trading-signal notice that can ride along a control message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalNotice {
    pub signal: String,
    pub price: Option<f64>,
    pub tp: Option<f64>,
    pub sl: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlMessage {
    pub text: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalNotice>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Historical backfill. `skipped` counts entries missing a field.
    HistoryBatch { entries: Vec<Candle>, skipped: usize },
    Trade(Tick),
    /// Periodic ticker snapshot; folded exactly like a trade.
    SnapshotTick(Tick),
    /// Full OHLC for one bucket from the exchange's kline feed.
    Bar(Candle),
    Control(ControlMessage),
    Unrecognized,
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HistoryBatch { .. } => "history",
            Self::Trade(_) => "trade",
            Self::SnapshotTick(_) => "snapshot",
            Self::Bar(_) => "kline",
            Self::Control(_) => "control",
            Self::Unrecognized => "unrecognized",
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Decode a raw text frame and classify it.
///
/// Only a frame that is not JSON at all is an error; any JSON value that does
/// not match a known shape is [`StreamEvent::Unrecognized`].
pub fn parse_frame(text: &str) -> Result<StreamEvent, IngestError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| IngestError::malformed(format!("frame is not JSON: {e}")))?;
    Ok(classify(&value))
}

/// Map one decoded message onto exactly one [`StreamEvent`].
///
/// Precedence: `log` > `type:"history"` > `type:"trade"` > `type:"kline"` >
/// bare `price`+`time`.
pub fn classify(value: &Value) -> StreamEvent {
    let Some(obj) = value.as_object() else {
        return StreamEvent::Unrecognized;
    };
    let kind = obj.get("type").and_then(Value::as_str);

    if let Some(text) = obj.get("log").and_then(Value::as_str) {
        return StreamEvent::Control(control_message(text, kind, value));
    }

    match kind {
        Some("history") => {
            if let Some(data) = obj.get("data").and_then(Value::as_array) {
                return history_batch(data);
            }
            StreamEvent::Unrecognized
        }
        Some("trade") => tick(value).map_or(StreamEvent::Unrecognized, StreamEvent::Trade),
        Some("kline") => match ohlc(value) {
            Some(candle) => StreamEvent::Bar(candle),
            None => tick(value).map_or(StreamEvent::Unrecognized, StreamEvent::SnapshotTick),
        },
        _ => tick(value).map_or(StreamEvent::Unrecognized, StreamEvent::SnapshotTick),
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Upstream sends numbers either as JSON numbers or as numeric strings.
fn number(val: Option<&Value>) -> Option<f64> {
    let n = match val? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Times may carry a fractional part (milliseconds / 1000); floor to seconds.
fn seconds(val: Option<&Value>) -> Option<i64> {
    let t = number(val)?.floor();
    // Anything beyond this is not a plausible unix-seconds stamp.
    (t.abs() < 1e13).then_some(t as i64)
}

fn tick(value: &Value) -> Option<Tick> {
    Some(Tick {
        price: number(value.get("price"))?,
        time: seconds(value.get("time"))?,
    })
}

fn ohlc(value: &Value) -> Option<Candle> {
    Some(Candle {
        bucket_start: seconds(value.get("time"))?,
        open: number(value.get("open"))?,
        high: number(value.get("high"))?,
        low: number(value.get("low"))?,
        close: number(value.get("close"))?,
    })
}

fn history_batch(data: &[Value]) -> StreamEvent {
    let entries: Vec<Candle> = data.iter().filter_map(ohlc).collect();
    let skipped = data.len() - entries.len();
    StreamEvent::HistoryBatch { entries, skipped }
}

fn control_message(text: &str, kind: Option<&str>, value: &Value) -> ControlMessage {
    let signal = value
        .get("signal")
        .and_then(Value::as_str)
        .map(|signal| SignalNotice {
            signal: signal.to_string(),
            price: number(value.get("price")),
            tp: number(value.get("tp")),
            sl: number(value.get("sl")),
        });

    ControlMessage {
        text: text.to_string(),
        severity: Severity::from_wire(kind),
        signal,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_batch_is_recognised() {
        let msg = json!({
            "type": "history",
            "symbol": "BTC/USDT",
            "data": [
                {"time": 60, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "vol": 3.0},
                {"time": 120, "open": "1.5", "high": "2.5", "low": "1.0", "close": "2.0"},
                {"time": 180, "open": 2.0}
            ]
        });
        match classify(&msg) {
            StreamEvent::HistoryBatch { entries, skipped } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(skipped, 1);
                assert_eq!(entries[1].close, 2.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn trade_floors_fractional_time() {
        let msg = json!({"type": "trade", "price": 37000.5, "time": 1700000000.987});
        assert_eq!(
            classify(&msg),
            StreamEvent::Trade(Tick {
                price: 37000.5,
                time: 1_700_000_000
            })
        );
    }

    #[test]
    fn untyped_price_is_snapshot() {
        let msg = json!({"price": 10.0, "time": 125, "high": 99.0, "timeframe": "1m"});
        assert_eq!(
            classify(&msg),
            StreamEvent::SnapshotTick(Tick {
                price: 10.0,
                time: 125
            })
        );
    }

    #[test]
    fn kline_with_ohlc_is_bar() {
        let msg = json!({
            "type": "kline", "time": 120, "open": 1.0, "high": 3.0,
            "low": 0.5, "close": 2.0, "price": 2.0, "vol": 10.0
        });
        assert!(matches!(classify(&msg), StreamEvent::Bar(c) if c.bucket_start == 120));
    }

    #[test]
    fn kline_without_ohlc_degrades_to_snapshot() {
        let msg = json!({"type": "kline", "time": 120, "price": 2.0});
        assert!(matches!(classify(&msg), StreamEvent::SnapshotTick(_)));
    }

    #[test]
    fn log_takes_precedence() {
        let msg = json!({
            "log": "signal fired", "type": "success",
            "signal": "long", "price": 100.0, "tp": 101.5, "sl": "99"
        });
        match classify(&msg) {
            StreamEvent::Control(c) => {
                assert_eq!(c.severity, Severity::Success);
                let signal = c.signal.unwrap();
                assert_eq!(signal.signal, "long");
                assert_eq!(signal.sl, Some(99.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn log_without_type_is_info() {
        let msg = json!({"log": "hello"});
        assert!(matches!(
            classify(&msg),
            StreamEvent::Control(ControlMessage { severity: Severity::Info, .. })
        ));
    }

    #[test]
    fn odd_shapes_are_unrecognized() {
        for msg in [
            json!([1, 2, 3]),
            json!("text"),
            json!({"type": "trade", "price": 1.0}),
            json!({"type": "history", "data": "nope"}),
            json!({"price": true, "time": 1}),
            json!({}),
        ] {
            assert_eq!(classify(&msg), StreamEvent::Unrecognized, "{msg}");
        }
    }

    #[test]
    fn non_json_frame_is_malformed() {
        assert!(matches!(
            parse_frame("not json"),
            Err(IngestError::MalformedEvent(_))
        ));
        assert!(matches!(parse_frame("{}"), Ok(StreamEvent::Unrecognized)));
    }
}
