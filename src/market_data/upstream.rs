// =============================================================================
// Upstream Stream — WebSocket connection to the market-data relay
// =============================================================================
//
// One connection per context. Every text frame is forwarded to the feed engine
// tagged with the generation it was opened for, so frames still in flight
// after a context reset are recognised as stale. The supervisor reconnects
// forever: immediately after a context change, after `reconnect_delay`
// otherwise.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::engine::runner::FeedSignal;
use crate::types::ContextKey;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// e.g. `ws://localhost:8000`
    pub base: String,
    pub exchange: String,
    pub reconnect_delay: Duration,
}

/// `{base}/ws/ticker/{exchange}/{SYMBOL}/{interval}/{market}`
pub fn stream_url(base: &str, exchange: &str, key: &ContextKey) -> String {
    format!(
        "{}/ws/ticker/{}/{}/{}/{}",
        base.trim_end_matches('/'),
        exchange,
        key.stream_symbol(),
        key.interval,
        key.market_type
    )
}

/// Why a single connection ended.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    /// The relay closed the stream.
    Ended,
    /// The engine switched context; reconnect for the new one right away.
    ContextChanged,
    /// The engine (or the action queue owner) is gone; stop for good.
    Shutdown,
}

/// Reconnect loop. Returns once the engine side of any channel is dropped.
pub async fn run_upstream(
    config: UpstreamConfig,
    mut context_rx: watch::Receiver<ContextKey>,
    feed_tx: mpsc::Sender<FeedSignal>,
    mut actions: mpsc::Receiver<serde_json::Value>,
) {
    loop {
        let key = context_rx.borrow_and_update().clone();
        let generation = key.generation;

        let reason = match run_connection(&config, &key, &mut context_rx, &feed_tx, &mut actions)
            .await
        {
            Ok(Exit::Shutdown) => {
                info!("upstream supervisor stopping -- engine gone");
                return;
            }
            Ok(Exit::ContextChanged) => continue,
            Ok(Exit::Ended) => "stream ended".to_string(),
            Err(e) => {
                error!(context = %key, error = %e, "upstream connection failed");
                format!("{e:#}")
            }
        };

        if feed_tx
            .send(FeedSignal::Disconnected { generation, reason })
            .await
            .is_err()
        {
            return;
        }

        // Wait out the delay, but a context change cuts it short.
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            changed = context_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn run_connection(
    config: &UpstreamConfig,
    key: &ContextKey,
    context_rx: &mut watch::Receiver<ContextKey>,
    feed_tx: &mpsc::Sender<FeedSignal>,
    actions: &mut mpsc::Receiver<serde_json::Value>,
) -> Result<Exit> {
    let generation = key.generation;
    let url = stream_url(&config.base, &config.exchange, key);
    info!(url = %url, context = %key, "connecting to upstream WebSocket");

    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .context("failed to connect to upstream WebSocket")?;

    info!(context = %key, "upstream WebSocket connected");
    if feed_tx.send(FeedSignal::Connected { generation }).await.is_err() {
        return Ok(Exit::Shutdown);
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if feed_tx.send(FeedSignal::Frame { generation, text }).await.is_err() {
                        return Ok(Exit::Shutdown);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(context = %key, frame = ?frame, "upstream sent close");
                    return Ok(Exit::Ended);
                }
                // tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("upstream WebSocket read error"),
                None => {
                    warn!(context = %key, "upstream WebSocket stream ended");
                    return Ok(Exit::Ended);
                }
            },
            changed = context_rx.changed() => {
                if changed.is_err() {
                    return Ok(Exit::Shutdown);
                }
                if context_rx.borrow().generation != generation {
                    info!(context = %key, "context changed -- closing upstream connection");
                    let _ = write.close().await;
                    return Ok(Exit::ContextChanged);
                }
            }
            action = actions.recv() => match action {
                Some(action) => {
                    debug!(action = %action, "relaying action upstream");
                    write
                        .send(Message::Text(action.to_string()))
                        .await
                        .context("failed to relay action upstream")?;
                }
                None => return Ok(Exit::Shutdown),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Interval, MarketType};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn key(generation: u64) -> ContextKey {
        ContextKey {
            symbol: "BTC/USDT".into(),
            interval: Interval::FifteenMinutes,
            market_type: MarketType::Future,
            generation,
        }
    }

    #[test]
    fn url_uses_stream_symbol_and_codes() {
        assert_eq!(
            stream_url("ws://localhost:8000/", "binance", &key(1)),
            "ws://localhost:8000/ws/ticker/binance/BTCUSDT/15m/future"
        );
    }

    #[tokio::test]
    async fn frames_are_tagged_and_actions_relayed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"type":"trade","price":1,"time":60}"#.into()))
                .await
                .unwrap();
            // Echo back the first relayed action, then hang up.
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {other:?}"),
                }
            }
        });

        let (context_tx, context_rx) = watch::channel(key(7));
        let (feed_tx, mut feed_rx) = mpsc::channel(8);
        let (action_tx, action_rx) = mpsc::channel(8);
        let config = UpstreamConfig {
            base: format!("ws://{addr}"),
            exchange: "binance".into(),
            reconnect_delay: Duration::from_secs(60),
        };
        let supervisor = tokio::spawn(run_upstream(config, context_rx, feed_tx, action_rx));

        assert!(matches!(
            feed_rx.recv().await,
            Some(FeedSignal::Connected { generation: 7 })
        ));
        match feed_rx.recv().await {
            Some(FeedSignal::Frame { generation, text }) => {
                assert_eq!(generation, 7);
                assert!(text.contains("trade"));
            }
            other => panic!("unexpected {other:?}"),
        }

        action_tx
            .send(serde_json::json!({"action": "stop_strategy"}))
            .await
            .unwrap();
        let relayed = server.await.unwrap();
        assert_eq!(relayed, r#"{"action":"stop_strategy"}"#);

        drop(context_tx);
        drop(feed_rx);
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn context_change_reconnects_to_new_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (path_tx, mut path_rx) = mpsc::unbounded_channel();

        // Record each handshake path and keep every socket open.
        let server = tokio::spawn(async move {
            let mut open = Vec::new();
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                let path_tx = path_tx.clone();
                let ws = tokio_tungstenite::accept_hdr_async(
                    tcp,
                    move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let _ = path_tx.send(req.uri().path().to_string());
                        Ok(resp)
                    },
                )
                .await
                .unwrap();
                open.push(ws);
            }
        });

        let (context_tx, context_rx) = watch::channel(key(1));
        let (feed_tx, mut feed_rx) = mpsc::channel(8);
        let (_action_tx, action_rx) = mpsc::channel(8);
        let config = UpstreamConfig {
            base: format!("ws://{addr}"),
            exchange: "binance".into(),
            reconnect_delay: Duration::from_secs(60),
        };
        let supervisor = tokio::spawn(run_upstream(config, context_rx, feed_tx, action_rx));

        assert!(matches!(
            feed_rx.recv().await,
            Some(FeedSignal::Connected { generation: 1 })
        ));
        assert_eq!(
            path_rx.recv().await.unwrap(),
            "/ws/ticker/binance/BTCUSDT/15m/future"
        );

        context_tx
            .send(ContextKey {
                interval: Interval::OneHour,
                market_type: MarketType::Spot,
                generation: 2,
                ..key(1)
            })
            .unwrap();

        // No reconnect delay and no disconnect report for a context switch.
        assert!(matches!(
            feed_rx.recv().await,
            Some(FeedSignal::Connected { generation: 2 })
        ));
        assert_eq!(
            path_rx.recv().await.unwrap(),
            "/ws/ticker/binance/BTCUSDT/1h/spot"
        );

        drop(context_tx);
        supervisor.await.unwrap();
        server.abort();
    }
}
