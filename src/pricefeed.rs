//! Live price tick intake. Connects to the external feed over WebSocket and
//! rebroadcasts ticks through the notifier; the mention stream never waits on
//! this and vice versa.

use crate::notifier::ChangeNotifier;
use crate::types::OutboundEvent;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct RawTick {
    symbol: String,
    price: f64,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Runs forever; reconnects with a fixed delay whenever the feed drops.
pub async fn run_price_feed(url: String, notifier: Arc<ChangeNotifier>) {
    loop {
        match connect_async(&url).await {
            Ok((socket, _)) => {
                info!("[PriceFeed] Connected to {}", url);
                let (_, mut read) = socket.split();
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Ok(tick) = serde_json::from_str::<RawTick>(&text) {
                                notifier.publish(OutboundEvent::PriceTick {
                                    symbol: tick.symbol.trim().to_ascii_uppercase(),
                                    price: tick.price,
                                    timestamp: tick
                                        .timestamp
                                        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
                                });
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            warn!("[PriceFeed] Stream error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
                warn!("[PriceFeed] Disconnected, reconnecting in {:?}", RECONNECT_DELAY);
            }
            Err(e) => {
                warn!(
                    "[PriceFeed] Connect to {} failed: {} (retry in {:?})",
                    url, e, RECONNECT_DELAY
                );
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
