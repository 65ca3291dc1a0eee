//! Websocket price feed client.

use super::types::{RawPriceUpdate, SourceId};
use crate::risk::OperatorAlert;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Frame payload: a single update or a batch.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum Frame {
    Batch(Vec<RawPriceUpdate>),
    Single(RawPriceUpdate),
}

/// Parse a text frame into raw updates, stamping `default_source` where the
/// update names none.
pub fn parse_frame(text: &str, default_source: &str) -> Result<Vec<RawPriceUpdate>> {
    let frame: Frame = serde_json::from_str(text).context("Invalid feed frame")?;
    let mut updates = match frame {
        Frame::Batch(updates) => updates,
        Frame::Single(update) => vec![update],
    };
    for update in &mut updates {
        if update.source.is_none() {
            update.source = Some(default_source.to_string());
        }
    }
    Ok(updates)
}

/// Connection to one marketplace price feed.
///
/// Forwards raw updates into a channel and reconnects with exponential
/// backoff when the connection drops.
pub struct FeedConnection {
    source: String,
    url: String,
}

impl FeedConnection {
    pub fn new(source: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            url: url.into(),
        }
    }

    /// Stream updates into `tx` until the receiver is dropped.
    pub async fn run(self, tx: mpsc::Sender<RawPriceUpdate>) {
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            match self.stream_once(&tx).await {
                Ok(()) if tx.is_closed() => {
                    info!(source = %self.source, "Feed receiver dropped, stopping");
                    return;
                }
                Ok(()) => {
                    // Connection was healthy before it closed
                    delay = INITIAL_RECONNECT_DELAY;
                }
                Err(e) => {
                    error!(source = %self.source, error = %e, "Feed connection failed");
                }
            }

            OperatorAlert::feed_disconnect(
                &SourceId::new(self.source.as_str()),
                delay.as_millis() as u64,
            )
            .emit();
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    /// One connection lifetime. Returns `Ok` when the server closes cleanly.
    async fn stream_once(&self, tx: &mpsc::Sender<RawPriceUpdate>) -> Result<()> {
        info!(source = %self.source, url = %self.url, "Connecting to price feed");

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .context("Failed to connect to WebSocket")?;
        let (_write, mut read) = ws_stream.split();

        info!(source = %self.source, "Price feed connected");

        while let Some(msg) = read.next().await {
            match msg.context("WebSocket error")? {
                Message::Text(text) => match parse_frame(text.as_str(), &self.source) {
                    Ok(updates) => {
                        for update in updates {
                            if tx.send(update).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(source = %self.source, error = %e, "Dropping unparseable frame")
                    }
                },
                Message::Ping(_) => {
                    debug!(source = %self.source, "Received ping");
                    // Pong is handled automatically by tungstenite
                }
                Message::Close(frame) => {
                    info!(source = %self.source, ?frame, "WebSocket closed by server");
                    return Ok(());
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::RawItemRef;

    #[test]
    fn test_parse_single_update_stamps_source() {
        let updates = parse_frame(
            r#"{"item":"5021;6","side":"sell","price":58.33,"timestamp":1,"sequence":1}"#,
            "backpack.tf",
        )
        .unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].source.as_deref(), Some("backpack.tf"));
        assert_eq!(updates[0].item, Some(RawItemRef::Sku("5021;6".into())));
    }

    #[test]
    fn test_parse_batch_keeps_explicit_source() {
        let updates = parse_frame(
            r#"[{"source":"scrap.tf","item":"5021;6"},{"item":"5002;6"}]"#,
            "backpack.tf",
        )
        .unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].source.as_deref(), Some("scrap.tf"));
        assert_eq!(updates[1].source.as_deref(), Some("backpack.tf"));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_frame("not json", "backpack.tf").is_err());
    }
}
