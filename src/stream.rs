//! Marketplace activity push stream.
//!
//! Opens the duplex connection, subscribes to every active collection,
//! validates frames and forwards them into the event manager. On
//! disconnect it reconnects with exponential backoff; after the retry
//! cap the client logs `maxRetriesExceeded` and stops. Events that
//! arrive before the ready gate are discarded upstream by design.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::events::EventManager;
use crate::models::RawEvent;
use crate::shutdown::Shutdown;
use crate::stats::inc;

/// Reconnect attempts before giving up.
const MAX_RETRIES: u32 = 5;

/// Subscription frame sent once per active collection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WsSubscribeMessage {
    #[serde(rename = "type")]
    msg_type: String, // "subscribeCollection"
    collection_symbol: String,
}

pub struct PushStreamClient {
    ws_url: String,
    api_key: String,
    collections: Vec<String>,
    events: Arc<EventManager>,
    connected: Arc<AtomicBool>,
    shutdown: Shutdown,
}

impl PushStreamClient {
    pub fn new(
        ws_url: impl Into<String>,
        api_key: impl Into<String>,
        collections: Vec<String>,
        events: Arc<EventManager>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            collections,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// Shared flag surfaced through `/api/stats`.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Run until shutdown or the retry budget is spent.
    pub async fn run(&self) -> Result<()> {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            match self.connect_and_stream().await {
                Ok(()) => {
                    // Graceful close or shutdown; a successful open
                    // resets the backoff.
                    if self.shutdown.is_triggered() {
                        return Ok(());
                    }
                    attempt = 0;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        error!(
                            attempts = attempt - 1,
                            error = %e,
                            "maxRetriesExceeded: giving up on push stream"
                        );
                        bail!("push stream retries exhausted");
                    }
                    let delay = Duration::from_millis(1000u64 << attempt.min(16));
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "stream reconnect");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.wait() => return Ok(()),
                    }
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!("connecting to marketplace push stream");
        let mut request = self
            .ws_url
            .clone()
            .into_client_request()
            .context("failed to build websocket request")?;
        if let Ok(value) = self.api_key.parse() {
            request.headers_mut().insert("X-NFT-API-Key", value);
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .context("failed to connect to push stream")?;
        info!(status = %response.status(), "push stream connected");
        self.connected.store(true, Ordering::SeqCst);

        let result = self.subscribe_and_read(ws_stream).await;
        self.connected.store(false, Ordering::SeqCst);
        result
    }

    async fn subscribe_and_read(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        info!(
            collections = self.collections.len(),
            "subscribing to collection activity"
        );
        for symbol in &self.collections {
            let subscribe = WsSubscribeMessage {
                msg_type: "subscribeCollection".to_string(),
                collection_symbol: symbol.clone(),
            };
            let json = serde_json::to_string(&subscribe)
                .context("failed to serialize subscription")?;
            write
                .send(Message::Text(json))
                .await
                .context("failed to send subscription")?;
        }

        loop {
            let message = tokio::select! {
                message = read.next() => message,
                _ = self.shutdown.wait() => {
                    debug!("closing push stream for shutdown");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            };

            let Some(message) = message else {
                info!("push stream ended, will reconnect");
                return Ok(());
            };

            match message {
                Ok(Message::Text(text)) => self.handle_frame(&text),
                Ok(Message::Ping(payload)) => {
                    write
                        .send(Message::Pong(payload))
                        .await
                        .context("failed to send pong")?;
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    info!(?frame, "push stream closed by server");
                    return Ok(());
                }
                Ok(Message::Binary(data)) => {
                    warn!(bytes = data.len(), "unexpected binary frame");
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(e).context("push stream read error");
                }
            }
        }
    }

    /// Decode one frame. Well-formed frames with a string `kind` and
    /// `collectionSymbol` go to the event manager; everything else is
    /// counted and dropped.
    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<RawEvent>(text) {
            Ok(raw) => self.events.submit_raw(raw),
            Err(e) => {
                // Subscription acks and heartbeats are expected chatter;
                // only count frames that claim to be events.
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                    if value.get("type").is_some() || value.get("subscription").is_some() {
                        debug!("control frame: {}", &text[..text.len().min(120)]);
                        return;
                    }
                }
                inc(&self.events.stats().invalid_frames);
                debug!(error = %e, "invalid push frame dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::EventStats;
    use crate::wallets::file::WalletsFile;
    use crate::wallets::WalletSelector;
    use std::collections::HashSet;

    fn client() -> PushStreamClient {
        let file: WalletsFile = serde_json::from_str(
            r#"{"wallets": [
                {"label": "w0", "wif": "k", "paymentAddress": "bc1q-ours", "receiveAddress": "bc1p-ours"}
            ]}"#,
        )
        .unwrap();
        let wallets =
            Arc::new(WalletSelector::from_file(file, 10, Shutdown::new()).unwrap());
        let collections: HashSet<String> = ["frogs".to_string()].into_iter().collect();
        let events = Arc::new(EventManager::new(
            collections,
            wallets,
            Arc::new(EventStats::default()),
        ));
        events.set_ready();
        PushStreamClient::new(
            "wss://example.invalid/ws",
            "test-key",
            vec!["frogs".to_string()],
            events,
            Shutdown::new(),
        )
    }

    #[test]
    fn test_valid_frame_is_forwarded() {
        let client = client();
        client.handle_frame(
            r#"{"kind": "offer_placed", "collectionSymbol": "frogs", "tokenId": "t1", "listedPrice": 1000}"#,
        );
        assert_eq!(client.events.queue_len(), 1);
    }

    #[test]
    fn test_invalid_frame_is_counted() {
        let client = client();
        client.handle_frame("not json at all");
        client.handle_frame(r#"{"somethingElse": true}"#);
        assert_eq!(client.events.stats().snapshot().invalid_frames, 2);
        assert_eq!(client.events.queue_len(), 0);
    }

    #[test]
    fn test_control_frames_are_tolerated() {
        let client = client();
        client.handle_frame(r#"{"type": "subscribed", "subscription": "sub_1"}"#);
        assert_eq!(client.events.stats().snapshot().invalid_frames, 0);
        assert_eq!(client.events.queue_len(), 0);
    }

    #[test]
    fn test_subscribe_message_shape() {
        let msg = WsSubscribeMessage {
            msg_type: "subscribeCollection".to_string(),
            collection_symbol: "frogs".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("subscribeCollection"));
        assert!(json.contains("collectionSymbol"));
    }
}
