use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{DynStream, FeedError, MempoolFeed, SourceName, TxHash};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STREAM_BUFFER: usize = 512;
const SUBSCRIBE_REQ: &str =
    r#"{"id": 1, "method": "subscribe", "params": ["newTxs", {"include": ["tx_hash"]}]}"#;

/// bloXroute cloud-API `newTxs` stream, authenticated per connection with
/// the account's authorization header.
pub struct BloxrouteFeed {
    name: SourceName,
    endpoint: String,
    api_key: String,
    conn: Mutex<Option<WsStream>>,
}

impl BloxrouteFeed {
    pub fn new(name: SourceName, endpoint: String, api_key: String) -> Self {
        Self {
            name,
            endpoint,
            api_key,
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MempoolFeed for BloxrouteFeed {
    fn name(&self) -> SourceName {
        self.name.clone()
    }

    async fn connect(&self, connect_timeout: Duration) -> Result<()> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .with_context(|| format!("bad bloxroute endpoint: {}", self.endpoint))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&self.api_key).context("bloxroute api key is not header-safe")?,
        );

        let (ws, _) = timeout(connect_timeout, connect_async(request))
            .await
            .with_context(|| format!("connect to {} timed out", self.endpoint))?
            .with_context(|| format!("connect bloxroute ws: {}", self.endpoint))?;
        *self.conn.lock().await = Some(ws);
        Ok(())
    }

    async fn subscribe_pending_txs(&self) -> Result<DynStream<TxHash>> {
        let mut ws = self
            .conn
            .lock()
            .await
            .take()
            .ok_or_else(|| FeedError::NotConnected(self.name.clone()))?;
        ws.send(Message::text(SUBSCRIBE_REQ))
            .await
            .context("send newTxs subscription request")?;

        let (tx, rx) = mpsc::channel::<Result<TxHash>>(STREAM_BUFFER);
        let source = self.name.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(err) => {
                        let _ = tx
                            .send(Err(FeedError::Disconnected(err.to_string()).into()))
                            .await;
                        return;
                    }
                };
                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                    Message::Ping(v) => {
                        let _ = ws.send(Message::Pong(v)).await;
                        continue;
                    }
                    Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        tracing::debug!(%source, "bloxroute ws closed by server");
                        break;
                    }
                };
                let Some(hash) = parse_new_tx_frame(&text) else {
                    continue;
                };
                if tx.send(Ok(hash)).await.is_err() {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Extract `params.result.txHash` from a `newTxs` notification.
fn parse_new_tx_frame(text: &str) -> Option<TxHash> {
    let payload = serde_json::from_str::<Value>(text).ok()?;
    payload
        .get("params")?
        .get("result")?
        .get("txHash")?
        .as_str()
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new_tx_notifications() {
        let frame = r#"{"method":"subscribe","params":{"subscription":"abc","result":{"txHash":"0x1dfcf2","txContents":{}}}}"#;
        assert_eq!(parse_new_tx_frame(frame).as_deref(), Some("0x1dfcf2"));
    }

    #[test]
    fn ignores_subscription_acks() {
        assert!(parse_new_tx_frame(r#"{"id":1,"result":"abc"}"#).is_none());
        assert!(parse_new_tx_frame(r#"{"params":{"result":{}}}"#).is_none());
    }
}
