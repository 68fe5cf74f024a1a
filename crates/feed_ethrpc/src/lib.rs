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
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STREAM_BUFFER: usize = 512;
const SUBSCRIBE_REQ: &str =
    r#"{"id": 1, "method": "eth_subscribe", "params": ["newPendingTransactions"]}"#;

/// Pending-transaction feed over a standard Ethereum JSON-RPC websocket
/// (Infura, Alchemy, a local geth, ...).
pub struct EthRpcFeed {
    name: SourceName,
    endpoint: String,
    conn: Mutex<Option<WsStream>>,
}

impl EthRpcFeed {
    pub fn new(name: SourceName, endpoint: String) -> Self {
        Self {
            name,
            endpoint,
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MempoolFeed for EthRpcFeed {
    fn name(&self) -> SourceName {
        self.name.clone()
    }

    async fn connect(&self, connect_timeout: Duration) -> Result<()> {
        let (ws, _) = timeout(connect_timeout, connect_async(self.endpoint.as_str()))
            .await
            .with_context(|| format!("connect to {} timed out", self.endpoint))?
            .with_context(|| format!("connect eth rpc ws: {}", self.endpoint))?;
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
            .context("send eth_subscribe request")?;

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
                        tracing::debug!(%source, "eth rpc ws closed by server");
                        break;
                    }
                };
                let Some(hash) = parse_subscription_frame(&text) else {
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

/// Extract the hash from an `eth_subscription` notification. Request acks
/// and unrelated frames yield nothing.
fn parse_subscription_frame(text: &str) -> Option<TxHash> {
    let payload = serde_json::from_str::<Value>(text).ok()?;
    payload
        .get("params")?
        .get("result")?
        .as_str()
        .map(ToOwned::to_owned)
}
