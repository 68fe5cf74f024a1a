use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// Stable identifier of a mempool feed ("fiber", "bloxroute", "web3", ...).
pub type SourceName = SmolStr;

/// Hex-encoded transaction hash, compared by exact string equality.
pub type TxHash = String;

/// A matched pair of observations of the same transaction across two feeds.
///
/// `diff_us` is always `reference_ts - secondary_ts` in microseconds,
/// whichever side detected the match: positive means the secondary feed saw
/// the transaction before the reference did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collision {
    pub winner: SourceName,
    pub loser: SourceName,
    pub diff_us: i64,
    pub hash: TxHash,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed not connected: {0}")]
    NotConnected(SourceName),
    #[error("feed disconnected: {0}")]
    Disconnected(String),
}

pub type DynStream<T> = BoxStream<'static, Result<T>>;

/// A live pending-transaction feed. The delivered stream carries no ordering
/// or deduplication guarantee; consumers must tolerate duplicate hashes.
#[async_trait]
pub trait MempoolFeed: Send + Sync {
    fn name(&self) -> SourceName;

    /// Establish the upstream connection, bounded by `timeout`.
    async fn connect(&self, timeout: Duration) -> Result<()>;

    /// Subscribe to pending transaction hashes on an established connection.
    async fn subscribe_pending_txs(&self) -> Result<DynStream<TxHash>>;
}
