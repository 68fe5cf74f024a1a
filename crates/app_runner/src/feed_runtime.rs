use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use collision_engine::CollisionDetector;
use core_types::{Collision, MempoolFeed};
use futures::StreamExt;
use latency_aggregator::{OutlierFilter, PairTally};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config_loader::{SourceConfig, SourceKind};

/// Detector-to-aggregator queue. A full queue blocks the producing source
/// task rather than dropping; the arrival caches are the only place this
/// system sheds data.
pub(super) const COLLISION_QUEUE_CAP: usize = 128;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(32);

pub(super) fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

pub(super) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

pub(super) fn build_feed(cfg: &SourceConfig) -> Result<Arc<dyn MempoolFeed>> {
    let name = SmolStr::new(&cfg.name);
    Ok(match cfg.kind {
        SourceKind::Ethrpc => Arc::new(feed_ethrpc::EthRpcFeed::new(name, cfg.endpoint.clone())),
        SourceKind::Bloxroute => {
            let key = cfg
                .resolved_api_key()?
                .with_context(|| format!("source {} has no api key", cfg.name))?;
            Arc::new(feed_bloxroute::BloxrouteFeed::new(
                name,
                cfg.endpoint.clone(),
                key,
            ))
        }
        SourceKind::Fiber => {
            let key = cfg
                .resolved_api_key()?
                .with_context(|| format!("source {} has no api key", cfg.name))?;
            Arc::new(feed_fiber::FiberFeed::new(name, cfg.endpoint.clone(), key))
        }
    })
}

enum StreamExit {
    Cancelled,
    Disconnected,
}

/// Supervise one source for the process lifetime: connect, subscribe, pump
/// hashes through the detector, and on any failure back off and reconnect.
/// Failures never escape the task; other sources keep running.
pub(super) fn spawn_source_task(
    feed: Arc<dyn MempoolFeed>,
    detector: Arc<CollisionDetector>,
    collisions: mpsc::Sender<Collision>,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let source = feed.name();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let failed = match run_source_once(
                feed.as_ref(),
                &detector,
                &collisions,
                connect_timeout,
                &cancel,
            )
            .await
            {
                Ok(StreamExit::Cancelled) => break,
                Ok(StreamExit::Disconnected) => {
                    tracing::warn!(%source, "feed stream ended; reconnecting");
                    backoff = INITIAL_BACKOFF;
                    false
                }
                Err(err) => {
                    tracing::warn!(%source, ?err, "feed failed; retrying");
                    true
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            if failed {
                backoff = next_backoff(backoff);
            }
        }
        tracing::info!(%source, "feed task stopped");
    })
}

async fn run_source_once(
    feed: &dyn MempoolFeed,
    detector: &CollisionDetector,
    collisions: &mpsc::Sender<Collision>,
    connect_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<StreamExit> {
    let source = feed.name();
    feed.connect(connect_timeout).await?;
    let mut stream = feed.subscribe_pending_txs().await?;
    tracing::info!(%source, "subscribed to pending transactions");

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(StreamExit::Cancelled),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(hash)) => {
                let ts = now_us();
                if let Some(collision) = detector.observe(&source, &hash, ts) {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(StreamExit::Cancelled),
                        sent = collisions.send(collision) => {
                            if sent.is_err() {
                                return Ok(StreamExit::Cancelled);
                            }
                        }
                    }
                }
            }
            Some(Err(err)) => return Err(err),
            None => return Ok(StreamExit::Disconnected),
        }
    }
}

/// Single consumer of the collision queue: runs the outlier filter and
/// records whatever survives.
pub(super) fn spawn_drain_task(
    mut collisions: mpsc::Receiver<Collision>,
    mut filter: OutlierFilter,
    tally: Arc<PairTally>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let collision = tokio::select! {
                _ = cancel.cancelled() => break,
                next = collisions.recv() => match next {
                    Some(c) => c,
                    None => break,
                },
            };
            if let Some(sample) = filter.offer(&collision) {
                tracing::info!(
                    winner = %sample.winner,
                    loser = %sample.loser,
                    millis = sample.magnitude_ms,
                    hash = %collision.hash,
                    "new latency observation"
                );
                latency_aggregator::record(&sample);
                tally.increment(&sample.winner, &sample.loser);
            }
        }
        tracing::info!("collision drain stopped");
    })
}
