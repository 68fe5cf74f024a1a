use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use collision_engine::CollisionDetector;
use latency_aggregator::{FilterConfig, OutlierFilter, PairTally, LATENCY_METRIC};
use observability::{init_metrics, init_tracing};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config_loader::load_config;
use crate::control_api::{self, AppState};
use crate::feed_runtime::{
    build_feed, spawn_drain_task, spawn_source_task, COLLISION_QUEUE_CAP,
};

pub(super) async fn async_main() -> Result<()> {
    let _guard = init_tracing("txrace");
    let cfg = load_config()?;
    let prometheus = init_metrics(LATENCY_METRIC, &cfg.aggregator.buckets_ms);

    let reference = SmolStr::new(&cfg.reference);
    let secondaries = cfg
        .sources
        .iter()
        .filter(|s| s.name != cfg.reference)
        .map(|s| SmolStr::new(&s.name))
        .collect::<Vec<_>>();
    let detector = Arc::new(CollisionDetector::new(
        reference.clone(),
        secondaries,
        cfg.cache_capacity,
        cfg.cache_shards,
    ));

    let (collision_tx, collision_rx) = mpsc::channel(COLLISION_QUEUE_CAP);
    let tally = Arc::new(PairTally::default());
    let cancel = CancellationToken::new();

    let filter = OutlierFilter::new(FilterConfig {
        warmup_window: cfg.aggregator.warmup_window,
        lower_bound_ms: cfg.aggregator.lower_bound_ms,
    });
    spawn_drain_task(collision_rx, filter, tally.clone(), cancel.clone());

    let connect_timeout = Duration::from_millis(cfg.connect_timeout_ms);
    for source in &cfg.sources {
        let feed = build_feed(source)?;
        spawn_source_task(
            feed,
            detector.clone(),
            collision_tx.clone(),
            connect_timeout,
            cancel.clone(),
        );
    }
    drop(collision_tx);

    let state = AppState { prometheus, tally };
    let app = control_api::router(state);
    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("bad listen_addr: {}", cfg.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(
        %addr,
        reference = %reference,
        sources = cfg.sources.len(),
        "txrace started"
    );

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;
    cancel.cancel();
    Ok(())
}
