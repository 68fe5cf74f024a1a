use std::sync::OnceLock;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    Some(guard)
}

/// Install the process-wide Prometheus recorder, pinning `buckets_ms` as the
/// bucket boundaries for `latency_metric`. Idempotent; later calls return
/// the already-installed handle (bucket arguments are then ignored).
pub fn init_metrics(latency_metric: &str, buckets_ms: &[f64]) -> PrometheusHandle {
    if let Some(handle) = PROM_HANDLE.get() {
        return handle.clone();
    }

    let mut builder = PrometheusBuilder::new();
    if !buckets_ms.is_empty() {
        builder = builder
            .set_buckets_for_metric(Matcher::Full(latency_metric.to_string()), buckets_ms)
            .expect("latency histogram buckets");
    }
    let handle = builder
        .install_recorder()
        .expect("install prometheus recorder");

    let _ = PROM_HANDLE.set(handle.clone());
    handle
}
