//! Observability setup: structured logging, Prometheus metrics, and the
//! metric helpers called from the storage and raftstore layers.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ferrokv=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

pub fn record_worker_task(worker: &str, task: &'static str, success: bool) {
    metrics::counter!(
        "ferrokv_worker_tasks_total",
        "worker" => worker.to_string(),
        "task" => task,
        "success" => success.to_string()
    )
    .increment(1);
}

pub fn record_worker_backpressure(worker: &str) {
    metrics::counter!("ferrokv_worker_backpressure_total", "worker" => worker.to_string())
        .increment(1);
}

pub fn record_worker_pending(worker: &str, pending: usize) {
    metrics::gauge!("ferrokv_worker_pending_tasks", "worker" => worker.to_string())
        .set(pending as f64);
}

pub fn record_mvcc_command(cmd: &'static str) {
    metrics::counter!("ferrokv_mvcc_commands_total", "cmd" => cmd).increment(1);
}

/// `kind` is one of `locked`, `retryable`, `abort`, `internal`.
pub fn record_mvcc_error(cmd: &'static str, kind: &'static str) {
    metrics::counter!("ferrokv_mvcc_errors_total", "cmd" => cmd, "kind" => kind).increment(1);
}

pub fn record_latch_wait(wait_us: u64) {
    metrics::histogram!("ferrokv_latch_wait_us").record(wait_us as f64);
}

pub fn record_split_check(policy: &'static str, split_keys: usize) {
    metrics::counter!("ferrokv_split_check_total", "policy" => policy).increment(1);
    metrics::counter!("ferrokv_split_check_keys_total").increment(split_keys as u64);
}

pub fn record_snapshot_job(op: &'static str, status: &'static str) {
    metrics::counter!("ferrokv_region_snapshot_total", "op" => op, "status" => status)
        .increment(1);
}

pub fn record_compaction(trigger: &'static str, removed_tombstones: u64) {
    metrics::counter!("ferrokv_compactions_total", "trigger" => trigger).increment(1);
    metrics::counter!("ferrokv_compacted_tombstones_total").increment(removed_tombstones);
}

pub fn record_request_rejected(reason: &'static str) {
    metrics::counter!("ferrokv_requests_rejected_total", "reason" => reason).increment(1);
}

pub fn record_engine_stall(stalled: bool) {
    metrics::gauge!("ferrokv_engine_write_stall").set(if stalled { 1.0 } else { 0.0 });
}
