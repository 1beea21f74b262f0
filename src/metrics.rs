// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn describe_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Ingestion runs started.");
        describe_counter!("ingest_tasks_done_total", "Tasks completed by ingestion runs.");
        describe_counter!("ingest_tasks_failed_total", "Tasks failed by ingestion runs.");
        describe_counter!(
            "ingest_run_timeouts_total",
            "Ingestion runs cut off by the run timeout."
        );
        describe_counter!("queue_enqueued_total", "Tasks inserted or requeued.");
        describe_counter!("queue_claimed_total", "Tasks claimed into processing.");
        describe_counter!("queue_done_total", "Tasks marked done.");
        describe_counter!("queue_failed_total", "Tasks marked failed.");
        describe_counter!("queue_cooldowns_total", "Per-task cooldowns applied.");
        describe_counter!("limiter_leases_granted_total", "Rate limiter leases granted.");
        describe_counter!(
            "limiter_quota_exhausted_total",
            "Lease attempts rejected by the daily quota."
        );
        describe_counter!("vendor_throttled_total", "Vendor throttling signals observed.");
        describe_counter!("catalog_merges_total", "Records merged into the catalog.");
        describe_counter!("refresh_scans_total", "Staleness scans performed.");
        describe_counter!(
            "housekeeping_reclaimed_total",
            "Stuck tasks reclaimed by housekeeping."
        );
        describe_counter!(
            "housekeeping_failed_total",
            "Tasks failed by housekeeping for exceeding max attempts."
        );
        describe_gauge!("refresh_last_scan_ts", "Unix ts of the last staleness scan.");
        describe_gauge!("queue_queued", "Tasks currently waiting in the queue.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize the Prometheus recorder and register series metadata.
    pub fn init() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus: install recorder");
        describe_metrics();
        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
