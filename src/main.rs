//! Catalog Ingestor — Binary Entrypoint
//! Boots the Axum HTTP surface and the background scheduling loops:
//! staleness scan, ingestion tick, and housekeeping sweep.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use catalog_ingestor::api;
use catalog_ingestor::config::AppConfig;
use catalog_ingestor::metrics::Metrics;
use catalog_ingestor::scheduler;
use catalog_ingestor::vendor::{HttpVendor, VendorApi};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading configuration")?;
    let metrics = Metrics::init();

    let vendor: Arc<dyn VendorApi> = Arc::new(HttpVendor::new(&cfg.vendor)?);
    let (router, state) = api::create_app(&cfg, vendor);
    let router = router.merge(metrics.router());

    let _refresh = scheduler::spawn_refresh_scheduler(Arc::clone(&state.store), cfg.queue, cfg.scheduler);
    let _ingest = scheduler::spawn_ingest_scheduler(
        Arc::clone(&state.worker),
        cfg.scheduler.ingest_interval_secs,
        cfg.worker.run_timeout_secs,
    );
    let _housekeeping = scheduler::spawn_housekeeping(
        Arc::clone(&state.housekeeper),
        cfg.housekeeping.interval_secs,
    );

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    tracing::info!(addr = %cfg.server.bind, "catalog ingestor listening");
    axum::serve(listener, router).await.context("serving http")?;
    Ok(())
}
