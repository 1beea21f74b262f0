// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const ENV_PATH: &str = "CATALOG_CONFIG_PATH";

/// Top-level application configuration. Every section has serde defaults so
/// a partial (or absent) config file still yields a runnable setup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerCfg,
    pub queue: QueueCfg,
    pub limiter: LimiterCfg,
    pub freshness: FreshnessCfg,
    pub worker: WorkerCfg,
    pub housekeeping: HousekeepingCfg,
    pub scheduler: SchedulerCfg,
    pub vendor: VendorCfg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub bind: String,
    /// Shared secret expected in the `x-dispatch-key` header of POST /run.
    /// Empty means no key is configured and header auth always fails.
    pub dispatch_key: String,
    /// Allow POST /run without the dispatch header (local operation only).
    pub allow_manual_run: bool,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            dispatch_key: String::new(),
            allow_manual_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QueueCfg {
    pub max_attempts: u32,
    /// A re-enqueue of the same item within this window is a no-op.
    pub enqueue_cooldown_secs: u64,
    pub claim_limit: usize,
}

impl Default for QueueCfg {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            enqueue_cooldown_secs: 600,
            claim_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LimiterCfg {
    /// Sustained requests per second; fractional values (>= 0.1) supported.
    pub tps: f64,
    pub burst: f64,
    pub daily_max: i64,
}

impl Default for LimiterCfg {
    fn default() -> Self {
        Self {
            tps: 1.0,
            burst: 5.0,
            daily_max: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FreshnessCfg {
    pub hot_views: u64,
    pub warm_views: u64,
    pub hot_refresh_secs: u64,
    pub warm_refresh_secs: u64,
    pub cold_refresh_secs: u64,
    /// Keywords matched against title/tags by the default hot-boost rule.
    pub boost_keywords: Vec<String>,
    /// Inclusive price band (minor units) attracting the hot-boost; zeros disable.
    pub boost_price_min: i64,
    pub boost_price_max: i64,
}

impl Default for FreshnessCfg {
    fn default() -> Self {
        Self {
            hot_views: 500,
            warm_views: 50,
            hot_refresh_secs: 30 * 60,
            warm_refresh_secs: 6 * 3600,
            cold_refresh_secs: 24 * 3600,
            boost_keywords: Vec::new(),
            boost_price_min: 0,
            boost_price_max: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerCfg {
    /// Vendor per-call item limit.
    pub chunk_size: usize,
    /// Base inter-chunk delay; multiplied by a random jitter factor.
    pub chunk_delay_ms: u64,
    pub run_timeout_secs: u64,
    pub run_lock_ttl_secs: u64,
    /// Per-task cooldown applied when the vendor signals throttling.
    pub task_cooldown_secs: u64,
    /// Minimum global cooldown set on a throttling signal.
    pub global_cooldown_secs: u64,
    /// Restrict a run to one tenant; None processes all.
    pub focus_tenant: Option<String>,
}

impl Default for WorkerCfg {
    fn default() -> Self {
        Self {
            chunk_size: 20,
            chunk_delay_ms: 800,
            run_timeout_secs: 300,
            run_lock_ttl_secs: 600,
            task_cooldown_secs: 1800,
            global_cooldown_secs: 900,
            focus_tenant: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HousekeepingCfg {
    /// Tasks stuck in processing longer than this are reclaimed.
    pub processing_ttl_secs: u64,
    pub interval_secs: u64,
}

impl Default for HousekeepingCfg {
    fn default() -> Self {
        Self {
            processing_ttl_secs: 15 * 60,
            interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SchedulerCfg {
    pub scan_interval_secs: u64,
    /// Upper bound on tasks enqueued per staleness scan.
    pub scan_limit: usize,
    pub ingest_interval_secs: u64,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            scan_interval_secs: 300,
            scan_limit: 200,
            ingest_interval_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VendorCfg {
    pub base_url: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for VendorCfg {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9100".into(),
            timeout_secs: 10,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl AppConfig {
    /// Load config from an explicit TOML path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing config from {}", path.display()))
    }

    /// Load config using env var + fallbacks:
    /// 1) $CATALOG_CONFIG_PATH
    /// 2) config/catalog.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("CATALOG_CONFIG_PATH points to non-existent path"));
        }
        let toml_p = PathBuf::from("config/catalog.toml");
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        Ok(Self::default())
    }
}
