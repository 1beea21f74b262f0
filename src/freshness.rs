// src/freshness.rs
//
// Maps an item's engagement signal onto a refresh cadence. Pure functions
// over an explicit `now` so tests control the clock.

use chrono::{DateTime, Duration, Utc};

use crate::config::FreshnessCfg;
use crate::merge::CanonicalProduct;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

/// Tenant-configurable "hot boost" predicate. Matching products are
/// refreshed on the hot cadence regardless of view counts.
pub trait HotBoost: Send + Sync {
    fn matches(&self, product: &CanonicalProduct) -> bool;
}

/// Default rule: any configured keyword appearing in the title or tags,
/// or a price inside the configured band. Empty config matches nothing.
pub struct RuleBoost {
    keywords: Vec<String>,
    price_min: i64,
    price_max: i64,
}

impl RuleBoost {
    pub fn from_cfg(cfg: &FreshnessCfg) -> Self {
        Self {
            keywords: cfg
                .boost_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            price_min: cfg.boost_price_min,
            price_max: cfg.boost_price_max,
        }
    }
}

impl HotBoost for RuleBoost {
    fn matches(&self, product: &CanonicalProduct) -> bool {
        let title = product.title.to_lowercase();
        for kw in &self.keywords {
            if title.contains(kw) || product.tags.iter().any(|t| t.eq_ignore_ascii_case(kw)) {
                return true;
            }
        }
        if self.price_min < self.price_max {
            return product.price >= self.price_min && product.price <= self.price_max;
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    cfg: FreshnessCfg,
}

impl FreshnessPolicy {
    pub fn new(cfg: FreshnessCfg) -> Self {
        Self { cfg }
    }

    pub fn classify(&self, views: u64, pinned: bool, boosted: bool) -> Tier {
        if pinned || boosted {
            return Tier::Hot;
        }
        if views >= self.cfg.hot_views {
            Tier::Hot
        } else if views >= self.cfg.warm_views {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    pub fn next_eligible(&self, tier: Tier, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = match tier {
            Tier::Hot => self.cfg.hot_refresh_secs,
            Tier::Warm => self.cfg.warm_refresh_secs,
            Tier::Cold => self.cfg.cold_refresh_secs,
        };
        now + Duration::seconds(secs as i64)
    }

    pub fn is_stale(fresh_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match fresh_until {
            None => true,
            Some(t) => now >= t,
        }
    }
}
