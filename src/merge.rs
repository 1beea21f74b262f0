// src/merge.rs
//
// Canonical product shape and the merge that folds a fresh vendor sighting
// into it. The policy is asymmetric on purpose: last-writer-wins at the
// offer slot, fill-only for scalar fields (longer title wins), and an
// append-only price history that only grows on an actual price change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vendor::SourceRecord;

/// One channel's current offer for a product. Slot identity is
/// `(source, shop)`; a fresher sighting of the same slot overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub source: String,
    #[serde(default)]
    pub shop: Option<String>,
    pub price: i64,
    pub url: String,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub ts: DateTime<Utc>,
    pub source: String,
    pub price: i64,
}

/// The merged, deduplicated representation of one physical item across
/// all sourcing channels. Keyed by its dedupe key in the catalog store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub dedupe_key: String,
    /// Fetch identity: which tenant/item the staleness scan should
    /// requeue to refresh this product. Stamped on every merge.
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub item_id: String,
    pub title: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Representative price: the cheapest current offer, minor units.
    pub price: i64,
    #[serde(default)]
    pub currency: String,
    pub affiliate_url: String,
    pub offers: Vec<Offer>,
    pub price_history: Vec<PricePoint>,
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,

    // Engagement signal, written by the storefront, read by the
    // freshness policy.
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub pinned: bool,

    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub fresh_until: Option<DateTime<Utc>>,
}

impl CanonicalProduct {
    /// First sighting of a dedupe key: a canonical record with a single
    /// offer and one opening price point.
    pub fn from_record(dedupe_key: &str, rec: &SourceRecord, now: DateTime<Utc>) -> Self {
        Self {
            dedupe_key: dedupe_key.to_string(),
            tenant: String::new(),
            item_id: String::new(),
            title: rec.title.clone(),
            brand: rec.brand.clone(),
            image_url: rec.image_url.clone(),
            price: rec.price,
            currency: rec.currency.clone(),
            affiliate_url: rec.url.clone(),
            offers: vec![Offer {
                source: rec.source.clone(),
                shop: rec.shop.clone(),
                price: rec.price,
                url: rec.url.clone(),
                last_seen_at: now,
            }],
            price_history: vec![PricePoint {
                ts: now,
                source: rec.source.clone(),
                price: rec.price,
            }],
            specs: rec.specs.clone(),
            tags: rec.tags.clone(),
            views: 0,
            pinned: false,
            updated_at: now,
            fresh_until: None,
        }
    }
}

/// Merge `incoming` into `existing`. Returns the updated product; the
/// caller writes it back (merge-then-write, no per-field transaction).
pub fn merge(mut existing: CanonicalProduct, incoming: &SourceRecord, now: DateTime<Utc>) -> CanonicalProduct {
    // Offers: keyed by (source, shop). Overwrite the matching slot,
    // otherwise append.
    let slot = existing
        .offers
        .iter_mut()
        .find(|o| o.source == incoming.source && o.shop == incoming.shop);
    match slot {
        Some(offer) => {
            offer.price = incoming.price;
            offer.last_seen_at = now;
            if !incoming.url.is_empty() {
                offer.url = incoming.url.clone();
            }
        }
        None => existing.offers.push(Offer {
            source: incoming.source.clone(),
            shop: incoming.shop.clone(),
            price: incoming.price,
            url: incoming.url.clone(),
            last_seen_at: now,
        }),
    }

    // Representative price/url: cheapest current offer across the merged set.
    if let Some(cheapest) = existing.offers.iter().min_by_key(|o| o.price) {
        existing.price = cheapest.price;
        existing.affiliate_url = cheapest.url.clone();
    }

    // Price history: append only on change against the last recorded point.
    let last_price = existing.price_history.last().map(|p| p.price);
    if last_price != Some(incoming.price) {
        existing.price_history.push(PricePoint {
            ts: now,
            source: incoming.source.clone(),
            price: incoming.price,
        });
    }

    // Scalars: fill-if-empty. Title exception: the longer one is kept.
    if incoming.title.chars().count() > existing.title.chars().count() {
        existing.title = incoming.title.clone();
    }
    if existing.brand.as_deref().unwrap_or("").is_empty() {
        existing.brand = incoming.brand.clone().filter(|b| !b.is_empty());
    }
    if existing.image_url.as_deref().unwrap_or("").is_empty() {
        existing.image_url = incoming.image_url.clone().filter(|u| !u.is_empty());
    }
    if existing.currency.is_empty() {
        existing.currency = incoming.currency.clone();
    }
    for (k, v) in &incoming.specs {
        existing.specs.entry(k.clone()).or_insert_with(|| v.clone());
    }
    for t in &incoming.tags {
        if !existing.tags.iter().any(|x| x == t) {
            existing.tags.push(t.clone());
        }
    }

    existing.updated_at = now;
    existing
}
