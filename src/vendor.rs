// src/vendor.rs
//
// Vendor price API client. The upstream is opaque: it can throttle, time
// out, or fail, and the rest of the pipeline only sees the error taxonomy
// below.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One sighting of an item on a sourcing channel, as returned by the
/// vendor API. This is the input shape for dedupe and merge.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceRecord {
    pub source: String,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub title: String,
    /// Minor currency units (yen, cents).
    pub price: i64,
    #[serde(default)]
    pub currency: String,
    pub url: String,
    #[serde(default)]
    pub shop: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum VendorError {
    /// Upstream signaled rate exhaustion (HTTP 429 equivalent).
    #[error("vendor throttled the request")]
    Throttled,

    /// Network / 5xx-equivalent; retryable.
    #[error("transient vendor failure: {0}")]
    Transient(String),

    /// Invalid request or item; retrying cannot help.
    #[error("permanent vendor failure: {0}")]
    Permanent(String),
}

/// Opaque vendor price API: fetch current records for a batch of item ids
/// belonging to one tenant/site.
#[async_trait]
pub trait VendorApi: Send + Sync {
    async fn fetch_items(
        &self,
        tenant: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SourceRecord>, VendorError>;
}

/// Split `ids` into vendor-call-sized chunks, preserving order.
pub fn chunked(ids: &[String], size: usize) -> Vec<Vec<String>> {
    if size == 0 {
        return vec![ids.to_vec()];
    }
    ids.chunks(size).map(|c| c.to_vec()).collect()
}

/// HTTP-backed vendor client. Maps status codes onto the error taxonomy
/// and retries transient failures with exponential backoff before giving
/// up; throttling and permanent errors surface immediately.
pub struct HttpVendor {
    client: reqwest::Client,
    base_url: String,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

#[derive(Serialize)]
struct FetchReq<'a> {
    tenant: &'a str,
    ids: &'a [String],
}

impl HttpVendor {
    pub fn new(cfg: &crate::config::VendorCfg) -> Result<Self, VendorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| VendorError::Permanent(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            retry_attempts: cfg.retry_attempts.max(1),
            retry_base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
        })
    }

    async fn fetch_once(
        &self,
        tenant: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SourceRecord>, VendorError> {
        let url = format!("{}/v1/items:fetch", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&FetchReq { tenant, ids })
            .send()
            .await
            .map_err(|e| VendorError::Transient(format!("vendor request: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(VendorError::Throttled);
        }
        if status.is_server_error() {
            return Err(VendorError::Transient(format!("vendor returned {status}")));
        }
        if !status.is_success() {
            return Err(VendorError::Permanent(format!("vendor returned {status}")));
        }
        resp.json::<HashMap<String, SourceRecord>>()
            .await
            .map_err(|e| VendorError::Transient(format!("decoding vendor response: {e}")))
    }
}

#[async_trait]
impl VendorApi for HttpVendor {
    async fn fetch_items(
        &self,
        tenant: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SourceRecord>, VendorError> {
        let mut delay = self.retry_base_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch_once(tenant, ids).await {
                Ok(map) => return Ok(map),
                Err(VendorError::Transient(msg)) if attempt < self.retry_attempts => {
                    tracing::warn!(
                        tenant = %tenant,
                        attempt,
                        error = %msg,
                        "transient vendor failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_preserves_order_and_bounds_size() {
        let ids: Vec<String> = (0..7).map(|i| format!("i{i}")).collect();
        let chunks = chunked(&ids, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], vec!["i0", "i1", "i2"]);
        assert_eq!(chunks[2], vec!["i6"]);
    }

    #[test]
    fn chunked_zero_size_is_single_chunk() {
        let ids: Vec<String> = vec!["a".into(), "b".into()];
        assert_eq!(chunked(&ids, 0).len(), 1);
    }
}
