// src/dedupe.rs
//
// Stable identity for incoming records. Key sources are tried in strict
// priority order, strongest first, so false merges stay rare; the title
// fallback trades a little precision for bounded duplicate growth.

use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::vendor::SourceRecord;

/// Generic tokens that look like model numbers but identify nothing.
const MODEL_STOPLIST: &[&str] = &[
    "USB", "USB-C", "TYPE-C", "HDMI", "VGA", "DVI", "LAN", "WIFI", "WI-FI",
    "BLUETOOTH", "LED", "LCD", "OLED", "IPS", "SSD", "HDD", "RAM", "CPU",
    "GPU", "DVD", "NEW", "SALE", "2WAY", "3WAY", "IPX4", "IPX5", "IPX6",
    "IPX7", "PSE", "FM", "AM", "AC", "DC", "PC", "TV",
];

const TITLE_KEY_MAX: usize = 120;
const IMG_BASENAME_MAX: usize = 64;

fn re_ws() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

fn re_model_token() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    // Uppercase alphanumeric runs, 4..=24 chars, hyphens allowed inside.
    RE.get_or_init(|| Regex::new(r"\b[A-Z0-9][A-Z0-9-]{2,22}[A-Z0-9]\b").expect("model regex"))
}

/// Normalize a vendor title for keying: entity-decode, collapse
/// whitespace, lowercase, cap at 120 chars.
pub fn normalize_title(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let collapsed = re_ws().replace_all(decoded.trim(), " ").to_lowercase();
    collapsed.chars().take(TITLE_KEY_MAX).collect()
}

/// Extract a model-like token from the raw title: an uppercase
/// alphanumeric run mixing letters and digits, not on the stoplist.
fn model_token_from_title(title: &str) -> Option<String> {
    for m in re_model_token().find_iter(title) {
        let tok = m.as_str();
        let has_digit = tok.chars().any(|c| c.is_ascii_digit());
        let has_alpha = tok.chars().any(|c| c.is_ascii_uppercase());
        if !has_digit || !has_alpha {
            continue;
        }
        if MODEL_STOPLIST.iter().any(|s| s.eq_ignore_ascii_case(tok)) {
            continue;
        }
        return Some(tok.to_string());
    }
    None
}

/// Filename fingerprint of an image URL: the last path segment with query
/// and fragment stripped. Oversized basenames collapse to a sha256 prefix
/// so keys stay bounded.
fn image_fingerprint(url: &str) -> Option<String> {
    let no_fragment = url.split('#').next().unwrap_or(url);
    let no_query = no_fragment.split('?').next().unwrap_or(no_fragment);
    let basename = no_query.rsplit('/').next().unwrap_or("").trim();
    if basename.is_empty() || !basename.contains('.') {
        return None;
    }
    if basename.len() <= IMG_BASENAME_MAX {
        return Some(basename.to_string());
    }
    let mut hasher = Sha256::new();
    hasher.update(basename.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(&mut out, "{b:02x}");
    }
    Some(out)
}

fn nonempty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Compute the canonical identity key for a record. Pure: identical
/// inputs always yield identical keys, and the priority order is fixed.
pub fn compute_dedupe_key(rec: &SourceRecord) -> String {
    if let Some(id) = nonempty(&rec.vendor_id) {
        return format!("id:{id}");
    }
    if let Some(barcode) = nonempty(&rec.barcode) {
        return format!("barcode:{barcode}");
    }
    if let Some(model) = nonempty(&rec.model) {
        return format!("model:{model}");
    }
    if let Some(token) = model_token_from_title(&rec.title) {
        return format!("model:{token}");
    }
    if let Some(fp) = nonempty(&rec.image_url).and_then(image_fingerprint) {
        return format!("img:{fp}");
    }
    format!("title:{}", normalize_title(&rec.title))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> SourceRecord {
        SourceRecord {
            source: "amazon".into(),
            title: "Plain widget".into(),
            price: 1000,
            url: "https://example.test/item".into(),
            ..Default::default()
        }
    }

    #[test]
    fn stable_id_beats_barcode() {
        let mut r = rec();
        r.vendor_id = Some("B000123".into());
        r.barcode = Some("4901234567894".into());
        assert_eq!(compute_dedupe_key(&r), "id:B000123");
    }

    #[test]
    fn barcode_beats_model() {
        let mut r = rec();
        r.barcode = Some("4901234567894".into());
        r.model = Some("WH-1000XM4".into());
        assert_eq!(compute_dedupe_key(&r), "barcode:4901234567894");
    }

    #[test]
    fn model_token_extracted_from_title() {
        let mut r = rec();
        r.title = "Sony Wireless Headphones WH-1000XM4 Black".into();
        assert_eq!(compute_dedupe_key(&r), "model:WH-1000XM4");
    }

    #[test]
    fn stoplist_tokens_are_skipped() {
        let mut r = rec();
        r.title = "USB-C HDMI cable CAB-920X fast charge".into();
        assert_eq!(compute_dedupe_key(&r), "model:CAB-920X");
    }

    #[test]
    fn image_basename_used_before_title() {
        let mut r = rec();
        r.title = "plain widget".into();
        r.image_url = Some("https://cdn.example.test/img/widget-main.jpg?w=500#top".into());
        assert_eq!(compute_dedupe_key(&r), "img:widget-main.jpg");
    }

    #[test]
    fn title_fallback_is_normalized_and_capped() {
        let mut r = rec();
        r.title = format!("  Very   {} plain&nbsp;widget  ", "x".repeat(150));
        let key = compute_dedupe_key(&r);
        assert!(key.starts_with("title:very x"));
        assert!(key.len() <= "title:".len() + 120);
        assert!(!key.contains("  "));
    }

    #[test]
    fn determinism() {
        let mut r = rec();
        r.title = "Sony WH-1000XM4".into();
        assert_eq!(compute_dedupe_key(&r), compute_dedupe_key(&r.clone()));
    }
}
