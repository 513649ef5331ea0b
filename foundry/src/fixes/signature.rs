//! Error signature derivation.
//!
//! A signature is `(error_kind, normalized_message, error_site_hash)`.
//! Normalization strips filenames, line numbers, addresses, timestamps,
//! and quoted user data so the same defect signed from two different runs
//! collides to the same signature.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

static PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:[A-Za-z]:)?(?:[\w.\-]+)?(?:[/\\][\w.\-]+)+\.\w+"#).unwrap()
});

static LINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bline\s+\d+|:\d+(?::\d+)?").unwrap());

static ADDR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());

static TIMESTAMP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .unwrap()
});

static QUOTED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'[^']*'|"[^"]*""#).unwrap());

static WHITESPACE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip run-specific noise from an error message.
pub fn normalize_message(raw: &str) -> String {
    let s = TIMESTAMP_PATTERN.replace_all(raw, "<ts>");
    let s = PATH_PATTERN.replace_all(&s, "<path>");
    let s = LINE_PATTERN.replace_all(&s, "<line>");
    let s = ADDR_PATTERN.replace_all(&s, "<addr>");
    let s = QUOTED_PATTERN.replace_all(&s, "<value>");
    WHITESPACE_PATTERN
        .replace_all(&s, " ")
        .trim()
        .to_string()
}

/// Canonical identity of an error class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub error_kind: ErrorKind,
    pub normalized_message: String,
    /// Hash of the first non-empty diagnostic line after normalization.
    pub error_site_hash: String,
}

impl ErrorSignature {
    /// Derive a signature from a raw diagnostic.
    ///
    /// `site` is the most specific location text available (first
    /// traceback frame, offending source line); it is normalized before
    /// hashing so path and line churn do not split signatures.
    pub fn derive(error_kind: ErrorKind, raw_message: &str, site: &str) -> Self {
        let normalized_site = normalize_message(
            site.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or(""),
        );
        let hash = blake3::hash(normalized_site.as_bytes()).to_hex();
        Self {
            error_kind,
            normalized_message: normalize_message(raw_message),
            error_site_hash: hash[..16].to_string(),
        }
    }

    /// Token-set Jaccard similarity between normalized messages, in [0,1].
    ///
    /// Deterministic and embedding-free; good enough to rank near-miss
    /// signatures without a network round trip.
    pub fn similarity(&self, other: &Self) -> f64 {
        if self.error_kind != other.error_kind {
            return 0.0;
        }
        token_jaccard(&self.normalized_message, &other.normalized_message)
    }
}

fn token_jaccard(a: &str, b: &str) -> f64 {
    let ta: std::collections::BTreeSet<&str> = a.split_whitespace().collect();
    let tb: std::collections::BTreeSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let inter = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    inter as f64 / union as f64
}
