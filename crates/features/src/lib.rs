//! Feature extraction for device risk analysis.
//!
//! Provides pure functions used by both training and serving:
//! - Text normalization
//! - Composite slug splitting
//! - Regulatory action to risk label mapping
//! - Character n-gram TF-IDF vectorization (see [`vectorizer`])

use std::sync::LazyLock;

use medrisk_model::RiskClass;
use regex::Regex;

pub mod vectorizer;

pub use vectorizer::{
    char_wb_ngrams, CharNgramVectorizer, SparseVector, VectorizerConfig, VectorizerError,
};

static SLUG_DELIMITERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\-_/|>]+").expect("invalid SLUG_DELIMITERS"));

/// Punctuation that survives normalization (slug delimiters).
const KEPT_PUNCTUATION: [char; 5] = ['-', '_', '/', '|', '>'];

fn is_kept_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || KEPT_PUNCTUATION.contains(&c)
}

/// Normalize a device or manufacturer string.
///
/// Lower-cases, drops every character outside `[a-z0-9 -_/|>]`, and
/// collapses whitespace runs to a single space. Idempotent.
pub fn normalize_text(text: &str) -> String {
    let kept: String = text
        .to_lowercase()
        .chars()
        .filter(|c| is_kept_char(*c) || c.is_whitespace())
        .collect();

    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize an optional value; absent values become the empty string.
pub fn normalize_opt(text: Option<&str>) -> String {
    text.map(normalize_text).unwrap_or_default()
}

/// Fields recovered from a composite `country-manufacturer-device` slug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlugParts {
    pub country: String,
    pub manufacturer: String,
    pub device: String,
}

/// Split a composite device identifier into country, manufacturer and device.
///
/// The slug is normalized, then split on runs of `- _ / | >`. The first token
/// is the country, the second the manufacturer, and everything after is
/// joined with single spaces into the device name.
pub fn split_device_slug(slug: &str) -> SlugParts {
    let normalized = normalize_text(slug);
    let mut tokens = SLUG_DELIMITERS
        .split(&normalized)
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let country = tokens.next().unwrap_or_default().to_string();
    let manufacturer = tokens.next().unwrap_or_default().to_string();
    let device = tokens.collect::<Vec<_>>().join(" ");

    SlugParts {
        country,
        manufacturer,
        device,
    }
}

/// Map a raw regulatory action category to a training label.
///
/// Missing and unrecognized values resolve to `Medium`.
pub fn action_to_risk_class(action_level: Option<&str>) -> RiskClass {
    let Some(raw) = action_level else {
        return RiskClass::Medium;
    };

    match normalize_text(raw).as_str() {
        "public recall"
        | "hospital/pharmacy/laboratory"
        | "healthcare professional"
        | "class i"
        | "class iii"
        | "mandatory" => RiskClass::High,
        "class ii" | "sponsor control" => RiskClass::Medium,
        "retail" | "wholesale" | "voluntary" | "unknown" => RiskClass::Low,
        _ => RiskClass::Medium,
    }
}
