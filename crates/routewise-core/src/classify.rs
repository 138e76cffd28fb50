//! Query complexity classification.
//!
//! Classification is a length bucket over an approximate token count. It is
//! deliberately coarse and never looks at meaning, so it can be swapped out
//! without touching selection or orchestration.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::ComplexityTier;

lazy_static! {
    /// Runs of whitespace, collapsed to one space during normalization
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Token-count thresholds for the complexity buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Queries up to this many tokens are simple
    pub simple_max_tokens: usize,

    /// Queries with at least this many tokens are complex
    pub complex_min_tokens: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            simple_max_tokens: 12,
            complex_min_tokens: 125,
        }
    }
}

/// Normalize query text: trim, lowercase, collapse whitespace.
pub fn normalize_query(query: &str) -> String {
    WHITESPACE.replace_all(query.trim(), " ").to_lowercase()
}

/// Rough token estimate, about four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Classify a query with the default thresholds.
pub fn classify(query: &str) -> ComplexityTier {
    classify_with(query, &ClassifierConfig::default())
}

/// Classify a query with explicit thresholds.
pub fn classify_with(query: &str, config: &ClassifierConfig) -> ComplexityTier {
    let tokens = estimate_tokens(&normalize_query(query));

    if tokens <= config.simple_max_tokens {
        ComplexityTier::Simple
    } else if tokens >= config.complex_min_tokens {
        ComplexityTier::Complex
    } else {
        ComplexityTier::Medium
    }
}
