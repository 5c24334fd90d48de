//! Token estimation.
//!
//! `tokens ≈ ceil(chars / 4) + 1`. The estimate depends only on the input
//! length, so results are cached by length. It is an upper-bound heuristic,
//! not tokenizer-accurate.

use dashmap::DashMap;
use kiln_core::Message;

use crate::constants::{CHARS_PER_TOKEN, TOKEN_CACHE_CAPACITY};

/// Character-count-keyed token estimator.
#[derive(Debug, Default)]
pub struct TokenEstimator {
    cache: DashMap<usize, usize>,
}

impl TokenEstimator {
    /// Create an estimator with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimated tokens for `text`.
    pub fn estimate(&self, text: &str) -> usize {
        let len = text.chars().count();
        if let Some(hit) = self.cache.get(&len) {
            return *hit;
        }
        let tokens = estimate_uncached(len);
        if self.cache.len() >= TOKEN_CACHE_CAPACITY {
            self.cache.clear();
        }
        let _ = self.cache.insert(len, tokens);
        tokens
    }

    /// Sum of the estimates for every message's content.
    pub fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate(&m.content)).sum()
    }

    /// Number of cached character counts.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

fn estimate_uncached(len: usize) -> usize {
    len.div_ceil(CHARS_PER_TOKEN) + 1
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
