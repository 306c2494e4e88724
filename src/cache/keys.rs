// src/cache/keys.rs
//! Cache key normalization
//!
//! Semantically equal requests must produce the same key. Callers build keys
//! through these helpers; the cache itself never rewrites keys.

use itertools::Itertools;
use std::fmt;

use super::GLOBAL_SCOPE;

/// Maximum list entries kept in a key
pub const MAX_LIST_ITEMS: usize = 3;

/// Decade range for an age, e.g. 34 -> "30-39".
pub fn age_bucket(age: u32) -> String {
    let low = age / 10 * 10;
    format!("{}-{}", low, low.saturating_add(9))
}

/// Lower-cased primary region token: "New York, NY" -> "new york".
pub fn normalize_location(location: &str) -> String {
    location
        .split(',')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Trimmed, lower-cased, sorted, de-duplicated and truncated list.
pub fn normalize_list<S: AsRef<str>>(items: &[S]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.as_ref().trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .sorted()
        .dedup()
        .take(MAX_LIST_ITEMS)
        .collect()
}

/// Builds `:`-separated keys from normalized request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyBuilder {
    segments: Vec<String>,
    scope: Option<String>,
}

impl CacheKeyBuilder {
    pub fn new(request_type: &str) -> Self {
        Self {
            segments: vec![request_type.trim().to_lowercase()],
            scope: None,
        }
    }

    /// Entity type, with any `urn:entity:` style prefix stripped.
    pub fn entity(mut self, entity_type: &str) -> Self {
        let entity = entity_type.rsplit(':').next().unwrap_or(entity_type);
        self.segments.push(entity.trim().to_lowercase());
        self
    }

    pub fn age(mut self, age: u32) -> Self {
        self.segments.push(format!("age={}", age_bucket(age)));
        self
    }

    /// Keys without a location are scoped `global`.
    pub fn location(mut self, location: Option<&str>) -> Self {
        self.scope = location
            .map(normalize_location)
            .filter(|loc| !loc.is_empty());
        self
    }

    pub fn list<S: AsRef<str>>(mut self, name: &str, items: &[S]) -> Self {
        let normalized = normalize_list(items);
        if !normalized.is_empty() {
            self.segments
                .push(format!("{}={}", name, normalized.join(",")));
        }
        self
    }

    pub fn param(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.segments.push(format!("{}={}", name, value));
        self
    }

    pub fn build(self) -> String {
        let scope = self.scope.unwrap_or_else(|| GLOBAL_SCOPE.to_string());
        self.segments
            .into_iter()
            .chain(std::iter::once(scope))
            .join(":")
    }
}
