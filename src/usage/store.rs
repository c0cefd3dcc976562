//! Shared usage state
//!
//! Holds the latest uncached-input-token count per model. Written by the
//! agent's ingestion loop, read by connection handlers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Token usage per model observed in the current billing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Uncached input tokens keyed by model identifier
    pub tokens: HashMap<String, u64>,
    /// When the snapshot was fetched
    pub fetched_at: DateTime<Utc>,
}

impl UsageSnapshot {
    /// Creates an empty snapshot stamped with the current time
    pub fn new() -> Self {
        Self {
            tokens: HashMap::new(),
            fetched_at: Utc::now(),
        }
    }

    /// Adds a model reading
    pub fn with_model(mut self, model: impl Into<String>, tokens: u64) -> Self {
        self.tokens.insert(model.into(), tokens);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Sum over every model in the snapshot
    pub fn total(&self) -> u64 {
        self.tokens.values().fold(0u64, |acc, t| acc.saturating_add(*t))
    }
}

impl Default for UsageSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Inner {
    tokens: HashMap<String, u64>,
    updated_at: Option<DateTime<Utc>>,
}

/// Latest known usage per model, guarded by a single lock
///
/// Each write and each aggregate read happens inside one critical section, so
/// readers never observe a partially applied snapshot. Only the latest value
/// per model is kept.
#[derive(Debug, Default)]
pub struct UsageStore {
    inner: Mutex<Inner>,
}

impl UsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the count for `model`
    pub fn update(&self, model: &str, tokens: u64) {
        let mut inner = self.inner.lock();
        inner.tokens.insert(model.to_string(), tokens);
        inner.updated_at = Some(Utc::now());
    }

    /// Applies every model reading of a snapshot under one lock
    ///
    /// Models absent from the snapshot keep their previous value.
    pub fn apply(&self, snapshot: &UsageSnapshot) {
        let mut inner = self.inner.lock();
        for (model, tokens) in &snapshot.tokens {
            inner.tokens.insert(model.clone(), *tokens);
        }
        inner.updated_at = Some(snapshot.fetched_at);
    }

    /// Sum across all tracked models
    pub fn total_tokens(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .tokens
            .values()
            .fold(0u64, |acc, t| acc.saturating_add(*t))
    }

    /// Count for a single model, zero if it never reported
    pub fn tokens_for(&self, model: &str) -> u64 {
        self.inner.lock().tokens.get(model).copied().unwrap_or(0)
    }

    /// Copy of the current per-model counts
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.inner.lock().tokens.clone()
    }

    /// When the store was last written, if ever
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().updated_at
    }
}
