// src/optimizer/batch.rs
//! Pending requests and the time-boxed batches they wait in.

use serde_json::Value;
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::executor::RequestExecutor;

/// Result limit at or above which a request is treated as a bulk fetch
pub const LARGE_LIMIT_THRESHOLD: u64 = 20;
/// Confidence threshold at or above which a request gets an extra bump
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Batches are grouped by target endpoint and logical request type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub endpoint: String,
    pub request_type: String,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.request_type)
    }
}

/// One caller's request waiting for its batch to flush
pub struct PendingRequest<T> {
    pub id: Uuid,
    /// Canonical request text; equal identities are coalesced
    pub identity: String,
    pub request_type: String,
    pub params: Value,
    pub cache_key: String,
    pub created_at: Instant,
    pub priority: u8,
    pub executor: Arc<dyn RequestExecutor<T>>,
}

impl<T> PendingRequest<T> {
    pub fn new(
        identity: String,
        request_type: &str,
        params: Value,
        cache_key: String,
        executor: Arc<dyn RequestExecutor<T>>,
    ) -> Self {
        let priority = priority_score(&params);
        Self {
            id: Uuid::new_v4(),
            identity,
            request_type: request_type.to_string(),
            params,
            cache_key,
            created_at: Instant::now(),
            priority,
            executor,
        }
    }

    pub fn label(&self) -> String {
        format!("{}#{}", self.request_type, &self.id.simple().to_string()[..8])
    }
}

impl<T> fmt::Debug for PendingRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("request_type", &self.request_type)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Open group of compatible requests
pub struct Batch<T> {
    pub id: u64,
    pub key: BatchKey,
    pub members: Vec<PendingRequest<T>>,
    pub created_at: Instant,
    pub timer: Option<JoinHandle<()>>,
}

impl<T> Batch<T> {
    pub fn new(id: u64, key: BatchKey) -> Self {
        Self {
            id,
            key,
            members: Vec::new(),
            created_at: Instant::now(),
            timer: None,
        }
    }

    pub fn label(&self) -> String {
        format!("{}#{}", self.key, self.id)
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Highest priority first; equal scores keep insertion order.
    pub fn sort_by_priority(&mut self) {
        self.members.sort_by_key(|member| Reverse(member.priority));
    }
}

/// `1 + [limit >= 20] + [confidence >= 0.8]`
pub fn priority_score(params: &Value) -> u8 {
    let mut score = 1;

    let limit = ["limit", "take"]
        .iter()
        .find_map(|field| params.get(*field).and_then(Value::as_u64));
    if limit.map_or(false, |n| n >= LARGE_LIMIT_THRESHOLD) {
        score += 1;
    }

    let confidence = ["confidence", "confidence_threshold", "min_confidence"]
        .iter()
        .find_map(|field| params.get(*field).and_then(Value::as_f64));
    if confidence.map_or(false, |c| c >= HIGH_CONFIDENCE_THRESHOLD) {
        score += 1;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GovernorError;
    use serde_json::json;

    fn pending(params: Value) -> PendingRequest<Value> {
        let executor: Arc<dyn RequestExecutor<Value>> =
            Arc::new(|| async { Err::<Value, _>(GovernorError::api("unused")) });
        PendingRequest::new("fp".to_string(), "search", params, "key".to_string(), executor)
    }

    #[test]
    fn test_priority_score() {
        assert_eq!(priority_score(&json!({"query": "jazz"})), 1);
        assert_eq!(priority_score(&json!({"limit": 20})), 2);
        assert_eq!(priority_score(&json!({"take": 5, "confidence": 0.8})), 2);
        assert_eq!(priority_score(&json!({"limit": 50, "min_confidence": 0.95})), 3);
        assert_eq!(priority_score(&json!({"limit": "many"})), 1);
    }

    #[tokio::test]
    async fn test_sort_is_stable_descending() {
        let mut batch = Batch::new(
            1,
            BatchKey {
                endpoint: "/search".to_string(),
                request_type: "search".to_string(),
            },
        );
        batch.members.push(pending(json!({"query": "a"})));
        batch.members.push(pending(json!({"query": "b", "limit": 25})));
        batch.members.push(pending(json!({"query": "c"})));
        batch.members.push(pending(json!({"query": "d", "limit": 25, "confidence": 0.9})));

        batch.sort_by_priority();
        let order: Vec<&str> = batch
            .members
            .iter()
            .map(|m| m.params["query"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["d", "b", "a", "c"]);
        assert_eq!(batch.label(), "/search:search#1");
    }
}
