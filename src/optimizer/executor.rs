// src/optimizer/executor.rs
//! Caller-supplied network executors.
//!
//! The optimizer never performs I/O itself. Callers hand in something that
//! performs one API call and decodes the response; plain async closures work
//! through the blanket impls below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

use crate::error::Result;

/// Performs a single request.
///
/// Rate limits must surface as `GovernorError::Api` with status 429, code
/// `RATE_LIMIT_EXCEEDED` or type `rate_limit_error`; anything else is final.
#[async_trait]
pub trait RequestExecutor<T>: Send + Sync {
    async fn execute(&self) -> Result<T>;
}

#[async_trait]
impl<T, F, Fut> RequestExecutor<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    async fn execute(&self) -> Result<T> {
        (self)().await
    }
}

/// Result of one multi-query call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse<T> {
    pub results: Vec<T>,
    pub total_results: usize,
}

impl<T> BatchResponse<T> {
    pub fn new(results: Vec<T>) -> Self {
        let total_results = results.len();
        Self {
            results,
            total_results,
        }
    }
}

/// Executes a chunk of queries in one physical call.
#[async_trait]
pub trait BatchExecutor<T>: Send + Sync {
    async fn execute_batch(&self, queries: Vec<Value>) -> Result<BatchResponse<T>>;
}

#[async_trait]
impl<T, F, Fut> BatchExecutor<T> for F
where
    T: Send + 'static,
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BatchResponse<T>>> + Send + 'static,
{
    async fn execute_batch(&self, queries: Vec<Value>) -> Result<BatchResponse<T>> {
        (self)(queries).await
    }
}
