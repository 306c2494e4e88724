// src/optimizer/mod.rs
//! Request Optimizer
//!
//! Cuts physical API calls without changing what callers observe:
//! - Result cache short-circuit
//! - Coalescing of identical in-flight requests
//! - Time-boxed batches per endpoint and request type
//! - Bulk `optimize_batch` with up-front dedup and chunking

pub mod batch;
pub mod executor;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use itertools::Itertools;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::api::{RateLimiter, RequestOptions};
use crate::cache::{normalize_location, CacheConfig, CachePayload, ResultCache, GLOBAL_SCOPE};
use crate::config::{GovernorConfig, OptimizerConfig};
use crate::error::{GovernorError, Result};
use crate::monitoring::{Stats, StatsAggregator};
use crate::utils::{canonical_request, request_fingerprint};

pub use batch::{priority_score, Batch, BatchKey, PendingRequest};
pub use executor::{BatchExecutor, BatchResponse, RequestExecutor};

/// Identity namespace for `optimize_batch` queries
const BULK_QUERY_TYPE: &str = "bulk";

type Waiter<T> = oneshot::Sender<Result<T>>;

/// Aggregate of every chunk executed by `optimize_batch`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedResponse<T> {
    pub results: Vec<T>,
    pub total_results: usize,
    /// Queries submitted, duplicates included
    pub total_queries: usize,
    pub unique_queries: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub errors: Vec<String>,
}

impl<T> ConsolidatedResponse<T> {
    fn empty(total_queries: usize) -> Self {
        Self {
            results: Vec::new(),
            total_results: 0,
            total_queries,
            unique_queries: 0,
            chunks: 0,
            failed_chunks: 0,
            errors: Vec::new(),
        }
    }
}

struct OptimizerInner<T> {
    config: RwLock<OptimizerConfig>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResultCache<T>>,
    stats: Arc<StatsAggregator>,
    batches: Mutex<HashMap<BatchKey, Batch<T>>>,
    /// Request identity -> every caller awaiting that request
    waiters: DashMap<String, Vec<Waiter<T>>>,
    next_batch_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Rejects whatever a flush did not get to settle, e.g. when the flush task
/// panics or is aborted.
struct FlushGuard<T> {
    inner: Arc<OptimizerInner<T>>,
    batch: String,
    unresolved: Vec<String>,
}

impl<T> FlushGuard<T> {
    fn settled(&mut self, identity: &str) {
        if let Some(pos) = self.unresolved.iter().position(|id| id == identity) {
            self.unresolved.swap_remove(pos);
        }
    }
}

impl<T> Drop for FlushGuard<T> {
    fn drop(&mut self) {
        if self.unresolved.is_empty() {
            return;
        }
        error!(
            "💥 Batch {} died with {} unresolved requests",
            self.batch,
            self.unresolved.len()
        );
        let failure = GovernorError::BatchFailure {
            batch: self.batch.clone(),
            message: "batch execution ended before producing a result".to_string(),
        };
        for identity in self.unresolved.drain(..) {
            if let Some((_, waiters)) = self.inner.waiters.remove(&identity) {
                for waiter in waiters {
                    let _ = waiter.send(Err(failure.clone()));
                }
            }
        }
    }
}

impl<T> OptimizerInner<T> {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Hands `result` to every waiter registered under `identity`.
    fn settle(&self, identity: &str, result: Result<T>)
    where
        T: Clone,
    {
        if let Some((_, waiters)) = self.waiters.remove(identity) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

impl<T> OptimizerInner<T>
where
    T: Clone + CachePayload + Send + Sync + 'static,
{
    async fn flush_if_current(self: &Arc<Self>, key: &BatchKey, batch_id: u64) {
        let batch = {
            let mut batches = self.batches.lock().await;
            match batches.get(key) {
                Some(open) if open.id == batch_id => batches.remove(key),
                _ => None,
            }
        };

        if let Some(batch) = batch {
            debug!("⏰ Batch window closed for {}", batch.label());
            self.clone().run_batch(batch).await;
        }
    }

    async fn run_batch(self: Arc<Self>, mut batch: Batch<T>) {
        let label = batch.label();
        let mut guard = FlushGuard {
            inner: self.clone(),
            batch: label.clone(),
            unresolved: batch.members.iter().map(|m| m.identity.clone()).collect(),
        };

        batch.sort_by_priority();
        let size = batch.members.len();
        if size > 1 {
            self.stats.record_batched(size as u64);
        }

        let cache_enabled = self.config.read().await.enable_result_cache;
        info!(
            "📦 Flushing batch {} with {} requests after {:?}",
            label,
            size,
            batch.created_at.elapsed()
        );

        for member in batch.members {
            let executor = member.executor.clone();
            let result = self
                .limiter
                .execute_request(
                    &batch.key.endpoint,
                    move || {
                        let executor = executor.clone();
                        async move { executor.execute().await }
                    },
                    RequestOptions::labeled(member.label()),
                )
                .await;

            match &result {
                Ok(value) if cache_enabled => {
                    self.cache.set(&member.cache_key, value.clone(), None).await;
                }
                Ok(_) => {}
                Err(e) => debug!("Request {} in batch {} failed: {}", member.label(), label, e),
            }

            self.settle(&member.identity, result);
            guard.settled(&member.identity);
        }
    }
}

/// Front door for all cultural-data API calls.
///
/// Cheap to clone; clones share batches, cache, limiter and stats.
pub struct RequestOptimizer<T> {
    inner: Arc<OptimizerInner<T>>,
}

impl<T> Clone for RequestOptimizer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> RequestOptimizer<T>
where
    T: Clone + CachePayload + Send + Sync + 'static,
{
    /// Builds the optimizer and its own rate limiter. Must be called inside a
    /// tokio runtime when the result cache is enabled (starts the sweeper).
    pub fn new(config: GovernorConfig) -> Result<Self> {
        let stats = Arc::new(StatsAggregator::new());
        let limiter = Arc::new(RateLimiter::with_stats(config.rate_limiter, stats)?);
        Self::with_limiter(config.optimizer, limiter)
    }

    /// Builds the optimizer on top of an existing limiter, sharing its stats.
    pub fn with_limiter(config: OptimizerConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(ResultCache::new(CacheConfig {
            default_ttl_ms: config.result_cache_ttl_ms,
            max_size: config.cache_max_size.max(1),
            sweep_interval_ms: config.cache_sweep_interval_ms,
            ..CacheConfig::default()
        }));
        if config.enable_result_cache {
            cache.start_sweeper();
        }

        info!(
            "🚀 Request optimizer ready: batch size {}, window {}ms, eligible {:?}, cache {}",
            config.batching.max_batch_size,
            config.batching.batch_delay_ms,
            config.batching.eligible_types,
            if config.enable_result_cache { "on" } else { "off" }
        );

        Ok(Self {
            inner: Arc::new(OptimizerInner {
                config: RwLock::new(config),
                stats: limiter.stats_handle(),
                limiter,
                cache,
                batches: Mutex::new(HashMap::new()),
                waiters: DashMap::new(),
                next_batch_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn cache(&self) -> &Arc<ResultCache<T>> {
        &self.inner.cache
    }

    /// Fetches one logical request, going to the network only when neither
    /// the cache nor an in-flight duplicate can answer it.
    pub async fn optimize<E>(&self, request_type: &str, params: Value, executor: E) -> Result<T>
    where
        E: RequestExecutor<T> + 'static,
    {
        let inner = &self.inner;
        if inner.is_shut_down() {
            return Err(GovernorError::cancelled("request optimizer shut down"));
        }

        let (eligible, endpoint, cache_enabled, max_batch_size, window) = {
            let config = inner.config.read().await;
            (
                config.batching.is_eligible(request_type),
                config.endpoint_for(request_type).to_string(),
                config.enable_result_cache,
                config.batching.max_batch_size,
                config.batching.batch_window(),
            )
        };

        let identity = canonical_request(request_type, &params);
        let cache_key = cache_key_for(request_type, &params, &identity);

        if cache_enabled {
            if let Some(hit) = inner.cache.get(&cache_key).await {
                inner.stats.record_request();
                inner.stats.record_cache_hit();
                return Ok(hit);
            }
        }

        let executor: Arc<dyn RequestExecutor<T>> = Arc::new(executor);

        if !eligible {
            debug!("➡️ {} is not batchable, executing directly", request_type);
            let result = inner
                .limiter
                .execute_request(
                    &endpoint,
                    move || {
                        let executor = executor.clone();
                        async move { executor.execute().await }
                    },
                    RequestOptions::labeled(request_type),
                )
                .await;
            if let (Ok(value), true) = (&result, cache_enabled) {
                inner.cache.set(&cache_key, value.clone(), None).await;
            }
            return result;
        }

        let key = BatchKey {
            endpoint,
            request_type: request_type.to_string(),
        };
        let (tx, rx) = oneshot::channel();

        // Shutdown check, waiter registration and enqueue share one critical
        // section with no await inside it.
        let full_batch = {
            let mut batches = inner.batches.lock().await;
            if inner.is_shut_down() {
                return Err(GovernorError::cancelled("request optimizer shut down"));
            }

            match inner.waiters.entry(identity.clone()) {
                Entry::Occupied(mut waiting) => {
                    waiting.get_mut().push(tx);
                    drop(waiting);
                    drop(batches);
                    inner.stats.record_request();
                    inner.stats.record_deduplicated(1);
                    debug!(
                        "🔗 Attached to in-flight {} request {}",
                        request_type,
                        request_fingerprint(request_type, &params)
                    );
                    return Self::await_outcome(rx).await;
                }
                Entry::Vacant(slot) => {
                    slot.insert(vec![tx]);
                }
            }

            let pending = PendingRequest::new(identity, request_type, params, cache_key, executor);
            let batch = batches.entry(key.clone()).or_insert_with(|| {
                Batch::new(inner.next_batch_id.fetch_add(1, Ordering::Relaxed), key.clone())
            });
            batch.members.push(pending);

            if batch.members.len() >= max_batch_size {
                batches.remove(&key).map(|mut full| {
                    full.cancel_timer();
                    full
                })
            } else {
                if batch.members.len() == 1 {
                    batch.timer = Some(Self::spawn_flush_timer(
                        Arc::downgrade(&self.inner),
                        key.clone(),
                        batch.id,
                        window,
                    ));
                }
                None
            }
        };

        if let Some(batch) = full_batch {
            debug!("📦 Batch {} reached {} members, flushing now", batch.label(), max_batch_size);
            tokio::spawn(self.inner.clone().run_batch(batch));
        }

        Self::await_outcome(rx).await
    }

    fn spawn_flush_timer(
        inner: Weak<OptimizerInner<T>>,
        key: BatchKey,
        batch_id: u64,
        window: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = inner.upgrade() {
                inner.flush_if_current(&key, batch_id).await;
            }
        })
    }

    async fn await_outcome(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        rx.await.unwrap_or_else(|_| {
            Err(GovernorError::BatchFailure {
                batch: "unknown".to_string(),
                message: "request dropped before completion".to_string(),
            })
        })
    }

    /// Deduplicates `queries`, splits them into chunks of at most
    /// `max_batch_size` and runs the chunks concurrently.
    pub async fn optimize_batch<B>(
        &self,
        queries: Vec<Value>,
        executor: B,
    ) -> Result<ConsolidatedResponse<T>>
    where
        B: BatchExecutor<T> + 'static,
    {
        let inner = &self.inner;
        if inner.is_shut_down() {
            return Err(GovernorError::cancelled("request optimizer shut down"));
        }

        let total_queries = queries.len();
        if total_queries == 0 {
            return Ok(ConsolidatedResponse::empty(0));
        }

        let (chunk_size, endpoint) = {
            let config = inner.config.read().await;
            (
                config.batching.max_batch_size,
                config.default_endpoint.clone(),
            )
        };

        let unique: Vec<Value> = queries
            .into_iter()
            .unique_by(|query| canonical_request(BULK_QUERY_TYPE, query))
            .collect();
        let unique_queries = unique.len();
        let duplicates = total_queries - unique_queries;
        if duplicates > 0 {
            inner.stats.record_deduplicated(duplicates as u64);
        }

        let chunks: Vec<Vec<Value>> = unique
            .chunks(chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let chunk_count = chunks.len();

        // Every query counts as a logical request; the limiter counts one per chunk
        for _ in 0..(total_queries - chunk_count) {
            inner.stats.record_request();
        }
        inner.stats.record_batched((unique_queries - chunk_count) as u64);

        info!(
            "📚 optimize_batch: {} queries, {} unique, {} chunks",
            total_queries, unique_queries, chunk_count
        );

        let executor: Arc<dyn BatchExecutor<T>> = Arc::new(executor);
        let runs = chunks.into_iter().enumerate().map(|(index, chunk)| {
            let limiter = inner.limiter.clone();
            let executor = executor.clone();
            let endpoint = endpoint.clone();
            async move {
                limiter
                    .execute_request(
                        &endpoint,
                        move || {
                            let executor = executor.clone();
                            let chunk = chunk.clone();
                            async move { executor.execute_batch(chunk).await }
                        },
                        RequestOptions::labeled(format!("bulk chunk {}/{}", index + 1, chunk_count)),
                    )
                    .await
            }
        });

        let mut response = ConsolidatedResponse::empty(total_queries);
        response.unique_queries = unique_queries;
        response.chunks = chunk_count;
        let mut first_error = None;

        for outcome in join_all(runs).await {
            match outcome {
                Ok(part) => {
                    response.total_results += part.total_results;
                    response.results.extend(part.results);
                }
                Err(e) => {
                    warn!("⚠️ Bulk chunk failed: {}", e);
                    response.failed_chunks += 1;
                    response.errors.push(e.to_string());
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) if response.failed_chunks == chunk_count => Err(e),
            _ => Ok(response),
        }
    }

    /// Stops everything: pending timers, open batches, waiting callers, the
    /// cache sweeper and the limiter. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let inner = &self.inner;
        let first_call = !inner.shut_down.swap(true, Ordering::SeqCst);

        let open: Vec<Batch<T>> = inner
            .batches
            .lock()
            .await
            .drain()
            .map(|(_, batch)| batch)
            .collect();
        for mut batch in open {
            batch.cancel_timer();
        }

        let identities: Vec<String> = inner.waiters.iter().map(|e| e.key().clone()).collect();
        let cancelled = identities.len();
        for identity in identities {
            inner.settle(
                &identity,
                Err(GovernorError::cancelled("request optimizer shut down")),
            );
        }

        inner.cache.stop_sweeper();
        inner.limiter.cleanup();

        if first_call {
            info!("🛑 Request optimizer shut down, {} pending requests cancelled", cancelled);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    pub fn get_stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Replaces batching and endpoint settings. The cache keeps the sizing it
    /// was built with.
    pub async fn update_config(&self, config: OptimizerConfig) -> Result<()> {
        config.validate()?;
        let mut current = self.inner.config.write().await;
        *current = config;
        info!("🔧 Optimizer configuration replaced");
        Ok(())
    }

    pub async fn config(&self) -> OptimizerConfig {
        self.inner.config.read().await.clone()
    }

    /// Requests sitting in open batches
    pub async fn pending_count(&self) -> usize {
        self.inner
            .batches
            .lock()
            .await
            .values()
            .map(|batch| batch.members.len())
            .sum()
    }

    pub async fn open_batches(&self) -> usize {
        self.inner.batches.lock().await.len()
    }
}

/// `type:entity:scope:identity`, scoped so TTL multipliers apply. The
/// identity is escaped so it never adds `:` segments of its own.
fn cache_key_for(request_type: &str, params: &Value, identity: &str) -> String {
    let entity = ["entity_type", "type"]
        .iter()
        .find_map(|field| params.get(*field).and_then(Value::as_str))
        .and_then(|t| t.rsplit(':').next())
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "any".to_string());

    let scope = params
        .get("location")
        .and_then(Value::as_str)
        .map(normalize_location)
        .filter(|loc| !loc.is_empty())
        .unwrap_or_else(|| GLOBAL_SCOPE.to_string());

    let identity = identity.replace('%', "%25").replace(':', "%3A");
    format!("{}:{}:{}:{}", request_type, entity, scope, identity)
}
