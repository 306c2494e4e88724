//! Integration tests for the request governance layer
//!
//! These tests drive the limiter, cache and optimizer through the public API
//! on tokio's paused clock, the way an application would wire them together.

use pretty_assertions::assert_eq;
use request_governor::{
    api::RequestOptions,
    cache::{CacheConfig, ResultCache},
    config::{BackoffConfig, GovernorConfig, OptimizerConfig, RateLimiterConfig},
    optimizer::{BatchResponse, RequestOptimizer},
    GovernorError, RateLimiter,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn limiter_config(per_minute: u32, window_ms: u64) -> RateLimiterConfig {
    RateLimiterConfig {
        requests_per_minute: per_minute,
        requests_per_hour: 10_000,
        minute_window_ms: window_ms,
        hour_window_ms: 3_600_000,
        backoff: BackoffConfig {
            base_delay_ms: 10,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_attempts: 5,
            jitter_enabled: false,
        },
    }
}

#[tokio::test(start_paused = true)]
async fn third_call_suspends_until_window_resets() {
    init_logging();
    let limiter = RateLimiter::shared(limiter_config(2, 1000)).unwrap();
    let start = Instant::now();

    let mut finished_at = Vec::new();
    for i in 0..3 {
        let value = limiter
            .execute_request(
                "/search",
                move || async move { Ok::<_, GovernorError>(i) },
                RequestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, i);
        finished_at.push(start.elapsed());
    }

    assert!(finished_at[1] < Duration::from_millis(10));
    assert!(finished_at[2] >= Duration::from_millis(1000));
    assert!(finished_at[2] < Duration::from_millis(1100));

    let stats = limiter.get_stats();
    assert_eq!(stats.accepted_requests, 3);
    assert_eq!(stats.rejected_requests, 0);
    assert!(stats.average_wait_time_ms > 300.0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_twice_then_succeeds() {
    init_logging();
    let limiter = RateLimiter::new(limiter_config(60, 60_000)).unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let start = Instant::now();

    let result = {
        let attempts = attempts.clone();
        limiter
            .execute_request(
                "/v2/insights",
                move || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n <= 2 {
                            Err(GovernorError::http(429, "Too Many Requests"))
                        } else {
                            Ok(json!({"results": ["ok"]}))
                        }
                    }
                },
                RequestOptions::labeled("insights scenario"),
            )
            .await
    };

    assert_eq!(result.unwrap(), json!({"results": ["ok"]}));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(limiter.get_stats().backoff_count, 2);
    // 10ms then 20ms of backoff
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[tokio::test(start_paused = true)]
async fn admission_never_exceeds_quota_under_concurrency() {
    init_logging();
    let limiter = RateLimiter::shared(limiter_config(5, 1000)).unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.wait_for_slot("/tags").await.unwrap();
                let usage = limiter.usage("/tags").await;
                usage.minute_requests
            })
        })
        .collect();

    for task in tasks {
        let in_window = task.await.unwrap();
        assert!(in_window <= 5, "window held {} events", in_window);
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_search_runs_once() {
    init_logging();
    let optimizer = RequestOptimizer::<Value>::new(GovernorConfig::default()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let fetch = || {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, GovernorError>(json!({"results": ["kind of blue"]})) }
        }
    };

    let (first, second) = tokio::join!(
        optimizer.optimize("search", json!({"query": "jazz"}), fetch()),
        optimizer.optimize("search", json!({"query": "jazz"}), fetch()),
    );

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(optimizer.get_stats().deduplicated_requests, 1);

    optimizer.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn music_entry_expires_after_its_ttl() {
    init_logging();
    let cache = ResultCache::<Vec<u32>>::new(CacheConfig::default());

    let ttl = cache.set("music:k", vec![1, 2, 3], None).await;
    assert_eq!(cache.get("music:k").await, Some(vec![1, 2, 3]));

    tokio::time::advance(ttl + Duration::from_millis(1)).await;
    assert_eq!(cache.get("music:k").await, None);
}

#[tokio::test(start_paused = true)]
async fn bulk_queries_are_deduplicated_before_execution() {
    init_logging();
    let optimizer = RequestOptimizer::<Value>::new(GovernorConfig::default()).unwrap();
    let seen_chunks = Arc::new(std::sync::Mutex::new(Vec::new()));

    let executor = {
        let seen_chunks = seen_chunks.clone();
        move |chunk: Vec<Value>| {
            seen_chunks.lock().unwrap().push(chunk.clone());
            async move { Ok::<_, GovernorError>(BatchResponse::new(chunk)) }
        }
    };

    let q_a = json!({"query": "jazz", "type": "urn:entity:artist"});
    let q_b = json!({"query": "noir", "type": "urn:entity:movie"});
    let response = optimizer
        .optimize_batch(vec![q_a.clone(), q_a.clone(), q_b.clone()], executor)
        .await
        .unwrap();

    assert_eq!(*seen_chunks.lock().unwrap(), vec![vec![q_a, q_b]]);
    assert_eq!(response.total_queries, 3);
    assert_eq!(response.unique_queries, 2);
    assert_eq!(response.failed_chunks, 0);
}

#[tokio::test(start_paused = true)]
async fn optimizer_shares_an_injected_limiter() {
    init_logging();
    let limiter = RateLimiter::shared(limiter_config(1, 1000)).unwrap();
    let optimizer =
        RequestOptimizer::<Value>::with_limiter(OptimizerConfig::default(), limiter.clone())
            .unwrap();
    let start = Instant::now();

    let (a, b) = tokio::join!(
        optimizer.optimize("audiences", json!({"id": 1}), || async {
            Ok::<_, GovernorError>(json!([1]))
        }),
        optimizer.optimize("audiences", json!({"id": 2}), || async {
            Ok::<_, GovernorError>(json!([2]))
        }),
    );

    assert!(a.is_ok() && b.is_ok());
    // One slot per second on the shared limiter
    assert!(start.elapsed() >= Duration::from_millis(1000));
    assert_eq!(limiter.get_stats().accepted_requests, 2);
    assert_eq!(optimizer.get_stats(), limiter.get_stats());

    optimizer.cleanup().await;
    optimizer.cleanup().await;
    assert!(limiter.is_shut_down());
}
