// src/main.rs
use clap::Parser;
use futures::future::join_all;
use log::{info, warn, LevelFilter};
use rand::Rng;
use request_governor::{
    config::load_config,
    optimizer::{BatchResponse, RequestOptimizer},
    utils::setup_logging,
    GovernorError, StatsReport,
};
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TYPES: [&str; 4] = ["search", "insights", "tags", "recommendations"];
const ENTITY_TYPES: [&str; 5] = ["music", "movies", "books", "places", "social_media"];

#[derive(Parser, Debug, Clone)]
#[command(
    name = "governor-sim",
    about = "Drives simulated traffic through the request governor and prints its stats"
)]
struct Args {
    /// Logical requests to issue
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Distinct queries to draw from; fewer means more dedup and cache hits
    #[arg(long, default_value_t = 15)]
    distinct_queries: usize,

    /// Probability that the fake API answers with a 429
    #[arg(long, default_value_t = 0.05)]
    rate_limit_probability: f64,

    /// Upper bound of the fake API latency
    #[arg(long, default_value_t = 40)]
    max_latency_ms: u64,

    /// Overrides GOVERNOR_REQUESTS_PER_MINUTE
    #[arg(long)]
    requests_per_minute: Option<u32>,

    /// Overrides GOVERNOR_MAX_BATCH_SIZE
    #[arg(long)]
    batch_size: Option<usize>,

    /// Also run one bulk `optimize_batch` over the query pool
    #[arg(long, default_value_t = false)]
    bulk: bool,

    /// error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn fake_results(query: &Value, count: usize) -> Value {
    let items: Vec<Value> = (0..count)
        .map(|i| json!({"id": format!("{}-{}", query["q"], i), "score": fastrand::f64()}))
        .collect();
    json!({ "results": items })
}

async fn fake_api_call(
    params: Value,
    max_latency_ms: u64,
    rate_limit_probability: f64,
) -> request_governor::Result<Value> {
    tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=max_latency_ms))).await;

    if rand::thread_rng().gen_bool(rate_limit_probability.clamp(0.0, 1.0)) {
        return Err(GovernorError::rate_limited("simulated quota exhaustion"));
    }
    Ok(fake_results(&params, fastrand::usize(1..=25)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.log_level.parse().unwrap_or(LevelFilter::Info))?;
    info!("🚀 governor-sim starting: {:?}", args);

    let mut config = load_config()?;
    if let Some(rpm) = args.requests_per_minute {
        config.rate_limiter.requests_per_minute = rpm;
    }
    if let Some(size) = args.batch_size {
        config.optimizer.batching.max_batch_size = size;
    }
    config.validate()?;

    let optimizer = RequestOptimizer::<Value>::new(config)?;
    let distinct = args.distinct_queries.max(1);

    let calls = (0..args.requests).map(|_| {
        let optimizer = optimizer.clone();
        let request_type = REQUEST_TYPES[fastrand::usize(..REQUEST_TYPES.len())];
        let query_id = fastrand::usize(..distinct);
        let params = json!({
            "q": query_id,
            "entity_type": ENTITY_TYPES[query_id % ENTITY_TYPES.len()],
            "limit": if query_id % 3 == 0 { 25 } else { 10 },
        });
        let (max_latency_ms, probability) = (args.max_latency_ms, args.rate_limit_probability);

        tokio::spawn(async move {
            let executor_params = params.clone();
            optimizer
                .optimize(request_type, params, move || {
                    fake_api_call(executor_params.clone(), max_latency_ms, probability)
                })
                .await
        })
    });

    let mut failures = 0usize;
    for outcome in join_all(calls).await {
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                failures += 1;
                warn!("Request failed: {}", e);
            }
            Err(join_error) => {
                failures += 1;
                warn!("Request task crashed: {}", join_error);
            }
        }
    }

    if args.bulk {
        let queries: Vec<Value> = (0..args.requests.min(50))
            .map(|_| json!({"q": fastrand::usize(..distinct)}))
            .collect();
        let max_latency_ms = args.max_latency_ms;
        let response = optimizer
            .optimize_batch(queries, move |chunk: Vec<Value>| async move {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=max_latency_ms))).await;
                Ok::<_, GovernorError>(BatchResponse::new(chunk))
            })
            .await?;
        info!(
            "📚 Bulk run: {} queries, {} unique, {} chunks, {} results",
            response.total_queries, response.unique_queries, response.chunks, response.total_results
        );
    }

    let stats = optimizer.get_stats();
    info!("📊 {}", stats);
    info!("🗄️ Cache: {:?}", optimizer.cache().metrics().await);
    if failures > 0 {
        warn!("⚠️ {} of {} requests failed", failures, args.requests);
    }

    println!("{}", serde_json::to_string_pretty(&StatsReport::from(stats))?);

    optimizer.cleanup().await;
    Ok(())
}
