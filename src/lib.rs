pub mod api; // Sliding-window limiter, backoff
pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod optimizer; // Dedup, batching, bulk queries
pub mod utils;

// Re-export the types most callers need
pub use api::{RateLimitUsage, RateLimiter, RemoteQuota, RequestOptions};
pub use cache::{CacheConfig, CacheKeyBuilder, CacheMetrics, CachePayload, ResultCache};
pub use config::{
    load_config, BackoffConfig, BatchingConfig, GovernorConfig, OptimizerConfig,
    RateLimiterConfig,
};
pub use error::{GovernorError, Result};
pub use monitoring::{Stats, StatsAggregator, StatsReport};
pub use optimizer::{
    BatchExecutor, BatchResponse, ConsolidatedResponse, RequestExecutor, RequestOptimizer,
};
