// src/api/mod.rs
//! API Quota Module
//!
//! Keeps outbound calls to the cultural-data API inside its quotas:
//! - Sliding minute/hour windows per endpoint
//! - Exponential backoff with jitter on 429-style failures
//! - Recording of server-reported quota headers

pub mod backoff;
pub mod rate_limiter;
pub mod window;

pub use backoff::BackoffController;
pub use rate_limiter::{
    RateLimitUsage, RateLimiter, RemoteQuota, RequestOptions, HEADER_REMAINING, HEADER_RESET,
};
pub use window::SlidingWindow;
