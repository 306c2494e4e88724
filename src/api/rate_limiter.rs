// src/api/rate_limiter.rs
//! Per-endpoint sliding-window rate limiting for the cultural-data API
//!
//! - Minute and hour windows per endpoint, both must have room to admit
//! - Callers over quota are suspended until the binding window frees a slot
//! - 429-style executor failures are retried with exponential backoff
//! - Server quota headers are recorded for reporting only

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;

use super::backoff::BackoffController;
use super::window::SlidingWindow;
use crate::config::RateLimiterConfig;
use crate::error::{GovernorError, Result};
use crate::monitoring::{Stats, StatsAggregator};

pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Never sleep less than this between admission checks
const MIN_SLOT_WAIT: Duration = Duration::from_millis(1);

/// Per-call knobs for `execute_request`
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Shown in retry logs instead of the endpoint
    pub label: Option<String>,
    /// Overrides `backoff.max_attempts` for this call
    pub max_attempts: Option<u32>,
}

impl RequestOptions {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            max_attempts: None,
        }
    }
}

/// Last quota values reported by the server for an endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteQuota {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

/// Local admission state for one endpoint
#[derive(Debug)]
struct EndpointWindows {
    minute: SlidingWindow,
    hour: SlidingWindow,
}

impl EndpointWindows {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            minute: SlidingWindow::new(config.minute_window()),
            hour: SlidingWindow::new(config.hour_window()),
        }
    }

    fn admits(&mut self, config: &RateLimiterConfig) -> bool {
        self.minute.count() < config.requests_per_minute as usize
            && self.hour.count() < config.requests_per_hour as usize
    }

    fn record(&mut self) {
        self.minute.add_event();
        self.hour.add_event();
    }

    /// Shortest wait among the windows that are currently full.
    fn time_to_next_slot(&mut self, config: &RateLimiterConfig) -> Duration {
        let mut waits = Vec::with_capacity(2);
        if self.minute.count() >= config.requests_per_minute as usize {
            waits.push(self.minute.time_to_next_slot());
        }
        if self.hour.count() >= config.requests_per_hour as usize {
            waits.push(self.hour.time_to_next_slot());
        }
        waits.into_iter().min().unwrap_or(Duration::ZERO)
    }
}

/// Quota gate and retry wrapper shared by every caller of one API.
///
/// Independent instances never share window state.
pub struct RateLimiter {
    config: RwLock<RateLimiterConfig>,
    windows: Mutex<HashMap<String, EndpointWindows>>,
    remote_quotas: Mutex<HashMap<String, RemoteQuota>>,
    stats: Arc<StatsAggregator>,
    shutdown: watch::Sender<bool>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        Self::with_stats(config, Arc::new(StatsAggregator::new()))
    }

    /// Builds a limiter that reports into an existing counter block.
    pub fn with_stats(config: RateLimiterConfig, stats: Arc<StatsAggregator>) -> Result<Self> {
        config.validate()?;

        info!(
            "🚦 Initializing rate limiter: {}req/m over {}ms, {}req/h over {}ms, max {} attempts",
            config.requests_per_minute,
            config.minute_window_ms,
            config.requests_per_hour,
            config.hour_window_ms,
            config.backoff.max_attempts
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: RwLock::new(config),
            windows: Mutex::new(HashMap::new()),
            remote_quotas: Mutex::new(HashMap::new()),
            stats,
            shutdown,
        })
    }

    /// Convenience factory for callers that pass the limiter around by `Arc`.
    pub fn shared(config: RateLimiterConfig) -> Result<Arc<Self>> {
        Self::new(config).map(Arc::new)
    }

    pub fn stats_handle(&self) -> Arc<StatsAggregator> {
        self.stats.clone()
    }

    pub async fn config(&self) -> RateLimiterConfig {
        self.config.read().await.clone()
    }

    /// Replaces the whole configuration. Recorded events are kept and judged
    /// against the new quotas and window lengths.
    pub async fn update_config(&self, config: RateLimiterConfig) -> Result<()> {
        config.validate()?;

        let mut current = self.config.write().await;
        let mut windows = self.windows.lock().await;
        for endpoint_windows in windows.values_mut() {
            endpoint_windows.minute.set_duration(config.minute_window());
            endpoint_windows.hour.set_duration(config.hour_window());
        }
        *current = config;

        info!("🔧 Rate limiter configuration replaced: {:?}", *current);
        Ok(())
    }

    /// True iff both windows for `endpoint` have room right now.
    pub async fn check_limit(&self, endpoint: &str) -> bool {
        let config = self.config.read().await;
        let mut windows = self.windows.lock().await;
        windows
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointWindows::new(&config))
            .admits(&config)
    }

    /// Suspends until `endpoint` has quota, then records the request in both
    /// windows. Returns how long the caller waited.
    pub async fn wait_for_slot(&self, endpoint: &str) -> Result<Duration> {
        let started = Instant::now();

        loop {
            if self.is_shut_down() {
                return Err(GovernorError::cancelled("rate limiter shut down"));
            }

            let wait = {
                let config = self.config.read().await;
                let mut windows = self.windows.lock().await;
                let endpoint_windows = windows
                    .entry(endpoint.to_string())
                    .or_insert_with(|| EndpointWindows::new(&config));

                if endpoint_windows.admits(&config) {
                    endpoint_windows.record();
                    None
                } else {
                    Some(endpoint_windows.time_to_next_slot(&config))
                }
            };

            match wait {
                None => return Ok(started.elapsed()),
                Some(wait) => {
                    let wait = wait.max(MIN_SLOT_WAIT);
                    debug!("⏳ {} over quota, waiting {:?} for a slot", endpoint, wait);
                    self.sleep_or_shutdown(wait).await?;
                }
            }
        }
    }

    /// Runs `executor` under quota control.
    ///
    /// Rate-limit failures are retried after `BackoffController` delays until
    /// the attempt budget is spent; any other failure is returned at once.
    pub async fn execute_request<T, F, Fut>(
        &self,
        endpoint: &str,
        mut executor: F,
        opts: RequestOptions,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.stats.record_request();

        let backoff = BackoffController::new(&self.config.read().await.backoff);
        let max_attempts = opts.max_attempts.unwrap_or(backoff.max_attempts()).max(1);
        let label = opts.label.as_deref().unwrap_or(endpoint);

        let mut attempt = 1;
        let mut waited = Duration::ZERO;

        loop {
            match self.wait_for_slot(endpoint).await {
                Ok(slot_wait) => waited += slot_wait,
                Err(e) => {
                    self.stats.record_rejected();
                    return Err(e);
                }
            }

            match executor().await {
                Ok(value) => {
                    self.stats.record_accepted(waited);
                    if attempt > 1 {
                        info!("✅ {} succeeded on attempt {}/{}", label, attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(err) if err.is_rate_limit() => {
                    if attempt >= max_attempts {
                        error!(
                            "🚫 {} still rate limited after {} attempts: {}",
                            label, attempt, err
                        );
                        self.stats.record_rejected();
                        return Err(GovernorError::RetriesExhausted {
                            endpoint: endpoint.to_string(),
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }

                    let delay = backoff.compute_delay(attempt);
                    self.stats.record_backoff();
                    warn!(
                        "🔄 {} rate limited (attempt {}/{}), backing off {:?}",
                        label, attempt, max_attempts, delay
                    );

                    if let Err(e) = self.sleep_or_shutdown(delay).await {
                        self.stats.record_rejected();
                        return Err(e);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    debug!("❌ {} failed without retry: {}", label, err);
                    self.stats.record_rejected();
                    return Err(err);
                }
            }
        }
    }

    /// Records server quota headers for `endpoint`. Admission keeps using
    /// the local windows only.
    pub async fn update_limits(&self, endpoint: &str, headers: &HashMap<String, String>) {
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
        };

        let remaining = header(HEADER_REMAINING).and_then(|v| v.parse::<u32>().ok());
        let reset_at = header(HEADER_RESET)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        if remaining.is_none() && reset_at.is_none() {
            return;
        }

        debug!(
            "📊 {} remote quota: remaining={:?}, reset_at={:?}",
            endpoint, remaining, reset_at
        );

        self.remote_quotas.lock().await.insert(
            endpoint.to_string(),
            RemoteQuota {
                remaining,
                reset_at,
                observed_at: Utc::now(),
            },
        );
    }

    pub async fn remote_quota(&self, endpoint: &str) -> Option<RemoteQuota> {
        self.remote_quotas.lock().await.get(endpoint).cloned()
    }

    /// Current window usage for `endpoint`
    pub async fn usage(&self, endpoint: &str) -> RateLimitUsage {
        let config = self.config.read().await.clone();
        let (minute_requests, hour_requests) = {
            let mut windows = self.windows.lock().await;
            match windows.get_mut(endpoint) {
                Some(w) => (w.minute.count() as u32, w.hour.count() as u32),
                None => (0, 0),
            }
        };

        RateLimitUsage {
            endpoint: endpoint.to_string(),
            minute_requests,
            minute_limit: config.requests_per_minute,
            hour_requests,
            hour_limit: config.requests_per_hour,
            remote: self.remote_quota(endpoint).await,
        }
    }

    pub fn get_stats(&self) -> Stats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Cancels every waiting or backing-off caller. Safe to call repeatedly.
    pub fn cleanup(&self) {
        let was_shut_down = self.shutdown.send_replace(true);
        if !was_shut_down {
            info!("🛑 Rate limiter shut down, pending waiters cancelled");
        }
    }

    async fn sleep_or_shutdown(&self, delay: Duration) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(GovernorError::cancelled("rate limiter shut down"));
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = shutdown.wait_for(|stopped| *stopped) => {
                Err(GovernorError::cancelled("rate limiter shut down"))
            }
        }
    }
}

/// Window usage for one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitUsage {
    pub endpoint: String,
    pub minute_requests: u32,
    pub minute_limit: u32,
    pub hour_requests: u32,
    pub hour_limit: u32,
    pub remote: Option<RemoteQuota>,
}

impl std::fmt::Display for RateLimitUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{}/m, {}/{}/h",
            self.endpoint, self.minute_requests, self.minute_limit, self.hour_requests, self.hour_limit
        )?;
        if let Some(remote) = &self.remote {
            write!(f, ", remote remaining: {:?}", remote.remaining)?;
        }
        Ok(())
    }
}
