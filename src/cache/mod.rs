// src/cache/mod.rs
//! Result cache with content-aware TTLs
//!
//! - TTL computed once at insertion from entity type, payload size and scope
//! - Expired entries dropped on read and by a periodic sweep
//! - Oldest-accessed entry evicted when full (approximate LRU)

pub mod keys;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

pub use keys::{age_bucket, normalize_list, normalize_location, CacheKeyBuilder};

/// Key segment marking a location-agnostic entry
pub const GLOBAL_SCOPE: &str = "global";

const GLOBAL_SCOPE_MULTIPLIER: f64 = 1.5;
const RICHNESS_CAP: usize = 20;

/// Stability of each entity category, relative to the base TTL
static TYPE_MULTIPLIERS: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    [
        ("books", 2.2),
        ("book", 2.2),
        ("movies", 2.0),
        ("movie", 2.0),
        ("podcasts", 1.8),
        ("podcast", 1.8),
        ("music", 1.5),
        ("artists", 1.5),
        ("artist", 1.5),
        ("tv_shows", 1.5),
        ("tv_show", 1.5),
        ("places", 1.4),
        ("place", 1.4),
        ("destinations", 1.4),
        ("destination", 1.4),
        ("video_games", 1.3),
        ("video_game", 1.3),
        ("brands", 1.0),
        ("brand", 1.0),
        ("people", 1.0),
        ("person", 1.0),
        ("fashion", 0.8),
        ("social_media", 0.7),
        ("trends", 0.6),
    ]
    .into_iter()
    .collect()
});

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    /// Upper bound for computed TTLs
    pub max_ttl_ms: u64,
    pub max_size: usize,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            max_ttl_ms: 24 * 60 * 60 * 1000,
            max_size: 1000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_millis(self.max_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// How many result items a cached value holds; drives the richness factor.
pub trait CachePayload {
    fn item_count(&self) -> usize;
}

impl<T> CachePayload for Vec<T> {
    fn item_count(&self) -> usize {
        self.len()
    }
}

impl CachePayload for String {
    fn item_count(&self) -> usize {
        1
    }
}

impl CachePayload for serde_json::Value {
    fn item_count(&self) -> usize {
        use serde_json::Value;
        match self {
            Value::Null => 0,
            Value::Array(items) => items.len(),
            Value::Object(map) => ["results", "entities", "data"]
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_array))
                .map(|items| items.len())
                .unwrap_or(1),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            inserted_at: now,
            ttl,
            access_count: 0,
            last_accessed: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// Cache performance metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    /// Reads served by entries currently stored
    pub live_accesses: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

struct CacheStorage<V> {
    entries: HashMap<String, CacheEntry<V>>,
    metrics: CacheMetrics,
}

impl<V> CacheStorage<V> {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        self.metrics.expirations += removed as u64;
        removed
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.metrics.evictions += 1;
            debug!("🗑️ Evicted least recently used cache entry: {}", key);
        }
    }
}

/// Volatile key/value store for decoded API results
pub struct ResultCache<V> {
    config: CacheConfig,
    storage: Mutex<CacheStorage<V>>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + CachePayload + Send + Sync + 'static> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        info!(
            "🗄️ Initializing result cache: base TTL {}ms, max {} entries",
            config.default_ttl_ms, config.max_size
        );

        Self {
            config,
            storage: Mutex::new(CacheStorage {
                entries: HashMap::new(),
                metrics: CacheMetrics::default(),
            }),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns a clone of the value while its TTL holds. Expired entries are
    /// removed here.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.storage.lock().await;
        let storage = &mut *guard;

        let expired = match storage.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed = now;
                let value = entry.value.clone();
                storage.metrics.hits += 1;
                debug!("🎯 Cache hit: {}", key);
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            storage.entries.remove(key);
            storage.metrics.expirations += 1;
            debug!("⌛ Cache entry expired: {}", key);
        }
        storage.metrics.misses += 1;
        None
    }

    /// Stores `value` with `ttl` or, when absent, the computed TTL.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Duration {
        let ttl = ttl.unwrap_or_else(|| self.intelligent_ttl(key, &value));
        let mut storage = self.storage.lock().await;

        if !storage.entries.contains_key(key) && storage.entries.len() >= self.config.max_size {
            storage.purge_expired(Instant::now());
            while storage.entries.len() >= self.config.max_size && !storage.entries.is_empty() {
                storage.evict_lru();
            }
        }

        storage
            .entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        debug!("💾 Cached {} for {:?}", key, ttl);
        ttl
    }

    /// `base × type × richness × scope`, capped at `max_ttl`.
    pub fn intelligent_ttl(&self, key: &str, value: &V) -> Duration {
        let base_ms = self.config.default_ttl_ms as f64;
        let richness = 1.0 + value.item_count().min(RICHNESS_CAP) as f64 / RICHNESS_CAP as f64;
        let ttl_ms = base_ms * type_multiplier(key) * richness * scope_multiplier(key);

        Duration::from_millis(ttl_ms.round() as u64).min(self.config.max_ttl())
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.storage.lock().await.entries.remove(key).is_some()
    }

    pub async fn clear(&self) {
        let mut storage = self.storage.lock().await;
        let count = storage.entries.len();
        storage.entries.clear();
        info!("🧹 Result cache cleared ({} entries)", count);
    }

    pub async fn len(&self) -> usize {
        self.storage.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn metrics(&self) -> CacheMetrics {
        let storage = self.storage.lock().await;
        CacheMetrics {
            entries: storage.entries.len(),
            live_accesses: storage.entries.values().map(|e| e.access_count).sum(),
            ..storage.metrics.clone()
        }
    }

    /// Removes every expired entry, returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let removed = self.storage.lock().await.purge_expired(Instant::now());
        if removed > 0 {
            debug!("🧹 Cache sweep removed {} expired entries", removed);
        }
        removed
    }

    /// Spawns the periodic sweep. The task holds a weak reference and exits
    /// once the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let period = self.config.sweep_interval();
        if period.is_zero() {
            debug!("Cache sweeper disabled (zero interval)");
            return;
        }

        let cache: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.sweep().await;
                    }
                    None => break,
                }
            }
        });

        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
            debug!("Cache sweeper stopped");
        }
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .map(|slot| slot.as_ref().map_or(false, |h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl<V> Drop for ResultCache<V> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Multiplier of the first key segment naming a known entity category.
pub fn type_multiplier(key: &str) -> f64 {
    key.split(':')
        .find_map(|segment| TYPE_MULTIPLIERS.get(segment.trim().to_lowercase().as_str()))
        .copied()
        .unwrap_or(1.0)
}

fn scope_multiplier(key: &str) -> f64 {
    if key.split(':').any(|segment| segment == GLOBAL_SCOPE) {
        GLOBAL_SCOPE_MULTIPLIER
    } else {
        1.0
    }
}
