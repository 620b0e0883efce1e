//! # Response Cache
//!
//! In-process cache-aside store with TTL freshness and stale fallback.
//!
//! Every entry has two deadlines:
//! - `expires_at`: the end of freshness; after it `get_or_compute` recomputes
//! - `hard_expires_at`: `expires_at + stale_grace`; until then a failed
//!   refresh in `get_stale_on_error` may still serve the old value
//!
//! The lock is never held while `compute` runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::errors::CacheError;

/// Freshness of module metrics responses
pub const METRICS_TTL: Duration = Duration::from_secs(30);
/// Freshness of query responses
pub const QUERY_TTL: Duration = Duration::from_secs(60);
/// Freshness of module context responses
pub const CONTEXT_TTL: Duration = Duration::from_secs(300);
/// Freshness of aggregated responses
pub const AGGREGATE_TTL: Duration = Duration::from_secs(5);

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long past freshness a value may still be stale-served
    pub stale_grace: Duration,
    /// Maximum number of entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_grace: Duration::from_secs(3600),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
    hard_expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn is_servable_stale(&self, now: Instant) -> bool {
        now < self.hard_expires_at
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_served: u64,
}

/// Cache-aside store
#[derive(Debug)]
pub struct Cache {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
        }
    }

    /// Fresh value for `key`, if any
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|e| e.is_fresh(now))
            .map(|e| e.value.clone())
    }

    /// Last stored value for `key` that is still inside the stale grace
    fn get_stale(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|e| e.is_servable_stale(now))
            .map(|e| e.value.clone())
    }

    /// Store `value` under `key` for `ttl`
    pub fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now + ttl;
        let entry = CacheEntry {
            value,
            expires_at,
            hard_expires_at: expires_at + self.config.stale_grace,
        };

        if let Ok(mut entries) = self.entries.write() {
            if !entries.contains_key(key) && entries.len() >= self.config.max_entries {
                Self::evict(&mut entries, now);
            }
            if self.config.max_entries > 0 {
                entries.insert(key.to_string(), entry);
            }
        }
    }

    fn evict(entries: &mut HashMap<String, CacheEntry>, now: Instant) {
        entries.retain(|_, e| e.is_servable_stale(now));
        if entries.is_empty() {
            return;
        }
        let victim = entries
            .iter()
            .min_by_key(|(_, e)| e.expires_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            entries.remove(&key);
        }
    }

    /// Remove `key`; returns whether it was present
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries
            .write()
            .map(|mut e| e.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Drop entries past their hard expiry; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, e| e.is_servable_stale(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    /// Return the fresh value or compute, store and return a new one
    ///
    /// A compute error is returned as is and nothing is stored.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, ttl: Duration, compute: F) -> Result<Vec<u8>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if let Some(value) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache hit");
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = compute().await?;
        self.put(key, value.clone(), ttl);
        Ok(value)
    }

    /// Always compute; on failure fall back to the last stored value
    ///
    /// The fallback may be logically expired but not past its hard expiry.
    /// With nothing to fall back to the compute error is returned.
    pub async fn get_stale_on_error<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<Vec<u8>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: std::fmt::Display,
    {
        match compute().await {
            Ok(value) => {
                self.put(key, value.clone(), ttl);
                Ok(value)
            }
            Err(e) => match self.get_stale(key) {
                Some(value) => {
                    self.stale_served.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "refresh failed, serving stale value");
                    Ok(value)
                }
                None => Err(e),
            },
        }
    }

    /// Typed `get_or_compute` over JSON-encoded values
    pub async fn get_or_compute_json<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        let bytes = self
            .get_or_compute(key, ttl, || async move {
                let value = compute().await?;
                encode_json(&value).map_err(E::from)
            })
            .await?;
        decode_json(&bytes).map_err(E::from)
    }

    /// Typed `get_stale_on_error` over JSON-encoded values
    pub async fn get_stale_on_error_json<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError> + std::fmt::Display,
    {
        let bytes = self
            .get_stale_on_error(key, ttl, || async move {
                let value = compute().await?;
                encode_json(&value).map_err(E::from)
            })
            .await?;
        decode_json(&bytes).map_err(E::from)
    }

    /// Store a JSON-encoded value
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        self.put(key, encode_json(value)?, ttl);
        Ok(())
    }

    /// Fresh JSON-decoded value, if any
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key) {
            Some(bytes) => decode_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().map(|e| e.len()).unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
        }
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(value).map_err(|e| CacheError::Encode(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(bytes).map_err(|e| CacheError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[derive(Debug)]
    struct Down;

    impl std::fmt::Display for Down {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("upstream down")
        }
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_until_expiry() {
        let cache = Cache::default();
        let first: Result<Vec<u8>, Down> = cache
            .get_or_compute("k", Duration::from_millis(50), || async { Ok(b"v1".to_vec()) })
            .await;
        assert_eq!(first.unwrap(), b"v1");

        let second: Result<Vec<u8>, Down> = cache
            .get_or_compute("k", Duration::from_millis(50), || async { Ok(b"v2".to_vec()) })
            .await;
        assert_eq!(second.unwrap(), b"v1");

        tokio::time::sleep(Duration::from_millis(80)).await;
        let third: Result<Vec<u8>, Down> = cache
            .get_or_compute("k", Duration::from_millis(50), || async { Ok(b"v3".to_vec()) })
            .await;
        assert_eq!(third.unwrap(), b"v3");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_compute_error_stores_nothing() {
        let cache = Cache::default();
        let result: Result<Vec<u8>, Down> = cache
            .get_or_compute("k", QUERY_TTL, || async { Err(Down) })
            .await;
        assert!(result.is_err());
        assert!(cache.get("k").is_none());
    }

    #[tokio::test]
    async fn test_stale_value_served_on_failure() {
        let cache = Cache::default();
        let ok: Result<Vec<u8>, Down> = cache
            .get_stale_on_error("k", Duration::from_millis(10), || async { Ok(b"v1".to_vec()) })
            .await;
        assert_eq!(ok.unwrap(), b"v1");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").is_none());

        let stale: Result<Vec<u8>, Down> = cache
            .get_stale_on_error("k", Duration::from_millis(10), || async { Err(Down) })
            .await;
        assert_eq!(stale.unwrap(), b"v1");
        assert_eq!(cache.stats().stale_served, 1);
    }

    #[tokio::test]
    async fn test_stale_without_entry_propagates() {
        let cache = Cache::default();
        let result: Result<Vec<u8>, Down> = cache
            .get_stale_on_error("missing", QUERY_TTL, || async { Err(Down) })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_hard_expiry_stops_stale_serving() {
        let cache = Cache::new(CacheConfig {
            stale_grace: Duration::from_millis(10),
            max_entries: 10,
        });
        cache.put("k", b"v1".to_vec(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(40)).await;

        let result: Result<Vec<u8>, Down> = cache
            .get_stale_on_error("k", QUERY_TTL, || async { Err(Down) })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Debug)]
        struct Failed(String);
        impl From<CacheError> for Failed {
            fn from(e: CacheError) -> Self {
                Failed(e.to_string())
            }
        }

        let cache = Cache::default();
        let value: Value = cache
            .get_or_compute_json("ctx", CONTEXT_TTL, || async {
                Ok::<_, Failed>(json!({"accounts": 3}))
            })
            .await
            .unwrap();
        assert_eq!(value["accounts"], 3);

        let cached: Option<Value> = cache.get_json("ctx").unwrap();
        assert_eq!(cached, Some(json!({"accounts": 3})));
    }

    #[test]
    fn test_capacity_evicts_soonest_expiry() {
        let cache = Cache::new(CacheConfig {
            stale_grace: Duration::from_secs(60),
            max_entries: 2,
        });
        cache.put("short", b"a".to_vec(), Duration::from_secs(1));
        cache.put("long", b"b".to_vec(), Duration::from_secs(100));
        cache.put("new", b"c".to_vec(), Duration::from_secs(50));

        assert!(cache.get("short").is_none());
        assert!(cache.get("long").is_some());
        assert!(cache.get("new").is_some());
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_invalidate() {
        let cache = Cache::default();
        cache.put("k", b"v".to_vec(), QUERY_TTL);
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
    }
}
