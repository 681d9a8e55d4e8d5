use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::extraction::ExtractionResult;
use crate::models::schema::CategorySchema;

/// How long to leave the durable tier alone after a failure before probing
/// it again.
const DURABLE_RETRY_COOLDOWN: Duration = Duration::from_secs(30);

/// Fraction of capacity the in-process tier is trimmed down to when it
/// overflows. Leaves headroom instead of evicting everything.
const CLEANUP_NUMERATOR: usize = 3;
const CLEANUP_DENOMINATOR: usize = 4;

/// Content hash of the uploaded image bytes.
pub fn hash_image(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic cache key over (image hash, schema id, schema version).
pub fn cache_key(image_hash: &str, schema: &CategorySchema) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_hash.as_bytes());
    hasher.update(b":");
    hasher.update(schema.id.as_bytes());
    hasher.update(b":");
    hasher.update(schema.version.to_le_bytes());
    format!("attr_extract:{:x}", hasher.finalize())
}

struct LocalEntry {
    value: ExtractionResult,
    created_at: Instant,
    expires_at: Instant,
    hit_count: u64,
}

/// Redis connection wrapped in explicit health state. A failure marks the
/// tier unavailable for a cooldown window; requests degrade to the
/// in-process tier instead of blocking or erroring.
struct DurableTier {
    client: redis::Client,
    available: AtomicBool,
    retry_at: Mutex<Option<Instant>>,
}

impl DurableTier {
    fn new(client: redis::Client) -> Self {
        Self {
            client,
            available: AtomicBool::new(true),
            retry_at: Mutex::new(None),
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Whether a request should try the durable tier: healthy, or past the
    /// failure cooldown and due for a probe.
    fn should_attempt(&self) -> bool {
        if self.is_available() {
            return true;
        }
        match *self.retry_at.lock() {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    fn mark_success(&self) {
        self.available.store(true, Ordering::Relaxed);
        *self.retry_at.lock() = None;
    }

    fn mark_failure(&self) {
        self.available.store(false, Ordering::Relaxed);
        *self.retry_at.lock() = Some(Instant::now() + DURABLE_RETRY_COOLDOWN);
    }

    async fn get(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.get(key).await
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await
    }

    async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Two-tier, content-addressed result cache: durable Redis tier first,
/// bounded in-process tier as the fallback. Durable-tier trouble is logged
/// and absorbed, never surfaced to callers.
pub struct ResultCache {
    durable: Option<DurableTier>,
    local: DashMap<String, LocalEntry>,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(redis_url: Option<&str>, max_entries: usize) -> Self {
        let durable = redis_url.and_then(|url| match redis::Client::open(url) {
            Ok(client) => Some(DurableTier::new(client)),
            Err(e) => {
                warn!(error = %e, "Invalid durable cache URL, running with in-process tier only");
                None
            }
        });

        Self {
            durable,
            local: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// In-process-only cache (tests, or deployments without Redis).
    pub fn in_process(max_entries: usize) -> Self {
        Self::new(None, max_entries)
    }

    pub async fn get(&self, key: &str) -> Option<ExtractionResult> {
        if let Some(durable) = &self.durable {
            if durable.should_attempt() {
                match durable.get(key).await {
                    Ok(Some(json)) => {
                        durable.mark_success();
                        match serde_json::from_str(&json) {
                            Ok(value) => {
                                metrics::counter!("extraction_cache_hits", "tier" => "durable")
                                    .increment(1);
                                return Some(value);
                            }
                            Err(e) => {
                                warn!(error = %e, "Durable cache entry did not deserialize, treating as miss");
                            }
                        }
                    }
                    Ok(None) => durable.mark_success(),
                    Err(e) => {
                        warn!(error = %e, "Durable cache unreachable, falling back to in-process tier");
                        durable.mark_failure();
                    }
                }
            }
        }

        let now = Instant::now();
        // The guard from get_mut must be dropped before remove() touches the
        // same shard.
        let expired = {
            match self.local.get_mut(key) {
                Some(mut entry) => {
                    if entry.expires_at > now {
                        entry.hit_count += 1;
                        metrics::counter!("extraction_cache_hits", "tier" => "local")
                            .increment(1);
                        return Some(entry.value.clone());
                    }
                    true
                }
                None => false,
            }
        };
        if expired {
            self.local.remove(key);
        }
        metrics::counter!("extraction_cache_misses").increment(1);
        None
    }

    pub async fn put(&self, key: &str, result: &ExtractionResult, ttl: Duration) {
        if let Some(durable) = &self.durable {
            if durable.should_attempt() {
                let json = match serde_json::to_string(result) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Result did not serialize for caching");
                        return;
                    }
                };
                match durable.put(key, &json, ttl).await {
                    Ok(()) => {
                        durable.mark_success();
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "Durable cache write failed, using in-process tier");
                        durable.mark_failure();
                    }
                }
            }
        }

        self.put_local(key, result.clone(), ttl);
    }

    fn put_local(&self, key: &str, value: ExtractionResult, ttl: Duration) {
        let now = Instant::now();
        if self.local.len() >= self.max_entries {
            self.evict(now);
        }
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                hit_count: 0,
            },
        );
    }

    /// Overflow handling: drop expired entries first, then the entries with
    /// the lowest hit-rate (`hit_count / age`) until below the cleanup
    /// threshold.
    fn evict(&self, now: Instant) {
        self.local.retain(|_, entry| entry.expires_at > now);

        let threshold = (self.max_entries * CLEANUP_NUMERATOR / CLEANUP_DENOMINATOR).max(1);
        if self.local.len() < threshold {
            return;
        }

        let mut scored: Vec<(String, f64)> = self
            .local
            .iter()
            .map(|entry| {
                let age = now.duration_since(entry.created_at).as_secs_f64().max(0.001);
                (entry.key().clone(), entry.hit_count as f64 / age)
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        let excess = self.local.len().saturating_sub(threshold);
        for (key, _) in scored.into_iter().take(excess) {
            self.local.remove(&key);
        }
        debug!(len = self.local.len(), "In-process cache trimmed");
    }

    /// `None` when no durable tier is configured.
    pub fn durable_is_available(&self) -> Option<bool> {
        self.durable.as_ref().map(DurableTier::is_available)
    }

    /// Active reachability probe for health checks.
    pub async fn ping_durable(&self) -> Option<bool> {
        let durable = self.durable.as_ref()?;
        match durable.ping().await {
            Ok(()) => {
                durable.mark_success();
                Some(true)
            }
            Err(_) => {
                durable.mark_failure();
                Some(false)
            }
        }
    }

    #[cfg(test)]
    fn local_len(&self) -> usize {
        self.local.len()
    }
}
