use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

/// Admission state returned to admitted callers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub total: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("rate limit exceeded, retry after {retry_after_ms} ms")]
pub struct RateLimitExceeded {
    pub retry_after_ms: u64,
}

struct KeyWindow {
    window_start: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

/// Fixed-window request counter per client key, protecting the upstream
/// model quota.
///
/// Exceeding the window limit starts a block: until it expires every request
/// from that key is rejected immediately, without touching the window
/// counter. Stale keys are evicted opportunistically on access once the
/// store outgrows its bound.
pub struct RateLimiter {
    entries: DashMap<String, KeyWindow>,
    window: Duration,
    max_requests: u32,
    block_duration: Duration,
    max_keys: usize,
}

impl RateLimiter {
    pub fn new(
        window: Duration,
        max_requests: u32,
        block_duration: Duration,
        max_keys: usize,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            window,
            max_requests: max_requests.max(1),
            block_duration,
            max_keys: max_keys.max(1),
        }
    }

    /// Admit or reject one request from `client_key`.
    pub fn check(&self, client_key: &str) -> Result<RateLimitStatus, RateLimitExceeded> {
        let now = Instant::now();
        self.evict_stale(now);

        let mut entry = self
            .entries
            .entry(client_key.to_string())
            .or_insert_with(|| KeyWindow {
                window_start: now,
                count: 0,
                blocked_until: None,
            });

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                metrics::counter!("extraction_rate_limited_total").increment(1);
                return Err(RateLimitExceeded {
                    retry_after_ms: (blocked_until - now).as_millis() as u64,
                });
            }
            // Block expired: start a fresh window.
            entry.blocked_until = None;
            entry.window_start = now;
            entry.count = 0;
        }

        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            entry.blocked_until = Some(now + self.block_duration);
            metrics::counter!("extraction_rate_limited_total").increment(1);
            return Err(RateLimitExceeded {
                retry_after_ms: self.block_duration.as_millis() as u64,
            });
        }

        entry.count += 1;
        let window_remaining = self.window - now.duration_since(entry.window_start);
        Ok(RateLimitStatus {
            remaining: self.max_requests - entry.count,
            reset_at: Utc::now()
                + chrono::Duration::milliseconds(window_remaining.as_millis() as i64),
            total: self.max_requests,
        })
    }

    /// Drop entries idle for more than one window (and past any block) once
    /// the store exceeds its bound.
    fn evict_stale(&self, now: Instant) {
        if self.entries.len() <= self.max_keys {
            return;
        }
        self.entries.retain(|_, entry| {
            let blocked = entry.blocked_until.is_some_and(|until| until > now);
            blocked || now.duration_since(entry.window_start) < self.window
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32) -> RateLimiter {
        RateLimiter::new(
            Duration::from_secs(60),
            max,
            Duration::from_secs(120),
            8,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_max_then_rejects() {
        let limiter = limiter(3);
        for i in 0..3 {
            let status = limiter.check("client-a").expect("should admit");
            assert_eq!(status.remaining, 2 - i);
            assert_eq!(status.total, 3);
        }

        let err = limiter.check("client-a").expect_err("should reject");
        assert!(err.retry_after_ms > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_rejects_without_counting() {
        let limiter = limiter(2);
        limiter.check("k").unwrap();
        limiter.check("k").unwrap();
        limiter.check("k").unwrap_err(); // starts the block

        // Rejections during the block never increment the window counter.
        for _ in 0..10 {
            limiter.check("k").unwrap_err();
        }
        let count = limiter.entries.get("k").unwrap().count;
        assert_eq!(count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_resumes_after_block_and_window() {
        let limiter = limiter(2);
        limiter.check("k").unwrap();
        limiter.check("k").unwrap();
        limiter.check("k").unwrap_err();

        tokio::time::advance(Duration::from_secs(121)).await;
        let status = limiter.check("k").expect("block expired");
        assert_eq!(status.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_restores_full_budget() {
        let limiter = limiter(2);
        limiter.check("k").unwrap();
        limiter.check("k").unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let status = limiter.check("k").expect("fresh window");
        assert_eq!(status.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(1);
        limiter.check("a").unwrap();
        limiter.check("a").unwrap_err();
        limiter.check("b").expect("other keys unaffected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_keys_are_evicted_on_access() {
        let limiter = limiter(5);
        for i in 0..9 {
            limiter.check(&format!("old-{i}")).unwrap();
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        // The store is past its bound, so the next access sweeps stale keys.
        limiter.check("fresh").unwrap();
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
