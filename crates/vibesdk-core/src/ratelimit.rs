//! Sliding-window rate limiting with optional burst protection.
//!
//! Counters live in 10-second buckets keyed `ratelimit:{key}:{bucket_ts}`.
//! The store is process-global and safe for concurrent increments from many
//! request handlers. Any internal failure fails open.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use rand::Rng;
use tracing::warn;

pub const DEFAULT_BUCKET_SIZE_S: i64 = 10;
pub const DEFAULT_BURST_WINDOW_S: i64 = 60;

/// Probability of running the expired-bucket sweep on any increment.
const CLEANUP_PROBABILITY: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub period_s: i64,
    pub bucket_size_s: i64,
    pub burst: Option<u32>,
    pub burst_window_s: i64,
}

impl RateLimitConfig {
    pub fn new(limit: u32, period_s: i64) -> Self {
        Self {
            limit,
            period_s,
            bucket_size_s: DEFAULT_BUCKET_SIZE_S,
            burst: None,
            burst_window_s: DEFAULT_BURST_WINDOW_S,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub success: bool,
    pub remaining_limit: u32,
}

#[derive(Debug, Clone)]
struct Bucket {
    count: u32,
    bucket_ts: i64,
    expires_at: i64,
}

#[derive(Default)]
pub struct RateLimitStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, key: &str, config: &RateLimitConfig) -> RateLimitResult {
        self.increment_at(key, config, Utc::now().timestamp())
    }

    /// Clock-injectable variant of `increment` (tests pass a fixed `now`).
    pub fn increment_at(&self, key: &str, config: &RateLimitConfig, now: i64) -> RateLimitResult {
        match self.try_increment(key, config, now) {
            Ok(result) => result,
            Err(e) => {
                // Fail open: a broken limiter must not take requests down.
                warn!(key, "rate limit increment failed, allowing request: {e:#}");
                RateLimitResult {
                    success: true,
                    remaining_limit: config.limit,
                }
            }
        }
    }

    fn try_increment(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: i64,
    ) -> anyhow::Result<RateLimitResult> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        if rand::thread_rng().gen_bool(CLEANUP_PROBABILITY) {
            buckets.retain(|_, b| b.expires_at > now);
        }

        let prefix = format!("ratelimit:{key}:");
        let main_count = window_count(&buckets, &prefix, now, config.period_s);
        if main_count >= config.limit {
            return Ok(RateLimitResult {
                success: false,
                remaining_limit: 0,
            });
        }

        if let Some(burst) = config.burst {
            let burst_count = window_count(&buckets, &prefix, now, config.burst_window_s);
            if burst_count >= burst {
                return Ok(RateLimitResult {
                    success: false,
                    remaining_limit: 0,
                });
            }
        }

        let bucket_ts = now - now.rem_euclid(config.bucket_size_s);
        let bucket_key = format!("{prefix}{bucket_ts}");
        let expires_at = now + config.period_s.max(config.burst_window_s) + config.bucket_size_s;
        buckets
            .entry(bucket_key)
            .and_modify(|b| b.count += 1)
            .or_insert(Bucket {
                count: 1,
                bucket_ts,
                expires_at,
            });

        Ok(RateLimitResult {
            success: true,
            remaining_limit: config.limit.saturating_sub(main_count + 1),
        })
    }

    /// Read-only remaining budget; does not count as a request.
    pub fn get_remaining_limit(&self, key: &str, config: &RateLimitConfig) -> u32 {
        self.get_remaining_limit_at(key, config, Utc::now().timestamp())
    }

    pub fn get_remaining_limit_at(&self, key: &str, config: &RateLimitConfig, now: i64) -> u32 {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let prefix = format!("ratelimit:{key}:");
        let main_count = window_count(&buckets, &prefix, now, config.period_s);
        config.limit.saturating_sub(main_count)
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn window_count(buckets: &HashMap<String, Bucket>, prefix: &str, now: i64, window_s: i64) -> u32 {
    buckets
        .iter()
        .filter(|(key, _)| key.starts_with(prefix))
        .filter(|(_, b)| b.bucket_ts > now - window_s && b.expires_at > now)
        .map(|(_, b)| b.count)
        .sum()
}
