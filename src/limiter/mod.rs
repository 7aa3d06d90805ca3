//! I/O Rate Limiter
//!
//! Per-user upload and download throttling. Each chunk read or written is
//! checked against the user's bucket for that direction; the bucket size is
//! the user's speed limit from their quota record, cached for a short while
//! so a chunk does not cost a store lookup.
//!
//! The limiter is advisory: it answers immediately and callers back off on
//! their own.

mod bucket;

pub use bucket::{BucketSettings, TokenBuckets};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{LimiterConfig, QuotaLimits};
use crate::quota::QuotaLedger;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

struct CachedLimits {
    limits: QuotaLimits,
    fetched_at: Instant,
}

/// Bounded TTL cache of users' speed limits
struct SpeedCache {
    ttl: Duration,
    capacity: usize,
    clean_batch: usize,
    entries: Mutex<HashMap<String, CachedLimits>>,
}

impl SpeedCache {
    fn get(&self, user_id: &str, now: Instant) -> Option<QuotaLimits> {
        let entries = self.entries.lock();
        entries
            .get(user_id)
            .filter(|cached| now.saturating_duration_since(cached.fetched_at) < self.ttl)
            .map(|cached| cached.limits)
    }

    fn put(&self, user_id: &str, limits: QuotaLimits, now: Instant) {
        let mut entries = self.entries.lock();

        if entries.len() >= self.capacity && !entries.contains_key(user_id) {
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, cached)| now.saturating_duration_since(cached.fetched_at) >= self.ttl)
                .take(self.clean_batch)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                entries.remove(id);
            }
            if entries.len() >= self.capacity {
                // Still full: serve this lookup uncached.
                return;
            }
        }

        entries.insert(
            user_id.to_string(),
            CachedLimits {
                limits,
                fetched_at: now,
            },
        );
    }

    fn invalidate(&self, user_id: &str) {
        self.entries.lock().remove(user_id);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct IoLimiter {
    ledger: Arc<QuotaLedger>,
    uploads: TokenBuckets,
    downloads: TokenBuckets,
    speeds: SpeedCache,
}

impl IoLimiter {
    pub fn new(ledger: Arc<QuotaLedger>, config: &LimiterConfig) -> Self {
        let settings = BucketSettings {
            cycle: config.cycle(),
            max_ids: config.max_tracked_ids,
            clean_batch: config.clean_batch,
            stale_cycles: config.stale_cycles,
        };

        Self {
            ledger,
            uploads: TokenBuckets::new(settings),
            downloads: TokenBuckets::new(settings),
            speeds: SpeedCache {
                ttl: config.speed_cache_ttl(),
                capacity: config.speed_cache_size,
                clean_batch: config.clean_batch,
                entries: Mutex::new(HashMap::new()),
            },
        }
    }

    /// Whether `user_id` may write `bytes` now.
    pub fn can_write(&self, user_id: &str, bytes: u64) -> Result<bool> {
        self.access(user_id, Direction::Upload, bytes)
    }

    /// Whether `user_id` may read `bytes` now.
    pub fn can_read(&self, user_id: &str, bytes: u64) -> Result<bool> {
        self.access(user_id, Direction::Download, bytes)
    }

    /// Largest single request `user_id` can ever be granted per cycle.
    pub fn cap(&self, user_id: &str, direction: Direction) -> Result<u64> {
        let limits = self.limits_of(user_id)?;
        Ok(match direction {
            Direction::Upload => limits.upload_speed_limit,
            Direction::Download => limits.download_speed_limit,
        })
    }

    pub fn access(&self, user_id: &str, direction: Direction, bytes: u64) -> Result<bool> {
        let cap = self.cap(user_id, direction)?;
        let buckets = match direction {
            Direction::Upload => &self.uploads,
            Direction::Download => &self.downloads,
        };

        let allowed = buckets.access(user_id, cap, bytes);
        if !allowed {
            debug!(user = %user_id, ?direction, bytes, cap, "Throttled");
        }
        Ok(allowed)
    }

    /// Forget cached limits, e.g. after an admin changed them.
    pub fn invalidate(&self, user_id: &str) {
        self.speeds.invalidate(user_id);
    }

    fn limits_of(&self, user_id: &str) -> Result<QuotaLimits> {
        let now = Instant::now();
        if let Some(limits) = self.speeds.get(user_id, now) {
            return Ok(limits);
        }
        let limits = self.ledger.get(user_id)?.limits();
        self.speeds.put(user_id, limits, now);
        Ok(limits)
    }

    pub fn cached_users(&self) -> usize {
        self.speeds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaStore;
    use crate::DriveError;

    fn limiter(speed_cache_size: usize) -> (Arc<QuotaLedger>, IoLimiter) {
        let ledger = Arc::new(QuotaLedger::new(Arc::new(MetaStore::temporary().unwrap())));
        let config = LimiterConfig {
            cycle_millis: 60_000,
            speed_cache_size,
            ..LimiterConfig::default()
        };
        let limiter = IoLimiter::new(ledger.clone(), &config);
        (ledger, limiter)
    }

    fn limits(up: u64, down: u64) -> QuotaLimits {
        QuotaLimits {
            space_limit: 1 << 20,
            upload_speed_limit: up,
            download_speed_limit: down,
        }
    }

    #[test]
    fn test_directions_use_their_own_limits() {
        let (ledger, limiter) = limiter(16);
        ledger.provision("u", limits(100, 10)).unwrap();

        assert!(limiter.can_write("u", 100).unwrap());
        assert!(!limiter.can_write("u", 1).unwrap());

        assert!(!limiter.can_read("u", 11).unwrap());
        assert!(limiter.can_read("u", 10).unwrap());
        assert!(!limiter.can_read("u", 1).unwrap());
    }

    #[test]
    fn test_cap_per_direction() {
        let (ledger, limiter) = limiter(16);
        ledger.provision("u", limits(100, 10)).unwrap();
        assert_eq!(limiter.cap("u", Direction::Upload).unwrap(), 100);
        assert_eq!(limiter.cap("u", Direction::Download).unwrap(), 10);
    }

    #[test]
    fn test_unknown_user_is_not_found() {
        let (_ledger, limiter) = limiter(16);
        assert!(matches!(limiter.can_write("ghost", 1), Err(DriveError::NotFound(_))));
    }

    #[test]
    fn test_limits_are_cached_until_invalidated() {
        let (ledger, limiter) = limiter(16);
        ledger.provision("u", limits(5, 5)).unwrap();
        assert!(!limiter.can_write("u", 6).unwrap());
        assert_eq!(limiter.cached_users(), 1);

        ledger.provision("u", limits(1000, 5)).unwrap();
        assert!(!limiter.can_write("u", 6).unwrap());

        limiter.invalidate("u");
        assert!(limiter.can_write("u", 6).unwrap());
    }

    #[test]
    fn test_speed_cache_is_bounded() {
        let (ledger, limiter) = limiter(2);
        for user in ["a", "b", "c"] {
            ledger.provision(user, limits(10, 10)).unwrap();
            assert!(limiter.can_write(user, 1).unwrap());
        }
        assert_eq!(limiter.cached_users(), 2);
    }
}
