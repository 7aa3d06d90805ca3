//! Keyed token buckets with refill-on-demand.
//!
//! Each id gets a bucket holding at most `cap` tokens per cycle. A request
//! is granted from the remaining tokens; once they run out the bucket only
//! refills when a full cycle has passed since the last refill. Nothing runs
//! on a timer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// Settings for one bucket set
#[derive(Debug, Clone, Copy)]
pub struct BucketSettings {
    pub cycle: Duration,
    /// Distinct ids tracked before new ids are refused
    pub max_ids: usize,
    /// Stale buckets evicted per cleanup pass
    pub clean_batch: usize,
    /// Buckets whose last refill is older than this many cycles are stale
    pub stale_cycles: u32,
}

pub struct TokenBuckets {
    settings: BucketSettings,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBuckets {
    pub fn new(settings: BucketSettings) -> Self {
        Self {
            settings,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to spend `requested` tokens from `id`'s bucket of size `cap`.
    pub fn access(&self, id: &str, cap: u64, requested: u64) -> bool {
        self.access_at(id, cap, requested, Instant::now())
    }

    pub(crate) fn access_at(&self, id: &str, cap: u64, requested: u64, now: Instant) -> bool {
        if requested > cap {
            return false;
        }

        let mut buckets = self.buckets.lock();

        if let Some(bucket) = buckets.get_mut(id) {
            if bucket.tokens >= requested {
                bucket.tokens -= requested;
                return true;
            }
            if now.saturating_duration_since(bucket.last_refill) < self.settings.cycle {
                return false;
            }
            bucket.tokens = cap - requested;
            bucket.last_refill = now;
            return true;
        }

        if buckets.len() >= self.settings.max_ids {
            let evicted = self.clean(&mut buckets, now);
            debug!(evicted, tracked = buckets.len(), "Cleaned stale buckets");
            if buckets.len() >= self.settings.max_ids {
                return false;
            }
        }

        buckets.insert(
            id.to_string(),
            Bucket {
                tokens: cap - requested,
                last_refill: now,
            },
        );
        true
    }

    /// Remove up to `clean_batch` buckets not refilled for `stale_cycles`.
    fn clean(&self, buckets: &mut HashMap<String, Bucket>, now: Instant) -> usize {
        let stale_after = self.settings.cycle * self.settings.stale_cycles;
        let stale: Vec<String> = buckets
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.last_refill) > stale_after)
            .take(self.settings.clean_batch)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            buckets.remove(id);
        }
        stale.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}
