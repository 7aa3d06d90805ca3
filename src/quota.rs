//! Quota Ledger
//!
//! Tracks how much space each user occupies. `used_space` counts committed
//! files plus the declared size of every upload still in flight, so space
//! is charged when an upload starts rather than when it finishes.
//!
//! Read-modify-write cycles on a user's record run under that user's lock;
//! different users never contend.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::QuotaLimits;
use crate::locks::KeyedLocks;
use crate::metadata::MetaStore;
use crate::{DriveError, Result};

/// Persistent quota record of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    pub space_limit: u64,
    pub upload_speed_limit: u64,
    pub download_speed_limit: u64,
    pub used_space: u64,
}

impl UserQuota {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            space_limit: limits.space_limit,
            upload_speed_limit: limits.upload_speed_limit,
            download_speed_limit: limits.download_speed_limit,
            used_space: 0,
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            space_limit: self.space_limit,
            upload_speed_limit: self.upload_speed_limit,
            download_speed_limit: self.download_speed_limit,
        }
    }

    /// Remaining space
    pub fn available(&self) -> u64 {
        self.space_limit.saturating_sub(self.used_space)
    }

    /// Check if `size` more bytes fit under the limit
    pub fn can_reserve(&self, size: u64) -> bool {
        self.used_space
            .checked_add(size)
            .map(|total| total <= self.space_limit)
            .unwrap_or(false)
    }

    /// Add `delta` bytes, all or nothing.
    pub fn charge(&mut self, user_id: &str, delta: u64) -> Result<()> {
        if !self.can_reserve(delta) {
            return Err(DriveError::QuotaExceeded {
                user: user_id.to_string(),
                used: self.used_space,
                requested: delta,
                limit: self.space_limit,
            });
        }
        self.used_space += delta;
        Ok(())
    }

    /// Subtract `delta` bytes. Going below zero points at an accounting
    /// bug upstream and leaves the record untouched.
    pub fn refund(&mut self, user_id: &str, delta: u64) -> Result<()> {
        let Some(remaining) = self.used_space.checked_sub(delta) else {
            warn!(user = %user_id, used = self.used_space, delta, "Release below zero");
            return Err(DriveError::InvalidState(format!(
                "release of {} bytes exceeds used space {} of {}",
                delta, self.used_space, user_id
            )));
        };
        self.used_space = remaining;
        Ok(())
    }

    /// Replace `used_space` with a recomputed value.
    pub fn reset_used(&mut self, user_id: &str, used_space: u64) {
        if self.used_space != used_space {
            info!(user = %user_id, old = self.used_space, new = used_space, "Corrected used space");
        }
        self.used_space = used_space;
    }

    /// Get quota status as percentage (0-100)
    pub fn usage_percentage(&self) -> f64 {
        if self.space_limit == 0 {
            return 100.0;
        }
        (self.used_space as f64 / self.space_limit as f64 * 100.0).min(100.0)
    }
}

/// User quota summary for UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSummary {
    pub space_limit: u64,
    pub used_space: u64,
    pub available_space: u64,
    pub usage_percentage: f64,
    pub upload_speed_limit: u64,
    pub download_speed_limit: u64,
    pub uploads_in_flight: usize,
}

/// The only component that mutates `used_space`.
pub struct QuotaLedger {
    meta: Arc<MetaStore>,
    locks: KeyedLocks,
}

impl QuotaLedger {
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self {
            meta,
            locks: KeyedLocks::new(),
        }
    }

    /// Create a user's quota or replace its limits, keeping `used_space`.
    pub fn provision(&self, user_id: &str, limits: QuotaLimits) -> Result<UserQuota> {
        let lock = self.locks.handle(user_id);
        let _guard = lock.lock();

        let quota = match self.meta.get_quota(user_id)? {
            Some(mut quota) => {
                quota.space_limit = limits.space_limit;
                quota.upload_speed_limit = limits.upload_speed_limit;
                quota.download_speed_limit = limits.download_speed_limit;
                quota
            }
            None => UserQuota::new(limits),
        };
        self.meta.put_quota(user_id, &quota)?;

        info!(user = %user_id, space_limit = quota.space_limit, "Provisioned quota");
        Ok(quota)
    }

    pub fn get(&self, user_id: &str) -> Result<UserQuota> {
        self.meta
            .get_quota(user_id)?
            .ok_or_else(|| DriveError::NotFound(format!("quota of {}", user_id)))
    }

    /// Whether `delta` bytes could be reserved right now (advisory only).
    pub fn can_reserve(&self, user_id: &str, delta: u64) -> Result<bool> {
        Ok(self.get(user_id)?.can_reserve(delta))
    }

    /// Charge `delta` bytes to the user, all or nothing. Returns the new
    /// used space.
    pub fn reserve(&self, user_id: &str, delta: u64) -> Result<u64> {
        self.with_locked(user_id, |quota| {
            quota.charge(user_id, delta)?;
            Ok(quota.used_space)
        })
    }

    /// Give back `delta` bytes. Releasing more than is used fails without
    /// touching the record.
    pub fn release(&self, user_id: &str, delta: u64) -> Result<u64> {
        self.with_locked(user_id, |quota| {
            quota.refund(user_id, delta)?;
            Ok(quota.used_space)
        })
    }

    /// Overwrite `used_space` with a recomputed value.
    pub fn reset_used(&self, user_id: &str, used_space: u64) -> Result<u64> {
        self.with_locked(user_id, |quota| {
            quota.reset_used(user_id, used_space);
            Ok(used_space)
        })
    }

    pub fn summary(&self, user_id: &str) -> Result<QuotaSummary> {
        let quota = self.get(user_id)?;
        let uploads_in_flight = self.meta.scan_uploads(user_id)?.len();

        Ok(QuotaSummary {
            space_limit: quota.space_limit,
            used_space: quota.used_space,
            available_space: quota.available(),
            usage_percentage: quota.usage_percentage(),
            upload_speed_limit: quota.upload_speed_limit,
            download_speed_limit: quota.download_speed_limit,
            uploads_in_flight,
        })
    }

    /// Run `body` on the user's record while holding their lock. The record
    /// is written back only when `body` succeeds, so file changes made
    /// inside it commit together with the ledger change. `body` must not
    /// call back into the ledger for the same user.
    pub fn with_locked<T, F>(&self, user_id: &str, body: F) -> Result<T>
    where
        F: FnOnce(&mut UserQuota) -> Result<T>,
    {
        let lock = self.locks.handle(user_id);
        let _guard = lock.lock();

        let mut quota = self.get(user_id)?;
        let before = quota.clone();
        let out = body(&mut quota)?;
        if quota != before {
            self.meta.put_quota(user_id, &quota)?;
        }
        Ok(out)
    }
}
