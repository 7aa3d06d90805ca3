//! Upload Manager - Resumable chunked uploads
//!
//! An upload is staged in a deterministic temporary file under the owner's
//! `.uploadings` directory and tracked by an [`UploadRecord`]. Chunks must
//! arrive strictly in order: each one has to start exactly at the number of
//! bytes already accepted. Once the last byte lands the temporary file is
//! renamed into place (promotion) and the record is dropped.
//!
//! Space is reserved from the owner's quota when the upload is created and
//! handed back if it is cancelled.
//!
//! Every operation on one upload runs under a per-temp-path lock taken with
//! `try_lock`; a second caller gets `LockContention` immediately and is
//! expected to retry.

mod naming;

pub use naming::duplicate_name;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::hashing;
use crate::limiter::{Direction, IoLimiter};
use crate::locks::KeyedLocks;
use crate::metadata::{FileInfo, MetaStore};
use crate::namespace;
use crate::quota::QuotaLedger;
use crate::storage::FileStore;
use crate::{DriveError, Result};

const HASH_CHUNK: usize = 64 * 1024;

/// Persistent state of one in-flight upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub owner_id: String,
    /// Final location requested by the client
    pub target_path: String,
    pub tmp_path: String,
    pub size: u64,
    /// Bytes durably written, always `<= size`
    pub uploaded: u64,
    pub created_at: i64,
}

impl UploadRecord {
    pub fn new(owner_id: &str, target_path: &str, tmp_path: &str, size: u64) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            target_path: target_path.to_string(),
            tmp_path: tmp_path.to_string(),
            size,
            uploaded: 0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Uploading,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub size: u64,
    pub uploaded: u64,
    pub state: UploadState,
}

/// Result of `create` and `upload_chunk`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOutcome {
    pub size: u64,
    pub uploaded: u64,
    /// Where the file ended up, once promoted
    pub final_path: Option<String>,
}

impl ChunkOutcome {
    pub fn is_complete(&self) -> bool {
        self.final_path.is_some()
    }
}

pub struct UploadManager {
    store: Arc<FileStore>,
    meta: Arc<MetaStore>,
    ledger: Arc<QuotaLedger>,
    limiter: Arc<IoLimiter>,
    upload_locks: KeyedLocks,
    promote_locks: KeyedLocks,
    config: UploadConfig,
}

impl UploadManager {
    pub fn new(
        store: Arc<FileStore>,
        meta: Arc<MetaStore>,
        ledger: Arc<QuotaLedger>,
        limiter: Arc<IoLimiter>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            meta,
            ledger,
            limiter,
            upload_locks: KeyedLocks::new(),
            promote_locks: KeyedLocks::new(),
            config,
        }
    }

    /// Start an upload of `size` bytes to `target`, reserving the space.
    ///
    /// Zero-byte uploads are promoted immediately.
    pub fn create(&self, owner_id: &str, target: &str, size: u64) -> Result<ChunkOutcome> {
        let target = namespace::clean(target)?;
        let tmp = namespace::tmp_path(owner_id, &target);

        let lock = self.upload_locks.handle(&tmp);
        let _guard = lock
            .try_lock()
            .ok_or_else(|| DriveError::LockContention(target.clone()))?;

        if self.meta.get_upload(&tmp)?.is_some() {
            return Err(DriveError::AlreadyExists(target));
        }

        // Charge and stage under the owner's ledger lock: the reservation
        // and the record appear together or not at all.
        let record = UploadRecord::new(owner_id, &target, &tmp, size);
        self.ledger.with_locked(owner_id, |quota| {
            quota.charge(owner_id, size)?;
            self.stage(&record)
        })?;

        info!(user = %owner_id, path = %target, size, "Upload created");

        if size == 0 {
            let final_path = self.promote(&record)?;
            return Ok(ChunkOutcome {
                size,
                uploaded: 0,
                final_path: Some(final_path),
            });
        }

        Ok(ChunkOutcome {
            size,
            uploaded: 0,
            final_path: None,
        })
    }

    /// Create the temporary file, the target's directory and the record.
    fn stage(&self, record: &UploadRecord) -> Result<()> {
        self.store
            .mkdir_all(&namespace::uploads_root(&record.owner_id))?;

        // No record but a file: left behind by a crash between the two writes.
        if self.store.exists(&record.tmp_path)? {
            warn!(path = %record.tmp_path, "Replacing orphaned temporary file");
            self.store.remove(&record.tmp_path)?;
        }
        self.store.create(&record.tmp_path)?;

        let finish = self
            .store
            .mkdir_all(namespace::parent(&record.target_path))
            .and_then(|_| self.meta.put_upload(record));

        if let Err(err) = finish {
            if let Err(remove_err) = self.store.remove(&record.tmp_path) {
                warn!(path = %record.tmp_path, error = %remove_err, "Failed to remove temporary file");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Append `data` at `offset`, which must equal the bytes accepted so
    /// far. The final chunk triggers promotion.
    ///
    /// On any failure the record keeps its last good `uploaded` value so
    /// the client can resume from there.
    pub fn upload_chunk(
        &self,
        owner_id: &str,
        target: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<ChunkOutcome> {
        let target = namespace::clean(target)?;
        let tmp = namespace::tmp_path(owner_id, &target);

        let lock = self.upload_locks.handle(&tmp);
        let _guard = lock
            .try_lock()
            .ok_or_else(|| DriveError::LockContention(target.clone()))?;

        let mut record = self
            .meta
            .get_upload(&tmp)?
            .ok_or_else(|| DriveError::NotFound(target.clone()))?;

        if record.uploaded > record.size {
            return Err(DriveError::InvalidState(format!(
                "upload {} has {} of {} bytes",
                target, record.uploaded, record.size
            )));
        }
        if offset != record.uploaded {
            return Err(DriveError::OffsetMismatch {
                expected: record.uploaded,
                got: offset,
            });
        }

        let len = data.len() as u64;
        let remaining = record.size - record.uploaded;
        if len > remaining {
            return Err(DriveError::ChunkTooLarge {
                remaining,
                got: len,
            });
        }

        let cap = self.limiter.cap(owner_id, Direction::Upload)?;
        if len > cap {
            return Err(DriveError::OverRateCap { cap, got: len });
        }
        if !self.limiter.can_write(owner_id, len)? {
            return Err(DriveError::RateLimited(target));
        }

        let written = self.store.write_at(&tmp, data, offset)? as u64;
        record.uploaded += written;
        self.meta.put_upload(&record)?;
        debug!(user = %owner_id, path = %target, uploaded = record.uploaded, size = record.size, "Chunk written");

        let final_path = if record.uploaded == record.size {
            Some(self.promote(&record)?)
        } else {
            None
        };

        Ok(ChunkOutcome {
            size: record.size,
            uploaded: record.uploaded,
            final_path,
        })
    }

    /// Move a finished temporary file into the files tree. An occupied
    /// target gets the first free `_N` sibling name.
    ///
    /// All candidate names share the target's directory, so the promote
    /// lock is keyed by that directory. The rename and the record swap run
    /// under the owner's ledger lock so a recalculation never sees both the
    /// committed file and its record.
    fn promote(&self, record: &UploadRecord) -> Result<String> {
        let content_hash = match self.hash_file(&record.tmp_path) {
            Ok(hash) => hash.to_hex(),
            Err(err) => {
                warn!(path = %record.tmp_path, error = %err, "Failed to hash upload");
                String::new()
            }
        };

        let dir = namespace::parent(&record.target_path);
        let lock = self.promote_locks.handle(dir);
        let _guard = lock.lock();

        let final_path = self.ledger.with_locked(&record.owner_id, |_| {
            // The directory may have been removed while the upload was in flight.
            self.store.mkdir_all(dir)?;
            let final_path = self.free_name(&record.target_path)?;
            self.store.rename(&record.tmp_path, &final_path)?;
            self.meta.remove_upload(&record.tmp_path)?;
            self.meta
                .put_file(&FileInfo::file(&final_path, record.size, content_hash))?;
            Ok(final_path)
        })?;

        info!(user = %record.owner_id, path = %final_path, size = record.size, "Upload promoted");
        self.upload_locks.prune();
        self.promote_locks.prune();
        Ok(final_path)
    }

    fn free_name(&self, target: &str) -> Result<String> {
        if !self.store.exists(target)? {
            return Ok(target.to_string());
        }
        for n in 1..=self.config.max_duplicates {
            let candidate = duplicate_name(target, n);
            if !self.store.exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(DriveError::TooManyDuplicates(target.to_string()))
    }

    fn hash_file(&self, path: &str) -> Result<hashing::ContentHash> {
        let mut reader = self.store.open_reader(path)?;
        let hash = hashing::hash_reader(&mut reader, HASH_CHUNK)?;
        reader.close();
        Ok(hash)
    }

    /// Progress of an upload, or the size of the file already at `target`.
    pub fn status(&self, owner_id: &str, target: &str) -> Result<UploadStatus> {
        let target = namespace::clean(target)?;
        let tmp = namespace::tmp_path(owner_id, &target);

        if let Some(record) = self.meta.get_upload(&tmp)? {
            return Ok(UploadStatus {
                size: record.size,
                uploaded: record.uploaded,
                state: UploadState::Uploading,
            });
        }

        let size = match self.meta.get_file(&target)? {
            Some(info) if !info.is_dir => info.size,
            _ => match self.store.stat(&target) {
                Ok(entry) if !entry.is_dir => entry.size,
                Ok(_) | Err(DriveError::NotFound(_)) => {
                    return Err(DriveError::NotFound(target));
                }
                Err(err) => return Err(err),
            },
        };

        Ok(UploadStatus {
            size,
            uploaded: size,
            state: UploadState::Completed,
        })
    }

    /// Abort an upload: drop the temporary file and record and return the
    /// reserved space.
    pub fn cancel(&self, owner_id: &str, target: &str) -> Result<()> {
        let target = namespace::clean(target)?;
        let tmp = namespace::tmp_path(owner_id, &target);

        let lock = self.upload_locks.handle(&tmp);
        let _guard = lock
            .try_lock()
            .ok_or_else(|| DriveError::LockContention(target.clone()))?;

        if self.meta.get_upload(&tmp)?.is_none() {
            return Err(DriveError::NotFound(target));
        }

        self.ledger.with_locked(owner_id, |quota| {
            match self.store.remove(&tmp) {
                Ok(()) | Err(DriveError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }

            // Only the caller that actually removes the record gives space back.
            if let Some(record) = self.meta.remove_upload(&tmp)? {
                if quota.refund(owner_id, record.size).is_err() {
                    let used = self.usage_of(owner_id)?;
                    quota.reset_used(owner_id, used);
                }
                info!(user = %owner_id, path = %target, size = record.size, "Upload cancelled");
            }
            Ok(())
        })?;

        self.upload_locks.prune();
        Ok(())
    }

    /// In-flight uploads of `owner_id`.
    pub fn list(&self, owner_id: &str) -> Result<Vec<UploadRecord>> {
        self.meta.scan_uploads(owner_id)
    }

    /// Committed bytes under the owner's files tree plus the declared sizes
    /// of their in-flight uploads. Callers hold the owner's ledger lock.
    pub(crate) fn usage_of(&self, owner_id: &str) -> Result<u64> {
        let committed = match self.store.disk_usage(&namespace::files_root(owner_id)) {
            Ok(bytes) => bytes,
            Err(DriveError::NotFound(_)) => 0,
            Err(err) => return Err(err),
        };
        let reserved: u64 = self.list(owner_id)?.iter().map(|r| r.size).sum();
        debug!(user = %owner_id, committed, reserved, "Measured usage");
        Ok(committed + reserved)
    }

    /// Recompute `owner_id`'s used space from disk and upload records.
    /// Scan and write happen under the owner's ledger lock.
    pub fn recalculate(&self, owner_id: &str) -> Result<u64> {
        let used = self.ledger.with_locked(owner_id, |quota| {
            let used = self.usage_of(owner_id)?;
            quota.reset_used(owner_id, used);
            Ok(used)
        })?;
        info!(user = %owner_id, used, "Recalculated used space");
        Ok(used)
    }
}
