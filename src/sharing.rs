//! Share-ID Registry
//!
//! Maps short public identifiers to shared directories. The forward
//! mapping (id -> path) lives in the `shares` tree; the reverse one is the
//! `share_id` field of the directory's [`FileInfo`].
//!
//! Older data may hold several ids for the same path or ids whose file
//! info is gone. Unsharing therefore removes every id pointing at the path
//! instead of trusting the recorded one, and [`ShareRegistry::repair_orphans`]
//! sweeps the whole table.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SharingConfig;
use crate::hashing::short_digest;
use crate::metadata::{FileInfo, MetaStore};
use crate::namespace;
use crate::{DriveError, Result};

pub struct ShareRegistry {
    meta: Arc<MetaStore>,
    config: SharingConfig,
    /// Serializes id allocation and removal so ids stay unique
    write_lock: Mutex<()>,
}

impl ShareRegistry {
    pub fn new(meta: Arc<MetaStore>, config: SharingConfig) -> Self {
        Self {
            meta,
            config,
            write_lock: Mutex::new(()),
        }
    }

    fn candidate(&self, path: &str, attempt: u32) -> String {
        if attempt == 0 {
            return short_digest(path, self.config.id_len);
        }
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        short_digest(&format!("{}\n{}\n{}", path, nanos, attempt), self.config.id_len)
    }

    /// Pick an id for `path`: free, or already mapped to `path` itself.
    pub fn generate_id(&self, path: &str) -> Result<String> {
        for attempt in 0..self.config.id_attempts {
            let id = self.candidate(path, attempt);
            match self.meta.get_share(&id)? {
                None => return Ok(id),
                Some(existing) if existing == path => return Ok(id),
                Some(existing) => {
                    debug!(id = %id, path = %path, taken_by = %existing, "Share id collision");
                }
            }
        }
        Err(DriveError::Conflict(format!(
            "no free share id for {} after {} attempts",
            path, self.config.id_attempts
        )))
    }

    /// Share `path`, returning its id. Sharing twice returns the same id.
    pub fn add_sharing(&self, path: &str) -> Result<String> {
        let path = namespace::clean(path)?;
        let _guard = self.write_lock.lock();

        if let Some(id) = self.current_id(&path)? {
            return Ok(id);
        }

        let id = self.generate_id(&path)?;
        self.meta.put_share(&id, &path)?;

        let mut info = self
            .meta
            .get_file(&path)?
            .unwrap_or_else(|| FileInfo::dir(&path));
        info.share_id = id.clone();
        self.meta.put_file(&info)?;

        info!(path = %path, id = %id, "Sharing added");
        Ok(id)
    }

    /// Stop sharing `path`. Every id that maps to it is removed.
    pub fn del_sharing(&self, path: &str) -> Result<usize> {
        let path = namespace::clean(path)?;
        let _guard = self.write_lock.lock();
        let removed = self.remove_mappings_to(&path)?;

        let mut was_flagged = false;
        if let Some(mut info) = self.meta.get_file(&path)? {
            if info.is_shared() {
                was_flagged = true;
                info.share_id.clear();
                self.meta.put_file(&info)?;
            }
        }

        if removed == 0 && !was_flagged {
            return Err(DriveError::NotFound(path));
        }
        if removed > 1 {
            warn!(path = %path, removed, "Removed stale share ids");
        }
        info!(path = %path, "Sharing removed");
        Ok(removed)
    }

    fn remove_mappings_to(&self, path: &str) -> Result<usize> {
        let mut removed = 0;
        for (id, mapped) in self.meta.share_entries()? {
            if mapped == path {
                self.meta.remove_share(&id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Id recorded for `path` when both directions agree.
    fn current_id(&self, path: &str) -> Result<Option<String>> {
        let Some(info) = self.meta.get_file(path)? else {
            return Ok(None);
        };
        if !info.is_shared() {
            return Ok(None);
        }
        match self.meta.get_share(&info.share_id)? {
            Some(mapped) if mapped == path => Ok(Some(info.share_id)),
            _ => Ok(None),
        }
    }

    pub fn is_sharing(&self, path: &str) -> Result<bool> {
        Ok(self.share_id_of(path)?.is_some())
    }

    pub fn share_id_of(&self, path: &str) -> Result<Option<String>> {
        self.current_id(&namespace::clean(path)?)
    }

    pub fn resolve(&self, share_id: &str) -> Result<String> {
        self.meta
            .get_share(share_id)?
            .ok_or_else(|| DriveError::NotFound(format!("share {}", share_id)))
    }

    /// Shared directories at or below `prefix`, path -> id.
    pub fn list_sharings(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let prefix = namespace::clean(prefix)?;
        Ok(self
            .meta
            .scan_files(&prefix)?
            .into_iter()
            .filter(|info| info.is_dir && info.is_shared())
            .map(|info| (info.path, info.share_id))
            .collect())
    }

    /// Shared directory containing `path`, if any.
    pub fn enclosing_share(&self, path: &str) -> Result<Option<String>> {
        let mut current = namespace::clean(path)?;
        loop {
            if self.current_id(&current)?.is_some() {
                return Ok(Some(current));
            }
            if current.is_empty() {
                return Ok(None);
            }
            current = namespace::parent(&current).to_string();
        }
    }

    /// Re-key the file infos at or below `from` to live below `to`, keeping
    /// share ids attached to the moved directories.
    pub fn relocate(&self, from: &str, to: &str) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let infos = self.meta.scan_files(from)?;
        let moved = infos.len();

        for mut info in infos {
            let new_path = format!("{}{}", to, &info.path[from.len()..]);
            self.meta.remove_file(&info.path)?;
            if info.is_shared() {
                self.remove_mappings_to(&info.path)?;
                self.meta.put_share(&info.share_id, &new_path)?;
            }
            info.path = new_path;
            self.meta.put_file(&info)?;
        }

        debug!(from = %from, to = %to, moved, "Relocated file infos");
        Ok(moved)
    }

    /// Drop ids whose directory no longer points back at them, and clear
    /// share flags whose id is missing. Returns the number of repairs.
    pub fn repair_orphans(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut repaired = 0;

        for (id, path) in self.meta.share_entries()? {
            let points_back = self
                .meta
                .get_file(&path)?
                .map(|info| info.share_id == id)
                .unwrap_or(false);
            if !points_back {
                self.meta.remove_share(&id)?;
                repaired += 1;
            }
        }

        for mut info in self.meta.scan_files("")? {
            if info.is_shared() && self.meta.get_share(&info.share_id)?.as_deref() != Some(info.path.as_str()) {
                info.share_id.clear();
                self.meta.put_file(&info)?;
                repaired += 1;
            }
        }

        if repaired > 0 {
            warn!(repaired, "Repaired orphaned share mappings");
        }
        Ok(repaired)
    }
}
