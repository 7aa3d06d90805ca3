//! Drive - the service object handed to the transport layer
//!
//! Owns one instance of every component and checks the caller's access
//! before delegating. Nothing here is global: tests and embedders can run
//! as many independent drives as they like.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{DriveConfig, QuotaLimits};
use crate::download::DownloadStream;
use crate::limiter::IoLimiter;
use crate::metadata::MetaStore;
use crate::namespace::{self, Caller, Role};
use crate::quota::{QuotaLedger, QuotaSummary, UserQuota};
use crate::sharing::ShareRegistry;
use crate::storage::{EntryInfo, FileStore};
use crate::upload::{ChunkOutcome, UploadManager, UploadRecord, UploadStatus};
use crate::{DriveError, Result};

pub struct Drive {
    config: DriveConfig,
    store: Arc<FileStore>,
    meta: Arc<MetaStore>,
    ledger: Arc<QuotaLedger>,
    limiter: Arc<IoLimiter>,
    uploads: UploadManager,
    shares: ShareRegistry,
}

impl Drive {
    /// Open the file tree and metadata store described by `config`.
    pub fn open(config: DriveConfig) -> Result<Self> {
        let store = Arc::new(FileStore::new(&config.root, config.handles.clone())?);
        let meta = Arc::new(match &config.metadata_path {
            Some(path) => MetaStore::open(path)?,
            None => MetaStore::temporary()?,
        });
        let ledger = Arc::new(QuotaLedger::new(meta.clone()));
        let limiter = Arc::new(IoLimiter::new(ledger.clone(), &config.limiter));
        let uploads = UploadManager::new(
            store.clone(),
            meta.clone(),
            ledger.clone(),
            limiter.clone(),
            config.uploads.clone(),
        );
        let shares = ShareRegistry::new(meta.clone(), config.sharing.clone());

        let repaired = shares.repair_orphans()?;
        info!(root = %config.root.display(), repaired, "Drive opened");

        Ok(Self {
            config,
            store,
            meta,
            ledger,
            limiter,
            uploads,
            shares,
        })
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn limiter(&self) -> &Arc<IoLimiter> {
        &self.limiter
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub fn shares(&self) -> &ShareRegistry {
        &self.shares
    }

    /// Flush handles and metadata. The drive refuses file I/O afterwards.
    pub fn close(&self) -> Result<()> {
        let closed = self.store.close();
        self.meta.flush()?;
        info!("Drive closed");
        closed
    }

    // Access

    fn require_admin(caller: &Caller) -> Result<()> {
        if caller.is_admin() {
            Ok(())
        } else {
            Err(DriveError::PermissionDenied(format!(
                "{} is not an admin",
                caller.user_id
            )))
        }
    }

    fn require_self_or_admin(caller: &Caller, user_id: &str) -> Result<()> {
        if caller.is_admin() || (caller.role == Role::User && caller.user_id == user_id) {
            Ok(())
        } else {
            Err(DriveError::PermissionDenied(format!(
                "{} may not act for {}",
                caller.user_id, user_id
            )))
        }
    }

    /// Writable path plus the user whose quota it is charged to.
    fn authorize_write(&self, caller: &Caller, path: &str) -> Result<(String, String)> {
        let path = namespace::authorize_write(caller, path)?;
        let (owner, path) = namespace::require_files_path(&path)?;
        Ok((owner, path))
    }

    /// Readable: own files, anything for admins, shared directories for all.
    fn authorize_read(&self, caller: &Caller, path: &str) -> Result<String> {
        let path = namespace::clean(path)?;
        if namespace::can_write(caller, &path) {
            return Ok(path);
        }
        if namespace::require_files_path(&path).is_ok()
            && self.shares.enclosing_share(&path)?.is_some()
        {
            return Ok(path);
        }
        Err(DriveError::PermissionDenied(path))
    }

    // Users and quota

    /// Create or update a user's limits and home directory (admin only).
    pub fn provision_user(
        &self,
        caller: &Caller,
        user_id: &str,
        limits: Option<QuotaLimits>,
    ) -> Result<UserQuota> {
        Self::require_admin(caller)?;
        if user_id.is_empty() || user_id.contains('/') || namespace::clean(user_id)? != user_id {
            return Err(DriveError::InvalidPath(user_id.to_string()));
        }

        let quota = self
            .ledger
            .provision(user_id, limits.unwrap_or(self.config.default_quota))?;
        self.store.mkdir_all(&namespace::files_root(user_id))?;
        self.limiter.invalidate(user_id);
        Ok(quota)
    }

    pub fn quota(&self, caller: &Caller, user_id: &str) -> Result<QuotaSummary> {
        Self::require_self_or_admin(caller, user_id)?;
        self.ledger.summary(user_id)
    }

    pub fn can_reserve(&self, caller: &Caller, delta: u64) -> Result<bool> {
        self.ledger.can_reserve(&caller.user_id, delta)
    }

    /// Manual ledger adjustment (admin only). Uploads, cancels and deletes
    /// charge and refund space themselves.
    pub fn reserve(&self, caller: &Caller, user_id: &str, delta: u64) -> Result<u64> {
        Self::require_admin(caller)?;
        self.ledger.reserve(user_id, delta)
    }

    /// Manual ledger adjustment (admin only).
    pub fn release(&self, caller: &Caller, user_id: &str, delta: u64) -> Result<u64> {
        Self::require_admin(caller)?;
        self.ledger.release(user_id, delta)
    }

    pub fn recalculate(&self, caller: &Caller, user_id: &str) -> Result<u64> {
        Self::require_self_or_admin(caller, user_id)?;
        self.uploads.recalculate(user_id)
    }

    // Uploads

    pub fn create_upload(&self, caller: &Caller, target: &str, size: u64) -> Result<ChunkOutcome> {
        let (owner, target) = self.authorize_write(caller, target)?;
        self.uploads.create(&owner, &target, size)
    }

    pub fn upload_chunk(
        &self,
        caller: &Caller,
        target: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<ChunkOutcome> {
        let (owner, target) = self.authorize_write(caller, target)?;
        self.uploads.upload_chunk(&owner, &target, data, offset)
    }

    pub fn upload_status(&self, caller: &Caller, target: &str) -> Result<UploadStatus> {
        let (owner, target) = self.authorize_write(caller, target)?;
        self.uploads.status(&owner, &target)
    }

    pub fn cancel_upload(&self, caller: &Caller, target: &str) -> Result<()> {
        let (owner, target) = self.authorize_write(caller, target)?;
        self.uploads.cancel(&owner, &target)
    }

    pub fn list_uploads(&self, caller: &Caller) -> Result<Vec<UploadRecord>> {
        self.uploads.list(&caller.user_id)
    }

    // Files

    pub fn mkdir(&self, caller: &Caller, path: &str) -> Result<()> {
        let (_, path) = self.authorize_write(caller, path)?;
        self.store.mkdir_all(&path)
    }

    pub fn stat(&self, caller: &Caller, path: &str) -> Result<EntryInfo> {
        let path = self.authorize_read(caller, path)?;
        self.store.stat(&path)
    }

    pub fn list_dir(&self, caller: &Caller, path: &str) -> Result<Vec<EntryInfo>> {
        let path = self.authorize_read(caller, path)?;
        self.store.list_dir(&path)
    }

    /// Delete a file or directory and give its bytes back to the owner.
    ///
    /// Directory sizes come from the file infos below the directory, not
    /// from a cached aggregate. Returns the number of bytes released.
    pub fn delete(&self, caller: &Caller, path: &str) -> Result<u64> {
        let (owner, path) = self.authorize_write(caller, path)?;
        if path == namespace::files_root(&owner) {
            return Err(DriveError::InvalidPath(path));
        }

        // Under the owner's ledger lock no promotion can land in `path`
        // between measuring it and removing it.
        let freed = self.ledger.with_locked(&owner, |quota| {
            let entry = self.store.stat(&path)?;
            let infos = self.meta.scan_files(&path)?;
            let freed = if entry.is_dir {
                infos.iter().filter(|info| !info.is_dir).map(|info| info.size).sum()
            } else {
                self.meta
                    .get_file(&path)?
                    .map(|info| info.size)
                    .unwrap_or(entry.size)
            };

            for info in infos.iter().filter(|info| info.is_shared()) {
                match self.shares.del_sharing(&info.path) {
                    Ok(_) | Err(DriveError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }

            self.store.remove(&path)?;
            for info in &infos {
                self.meta.remove_file(&info.path)?;
            }

            if let Err(err) = quota.refund(&owner, freed) {
                warn!(user = %owner, error = %err, "Ledger out of sync, recalculating");
                let used = self.uploads.usage_of(&owner)?;
                quota.reset_used(&owner, used);
            }
            Ok(freed)
        })?;

        info!(user = %owner, path = %path, freed, "Deleted");
        Ok(freed)
    }

    /// Move a file or directory within one user's files tree.
    pub fn move_path(&self, caller: &Caller, from: &str, to: &str) -> Result<()> {
        let (from_owner, from) = self.authorize_write(caller, from)?;
        let (to_owner, to) = self.authorize_write(caller, to)?;
        if from_owner != to_owner {
            return Err(DriveError::InvalidPath(format!("{} -> {}", from, to)));
        }
        if from == namespace::files_root(&from_owner) || namespace::is_within(&to, &from) {
            return Err(DriveError::InvalidPath(format!("{} -> {}", from, to)));
        }

        // Uploads are created and promoted under the same lock, so none can
        // start targeting `from` while it moves.
        self.ledger.with_locked(&from_owner, |_| {
            let pending = self
                .uploads
                .list(&from_owner)?
                .into_iter()
                .filter(|record| namespace::is_within(&record.target_path, &from))
                .count();
            if pending > 0 {
                return Err(DriveError::Conflict(format!(
                    "{} has {} uploads in flight",
                    from, pending
                )));
            }

            self.store.mkdir_all(namespace::parent(&to))?;
            self.store.rename(&from, &to)?;
            self.shares.relocate(&from, &to)?;
            Ok(())
        })?;

        info!(user = %from_owner, from = %from, to = %to, "Moved");
        Ok(())
    }

    /// Stream a file. The download budget charged is the caller's, or the
    /// owner's for visitors reading a shared directory.
    pub fn open_download(&self, caller: &Caller, path: &str) -> Result<DownloadStream> {
        let path = self.authorize_read(caller, path)?;
        let charged = match caller.role {
            Role::Visitor => namespace::owner_of(&path).unwrap_or_default().to_string(),
            _ => caller.user_id.clone(),
        };
        let reader = self.store.open_reader(&path)?;
        Ok(DownloadStream::new(reader, self.limiter.clone(), charged))
    }

    // Sharing

    pub fn add_sharing(&self, caller: &Caller, dir: &str) -> Result<String> {
        let (_, dir) = self.authorize_write(caller, dir)?;
        if !self.store.stat(&dir)?.is_dir {
            return Err(DriveError::NotADirectory(dir));
        }
        self.shares.add_sharing(&dir)
    }

    pub fn del_sharing(&self, caller: &Caller, dir: &str) -> Result<()> {
        let (_, dir) = self.authorize_write(caller, dir)?;
        self.shares.del_sharing(&dir).map(|_| ())
    }

    pub fn is_sharing(&self, caller: &Caller, dir: &str) -> Result<bool> {
        let dir = self.authorize_read(caller, dir)?;
        self.shares.is_sharing(&dir)
    }

    /// The caller's shared directories (every user's for admins).
    pub fn list_sharings(&self, caller: &Caller) -> Result<BTreeMap<String, String>> {
        match caller.role {
            Role::Admin => self.shares.list_sharings(""),
            Role::User => self.shares.list_sharings(&namespace::files_root(&caller.user_id)),
            Role::Visitor => Err(DriveError::PermissionDenied("visitor".to_string())),
        }
    }

    /// Path behind a public share id. Open to everyone.
    pub fn resolve_share(&self, share_id: &str) -> Result<String> {
        self.shares.resolve(share_id)
    }
}
