//! Bounded cache of OS file handles over a rooted directory tree
//!
//! Handles are opened lazily on first read/write and stay open until they
//! sit idle past the configured TTL. Idle handles are closed in small
//! batches whenever a lookup misses the cache, from the optional background
//! sweeper, and all at once by [`FileStore::sync`] / [`FileStore::close`].
//! When the cache is full and nothing is idle the call fails with
//! `TooManyOpenHandles` instead of waiting.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::FileReader;
use crate::config::HandleCacheConfig;
use crate::namespace;
use crate::{DriveError, Result};

/// A cached handle. One per distinct real path.
struct OpenFile {
    virtual_path: String,
    last_access: Instant,
    file: File,
}

type Entry = Arc<Mutex<OpenFile>>;

/// Directory listing / stat result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Modification time (unix seconds), when the platform reports one
    pub modified_at: Option<i64>,
}

impl EntryInfo {
    fn from_metadata(name: String, meta: &fs::Metadata) -> Self {
        Self {
            name,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified_at: meta
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp()),
        }
    }
}

pub struct FileStore {
    root: PathBuf,
    config: HandleCacheConfig,
    opens: Mutex<HashMap<PathBuf, Entry>>,
    open_readers: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>, config: HandleCacheConfig) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), max_open = config.max_open, "File store ready");

        Ok(Self {
            root,
            config,
            opens: Mutex::new(HashMap::new()),
            open_readers: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a virtual path onto the real file system, always below the root.
    pub fn translate(&self, virtual_path: &str) -> Result<PathBuf> {
        let cleaned = namespace::clean(virtual_path)?;
        let mut real = self.root.clone();
        for segment in cleaned.split('/').filter(|s| !s.is_empty()) {
            real.push(segment);
        }
        Ok(real)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriveError::Closed);
        }
        Ok(())
    }

    /// Create a new empty file and keep its handle cached.
    ///
    /// Fails with `AlreadyExists` rather than truncating an existing file.
    pub fn create(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let real = self.translate(path)?;

        let mut opens = self.opens.lock();
        self.reserve_slot(&mut opens)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&real)
            .map_err(|e| DriveError::from_io(e, path))?;

        debug!(path = %path, "Created file");
        opens.insert(real, new_entry(path, file));
        Ok(())
    }

    /// Write all of `data` at `offset`. Returns the number of bytes written.
    pub fn write_at(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        let entry = self.acquire(path)?;
        let mut open = entry.lock();
        open.last_access = Instant::now();

        open.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| DriveError::from_io(e, path))?;
        open.file
            .write_all(data)
            .map_err(|e| DriveError::from_io(e, path))?;
        Ok(data.len())
    }

    /// Read into `buf` from `offset` until the buffer is full or the file
    /// ends. Returns the number of bytes read.
    pub fn read_at(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let entry = self.acquire(path)?;
        let mut open = entry.lock();
        open.last_access = Instant::now();

        open.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| DriveError::from_io(e, path))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = open
                .file
                .read(&mut buf[filled..])
                .map_err(|e| DriveError::from_io(e, path))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Cached handle for `path`, opening it on a miss.
    fn acquire(&self, path: &str) -> Result<Entry> {
        self.ensure_open()?;
        let real = self.translate(path)?;

        let mut opens = self.opens.lock();
        if let Some(entry) = opens.get(&real) {
            return Ok(entry.clone());
        }

        self.reserve_slot(&mut opens)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&real)
            .map_err(|e| DriveError::from_io(e, path))?;

        debug!(path = %path, open = opens.len() + 1, "Opened cached handle");
        let entry = new_entry(path, file);
        opens.insert(real, entry.clone());
        Ok(entry)
    }

    /// Make room for one more handle, sweeping idle ones first.
    fn reserve_slot(&self, opens: &mut HashMap<PathBuf, Entry>) -> Result<()> {
        self.sweep_locked(opens, Instant::now());
        if opens.len() >= self.config.max_open {
            return Err(DriveError::TooManyOpenHandles(self.config.max_open));
        }
        Ok(())
    }

    /// Close up to `sweep_batch` handles idle longer than the TTL.
    /// Handles currently borrowed by another call are never closed here.
    fn sweep_locked(&self, opens: &mut HashMap<PathBuf, Entry>, now: Instant) -> usize {
        let ttl = self.config.idle_ttl();
        let expired: Vec<PathBuf> = opens
            .iter()
            .filter(|(_, entry)| Arc::strong_count(entry) == 1)
            .filter(|(_, entry)| {
                entry
                    .try_lock()
                    .map(|open| now.saturating_duration_since(open.last_access) >= ttl)
                    .unwrap_or(false)
            })
            .take(self.config.sweep_batch)
            .map(|(real, _)| real.clone())
            .collect();

        for real in &expired {
            if let Some(entry) = opens.remove(real) {
                debug!(path = %entry.lock().virtual_path, "Evicted idle handle");
            }
        }
        expired.len()
    }

    /// Run one eviction pass. Returns the number of handles closed.
    pub fn sweep(&self) -> usize {
        let mut opens = self.opens.lock();
        self.sweep_locked(&mut opens, Instant::now())
    }

    /// Drop cached handles for `real` and anything below it.
    fn forget(&self, real: &Path) {
        let mut opens = self.opens.lock();
        opens.retain(|cached, _| !cached.starts_with(real));
    }

    /// Rename `from` to `to`. An existing `to` is never overwritten.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_open()?;
        let real_from = self.translate(from)?;
        let real_to = self.translate(to)?;

        if self.exists_real(&real_to, to)? {
            return Err(DriveError::AlreadyExists(to.to_string()));
        }

        self.forget(&real_from);
        self.forget(&real_to);
        fs::rename(&real_from, &real_to).map_err(|e| {
            // NotFound with the source in place means the destination's
            // directory is missing.
            let blame = if e.kind() == std::io::ErrorKind::NotFound && real_from.exists() {
                to
            } else {
                from
            };
            DriveError::from_io(e, blame)
        })?;
        debug!(from = %from, to = %to, "Renamed");
        Ok(())
    }

    /// Remove a file or a whole directory tree.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let real = self.translate(path)?;
        if real == self.root {
            return Err(DriveError::InvalidPath(path.to_string()));
        }

        let meta = fs::symlink_metadata(&real).map_err(|e| DriveError::from_io(e, path))?;
        self.forget(&real);

        if meta.is_dir() {
            fs::remove_dir_all(&real)
        } else {
            fs::remove_file(&real)
        }
        .map_err(|e| DriveError::from_io(e, path))?;

        debug!(path = %path, "Removed");
        Ok(())
    }

    pub fn mkdir_all(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let real = self.translate(path)?;
        fs::create_dir_all(&real).map_err(|e| DriveError::from_io(e, path))
    }

    pub fn stat(&self, path: &str) -> Result<EntryInfo> {
        let real = self.translate(path)?;
        let meta = fs::metadata(&real).map_err(|e| DriveError::from_io(e, path))?;
        let name = real
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(EntryInfo::from_metadata(name, &meta))
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let real = self.translate(path)?;
        self.exists_real(&real, path)
    }

    fn exists_real(&self, real: &Path, path: &str) -> Result<bool> {
        match fs::symlink_metadata(real) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DriveError::from_io(e, path)),
        }
    }

    /// Entries of a directory, sorted by name.
    pub fn list_dir(&self, path: &str) -> Result<Vec<EntryInfo>> {
        let real = self.translate(path)?;
        let mut entries = Vec::new();

        for dir_entry in fs::read_dir(&real).map_err(|e| DriveError::from_io(e, path))? {
            let dir_entry = dir_entry?;
            let meta = dir_entry.metadata()?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            entries.push(EntryInfo::from_metadata(name, &meta));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Total size of the regular files at or below `path`.
    pub fn disk_usage(&self, path: &str) -> Result<u64> {
        let real = self.translate(path)?;
        let meta = fs::symlink_metadata(&real).map_err(|e| DriveError::from_io(e, path))?;
        if !meta.is_dir() {
            return Ok(meta.len());
        }

        let mut total = 0u64;
        let mut pending = vec![real];
        while let Some(dir) = pending.pop() {
            for dir_entry in fs::read_dir(&dir)? {
                let dir_entry = dir_entry?;
                let meta = dir_entry.metadata()?;
                if meta.is_dir() {
                    pending.push(dir_entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    /// Open a streaming reader that lives outside the handle cache. The
    /// consumer closes it when the stream ends.
    pub fn open_reader(&self, path: &str) -> Result<FileReader> {
        self.ensure_open()?;
        let real = self.translate(path)?;
        let file = File::open(&real).map_err(|e| DriveError::from_io(e, path))?;
        let meta = file.metadata().map_err(|e| DriveError::from_io(e, path))?;
        if meta.is_dir() {
            return Err(DriveError::InvalidPath(path.to_string()));
        }
        Ok(FileReader::new(
            path.to_string(),
            file,
            meta.len(),
            self.open_readers.clone(),
        ))
    }

    /// Flush and close every cached handle.
    pub fn sync(&self) -> Result<()> {
        let drained: Vec<Entry> = {
            let mut opens = self.opens.lock();
            opens.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        let mut first_err = None;
        for entry in drained {
            let open = entry.lock();
            if let Err(e) = open.file.sync_all() {
                warn!(path = %open.virtual_path, error = %e, "Failed to flush handle");
                if first_err.is_none() {
                    first_err = Some(DriveError::from_io(e, &open.virtual_path));
                }
            }
        }

        debug!(closed = count, "Synced file store");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush everything and refuse further opens.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let result = self.sync();
        info!(root = %self.root.display(), "File store closed");
        result
    }

    pub fn open_handles(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::SeqCst)
    }

    pub fn is_cached(&self, path: &str) -> bool {
        match self.translate(path) {
            Ok(real) => self.opens.lock().contains_key(&real),
            Err(_) => false,
        }
    }

    /// Periodically run [`FileStore::sweep`] until the store is closed.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if self.closed.load(Ordering::SeqCst) {
                    break;
                }
                let evicted = self.sweep();
                if evicted > 0 {
                    debug!(evicted, "Background sweep");
                }
            }
        })
    }
}

fn new_entry(path: &str, file: File) -> Entry {
    Arc::new(Mutex::new(OpenFile {
        virtual_path: path.to_string(),
        last_access: Instant::now(),
        file,
    }))
}
