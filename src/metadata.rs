//! Metadata store backed by sled
//!
//! Four trees hold the persistent records:
//!
//! - `quotas`:  user id    -> [`UserQuota`]
//! - `files`:   path       -> [`FileInfo`]
//! - `uploads`: temp path  -> [`UploadRecord`]
//! - `shares`:  share id   -> path
//!
//! Values are bincode-encoded. Paths are used as keys so prefix scans give
//! directory-scoped views.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::namespace;
use crate::quota::UserQuota;
use crate::upload::UploadRecord;
use crate::Result;

/// One stored item: a committed file or a shared directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Empty when the item is not shared
    pub share_id: String,
    /// Hex content hash (empty for directories)
    pub content_hash: String,
    pub modified_at: i64,
}

impl FileInfo {
    pub fn file(path: &str, size: u64, content_hash: String) -> Self {
        Self {
            path: path.to_string(),
            is_dir: false,
            size,
            share_id: String::new(),
            content_hash,
            modified_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            is_dir: true,
            size: 0,
            share_id: String::new(),
            content_hash: String::new(),
            modified_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_shared(&self) -> bool {
        !self.share_id.is_empty()
    }
}

pub struct MetaStore {
    db: sled::Db,
    quotas: sled::Tree,
    files: sled::Tree,
    uploads: sled::Tree,
    shares: sled::Tree,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, key: &str) -> Result<Option<T>> {
    match tree.get(key.as_bytes())? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn put<T: Serialize>(tree: &sled::Tree, key: &str, value: &T) -> Result<()> {
    tree.insert(key.as_bytes(), encode(value)?)?;
    Ok(())
}

fn take<T: DeserializeOwned>(tree: &sled::Tree, key: &str) -> Result<Option<T>> {
    match tree.remove(key.as_bytes())? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Records at `dir` or below it.
fn scan_dir<T: DeserializeOwned>(tree: &sled::Tree, dir: &str) -> Result<Vec<(String, T)>> {
    let mut records = Vec::new();
    for item in tree.scan_prefix(dir.as_bytes()) {
        let (key, value) = item?;
        let key = String::from_utf8_lossy(&key).into_owned();
        if namespace::is_within(&key, dir) {
            records.push((key, decode(&value)?));
        }
    }
    Ok(records)
}

impl MetaStore {
    /// Open (or create) a persistent store in `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Store that disappears when dropped.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            quotas: db.open_tree("quotas")?,
            files: db.open_tree("files")?,
            uploads: db.open_tree("uploads")?,
            shares: db.open_tree("shares")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // Quotas

    pub fn get_quota(&self, user_id: &str) -> Result<Option<UserQuota>> {
        get(&self.quotas, user_id)
    }

    pub fn put_quota(&self, user_id: &str, quota: &UserQuota) -> Result<()> {
        put(&self.quotas, user_id, quota)
    }

    pub fn remove_quota(&self, user_id: &str) -> Result<Option<UserQuota>> {
        take(&self.quotas, user_id)
    }

    // File infos

    pub fn get_file(&self, path: &str) -> Result<Option<FileInfo>> {
        get(&self.files, path)
    }

    pub fn put_file(&self, info: &FileInfo) -> Result<()> {
        put(&self.files, &info.path, info)
    }

    pub fn remove_file(&self, path: &str) -> Result<Option<FileInfo>> {
        take(&self.files, path)
    }

    /// File infos at `dir` or below it.
    pub fn scan_files(&self, dir: &str) -> Result<Vec<FileInfo>> {
        Ok(scan_dir(&self.files, dir)?
            .into_iter()
            .map(|(_, info)| info)
            .collect())
    }

    // Upload records

    pub fn get_upload(&self, tmp_path: &str) -> Result<Option<UploadRecord>> {
        get(&self.uploads, tmp_path)
    }

    pub fn put_upload(&self, record: &UploadRecord) -> Result<()> {
        put(&self.uploads, &record.tmp_path, record)
    }

    /// Remove an upload record, returning it if it was present. Only one
    /// caller can observe `Some` for a given record.
    pub fn remove_upload(&self, tmp_path: &str) -> Result<Option<UploadRecord>> {
        take(&self.uploads, tmp_path)
    }

    pub fn scan_uploads(&self, owner_id: &str) -> Result<Vec<UploadRecord>> {
        Ok(scan_dir(&self.uploads, &namespace::uploads_root(owner_id))?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    // Share mappings

    pub fn get_share(&self, share_id: &str) -> Result<Option<String>> {
        Ok(self
            .shares
            .get(share_id.as_bytes())?
            .map(|path| String::from_utf8_lossy(&path).into_owned()))
    }

    pub fn put_share(&self, share_id: &str, path: &str) -> Result<()> {
        self.shares.insert(share_id.as_bytes(), path.as_bytes())?;
        Ok(())
    }

    pub fn remove_share(&self, share_id: &str) -> Result<Option<String>> {
        Ok(self
            .shares
            .remove(share_id.as_bytes())?
            .map(|path| String::from_utf8_lossy(&path).into_owned()))
    }

    /// Every (share id, path) pair.
    pub fn share_entries(&self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        for item in self.shares.iter() {
            let (id, path) = item?;
            entries.push((
                String::from_utf8_lossy(&id).into_owned(),
                String::from_utf8_lossy(&path).into_owned(),
            ));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_infos_scan_by_directory() {
        let meta = MetaStore::temporary().unwrap();
        meta.put_file(&FileInfo::file("u/files/a", 1, String::new())).unwrap();
        meta.put_file(&FileInfo::file("u/files/a/b", 2, String::new())).unwrap();
        meta.put_file(&FileInfo::file("u/files/ab", 3, String::new())).unwrap();

        let mut under_a: Vec<_> = meta
            .scan_files("u/files/a")
            .unwrap()
            .into_iter()
            .map(|i| i.path)
            .collect();
        under_a.sort();
        assert_eq!(under_a, vec!["u/files/a", "u/files/a/b"]);

        assert_eq!(meta.scan_files("u/files").unwrap().len(), 3);
        assert_eq!(meta.remove_file("u/files/ab").unwrap().unwrap().size, 3);
        assert!(meta.get_file("u/files/ab").unwrap().is_none());
    }

    #[test]
    fn test_upload_records_remove_once() {
        let meta = MetaStore::temporary().unwrap();
        let record = UploadRecord::new("u", "u/files/x", &namespace::tmp_path("u", "u/files/x"), 10);
        meta.put_upload(&record).unwrap();

        assert_eq!(meta.scan_uploads("u").unwrap(), vec![record.clone()]);
        assert!(meta.scan_uploads("v").unwrap().is_empty());

        assert_eq!(meta.remove_upload(&record.tmp_path).unwrap(), Some(record.clone()));
        assert_eq!(meta.remove_upload(&record.tmp_path).unwrap(), None);
    }

    #[test]
    fn test_shares_and_quotas() {
        let meta = MetaStore::temporary().unwrap();
        meta.put_share("abc1234", "u/files/pub").unwrap();
        assert_eq!(meta.get_share("abc1234").unwrap().as_deref(), Some("u/files/pub"));
        assert_eq!(
            meta.share_entries().unwrap(),
            vec![("abc1234".to_string(), "u/files/pub".to_string())]
        );
        assert!(meta.remove_share("abc1234").unwrap().is_some());
        assert!(meta.get_share("abc1234").unwrap().is_none());

        let quota = UserQuota::new(Default::default());
        meta.put_quota("u", &quota).unwrap();
        assert_eq!(meta.get_quota("u").unwrap(), Some(quota));
    }

    #[test]
    fn test_persistent_store_reopens() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let meta = MetaStore::open(dir.path().join("meta")).unwrap();
            meta.put_share("id00001", "u/files/d").unwrap();
            meta.flush().unwrap();
        }
        let meta = MetaStore::open(dir.path().join("meta")).unwrap();
        assert_eq!(meta.get_share("id00001").unwrap().as_deref(), Some("u/files/d"));
    }
}
