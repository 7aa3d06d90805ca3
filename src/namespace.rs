//! User namespaces and path ownership
//!
//! Every virtual path starts with the id of the user that owns it:
//!
//! ```text
//! <user>/files/...          committed files
//! <user>/.uploadings/<hex>  in-flight uploads
//! ```

use serde::{Deserialize, Serialize};

use crate::hashing::short_digest;
use crate::{DriveError, Result};

pub const FILES_DIR: &str = "files";
pub const UPLOADS_DIR: &str = ".uploadings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    User,
    Visitor,
}

/// Identity of a verified caller, supplied by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::User)
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Admin)
    }

    pub fn visitor() -> Self {
        Self::new("", Role::Visitor)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Lexically clean a virtual path.
///
/// `.` and empty segments are dropped and `..` pops the previous segment.
/// A `..` with nothing left to pop would leave the root and is rejected, as
/// are backslashes and NUL bytes.
pub fn clean(path: &str) -> Result<String> {
    if path.contains('\\') || path.contains('\0') {
        return Err(DriveError::InvalidPath(path.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(DriveError::InvalidPath(path.to_string()));
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// User owning a cleaned path (its first segment).
pub fn owner_of(path: &str) -> Option<&str> {
    path.split('/').next().filter(|s| !s.is_empty())
}

pub fn files_root(user_id: &str) -> String {
    format!("{}/{}", user_id, FILES_DIR)
}

pub fn uploads_root(user_id: &str) -> String {
    format!("{}/{}", user_id, UPLOADS_DIR)
}

/// Deterministic staging path for `target`; retries of the same logical
/// upload map to the same file.
pub fn tmp_path(owner_id: &str, target: &str) -> String {
    format!("{}/{}", uploads_root(owner_id), short_digest(target, 64))
}

/// Parent directory of a cleaned path ("" for top-level entries).
pub fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Whether `path` is `dir` itself or lies below it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir.is_empty() {
        return true;
    }
    path == dir
        || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}

/// Whether `caller` may modify `path` (already cleaned).
pub fn can_write(caller: &Caller, path: &str) -> bool {
    match caller.role {
        Role::Admin => true,
        Role::User => {
            !caller.user_id.is_empty() && is_within(path, &files_root(&caller.user_id))
        }
        Role::Visitor => false,
    }
}

/// Clean `path` and check that `caller` may modify it.
pub fn authorize_write(caller: &Caller, path: &str) -> Result<String> {
    let cleaned = clean(path)?;
    if can_write(caller, &cleaned) {
        Ok(cleaned)
    } else {
        Err(DriveError::PermissionDenied(cleaned))
    }
}

/// Clean `path` and check that it lies in a user's files tree.
pub fn require_files_path(path: &str) -> Result<(String, String)> {
    let cleaned = clean(path)?;
    let owner = owner_of(&cleaned)
        .ok_or_else(|| DriveError::InvalidPath(path.to_string()))?
        .to_string();
    if !is_within(&cleaned, &files_root(&owner)) {
        return Err(DriveError::InvalidPath(cleaned));
    }
    Ok((owner, cleaned))
}
