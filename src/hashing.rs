//! Content and identifier hashing
//!
//! BLAKE3 content hashes record what a promoted file holds; short SHA-256
//! digests name temporary uploads and share identifiers.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;

/// Content hash using BLAKE3 (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash data and return content hash
    pub fn hash(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self(*hash.as_bytes())
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental hasher for large files
pub struct IncrementalHasher {
    hasher: Hasher,
    bytes_processed: u64,
}

impl IncrementalHasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(*self.hasher.finalize().as_bytes())
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash everything a reader yields, `chunk_size` bytes at a time.
pub fn hash_reader<R: Read>(reader: &mut R, chunk_size: usize) -> std::io::Result<ContentHash> {
    let mut hasher = IncrementalHasher::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// First `len` hex characters of SHA-256(`input`).
pub fn short_digest(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(len);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let data = b"Hello, FileDrive!";
        let hash = ContentHash::hash(data);

        assert_eq!(hash, ContentHash::hash(data));
        assert_ne!(hash, ContentHash::hash(b"Different data"));

        let from_hex = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, from_hex);
        assert!(ContentHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_incremental_hasher() {
        let data = b"Hello, FileDrive! This is a longer message for testing.";

        let hash1 = ContentHash::hash(data);

        let mut hasher = IncrementalHasher::new();
        hasher.update(&data[..10]);
        hasher.update(&data[10..30]);
        hasher.update(&data[30..]);
        assert_eq!(hasher.bytes_processed(), data.len() as u64);
        assert_eq!(hash1, hasher.finalize());
    }

    #[test]
    fn test_hash_reader_matches_one_shot() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let hash = hash_reader(&mut data.as_slice(), 333).unwrap();
        assert_eq!(hash, ContentHash::hash(&data));
    }

    #[test]
    fn test_short_digest() {
        let a = short_digest("alice/files/photos", 7);
        assert_eq!(a.len(), 7);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, short_digest("alice/files/photos", 7));
        assert_ne!(a, short_digest("alice/files/photos2", 7));
        assert_eq!(short_digest("x", 64).len(), 64);
    }
}
