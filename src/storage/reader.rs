//! Streaming readers for downloads.
//!
//! Readers are opened outside the write cache, so idle-handle eviction
//! never closes a stream in the middle of a download.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

pub struct FileReader {
    path: String,
    file: File,
    len: u64,
    open_readers: Arc<AtomicUsize>,
}

impl FileReader {
    pub(super) fn new(path: String, file: File, len: u64, open_readers: Arc<AtomicUsize>) -> Self {
        open_readers.fetch_add(1, Ordering::SeqCst);
        debug!(path = %path, "Opened reader");
        Self {
            path,
            file,
            len,
            open_readers,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// File size when the reader was opened
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Release the underlying handle.
    pub fn close(self) {
        drop(self);
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.open_readers.fetch_sub(1, Ordering::SeqCst);
        debug!(path = %self.path, "Closed reader");
    }
}
