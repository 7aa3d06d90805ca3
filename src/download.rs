//! Rate-limited download streams.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::limiter::{Direction, IoLimiter};
use crate::storage::FileReader;
use crate::{DriveError, Result};

/// A file being streamed to a client. Every chunk is checked against the
/// download bucket of the user the stream is charged to.
pub struct DownloadStream {
    reader: FileReader,
    limiter: Arc<IoLimiter>,
    charged_user: String,
    position: u64,
}

impl DownloadStream {
    pub(crate) fn new(reader: FileReader, limiter: Arc<IoLimiter>, charged_user: String) -> Self {
        Self {
            reader,
            limiter,
            charged_user,
            position: 0,
        }
    }

    pub fn path(&self) -> &str {
        self.reader.path()
    }

    pub fn len(&self) -> u64 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.position)
    }

    /// Continue from `offset` (range requests).
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        if offset > self.len() {
            return Err(DriveError::OffsetMismatch {
                expected: self.len(),
                got: offset,
            });
        }
        self.reader.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }

    /// Fill the front of `buf` with the next bytes, never more than one
    /// cycle's download cap. Returns 0 at the end of the file and
    /// `RateLimited` when the user's download budget is spent for now.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = (buf.len() as u64).min(self.remaining());
        if want == 0 {
            return Ok(0);
        }

        let cap = self.limiter.cap(&self.charged_user, Direction::Download)?;
        if cap == 0 {
            return Err(DriveError::OverRateCap { cap, got: want });
        }
        let want = want.min(cap) as usize;
        if !self.limiter.can_read(&self.charged_user, want as u64)? {
            return Err(DriveError::RateLimited(self.path().to_string()));
        }

        let mut filled = 0;
        while filled < want {
            let n = self.reader.read(&mut buf[filled..want])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.position += filled as u64;
        Ok(filled)
    }

    /// Close the underlying reader.
    pub fn close(self) {
        self.reader.close();
    }
}
