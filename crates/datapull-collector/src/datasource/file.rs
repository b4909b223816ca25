//! The file transport's tail mode.
//!
//! A stream-mode file datasource follows the file like `tail -f`: it
//! starts at the configured whence position, polls for appended data and
//! reopens from the start after a truncation.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::Whence;
use crate::error::Result;
use crate::line_buffer::LineSplitter;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 8 * 1024;

/// Follows a file and yields records through a [`LineSplitter`].
pub struct FileTailer {
    path: PathBuf,
    file: File,
    pos: u64,
    splitter: LineSplitter,
}

impl FileTailer {
    /// Open `path` and position at `whence`.
    pub async fn open(path: PathBuf, whence: Whence, splitter: LineSplitter) -> Result<Self> {
        let mut file = File::open(&path).await?;
        let pos = match whence {
            // A fresh handle's current position is its start.
            Whence::Start | Whence::Current => 0,
            Whence::End => file.seek(SeekFrom::End(0)).await?,
        };
        Ok(Self {
            path,
            file,
            pos,
            splitter,
        })
    }

    /// The next record. Waits for new data instead of reporting EOF;
    /// only an end-of sentinel ends the stream.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(token) = self.splitter.next_record(false) {
                return Ok(Some(token));
            }
            if self.splitter.finished() {
                return Ok(None);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.file.read(&mut chunk).await?;
            if n > 0 {
                self.pos += n as u64;
                self.splitter.push(&chunk[..n]);
                continue;
            }

            let len = tokio::fs::metadata(&self.path).await?.len();
            if len < self.pos {
                debug!(path = %self.path.display(), "file truncated, reopening");
                self.file = File::open(&self.path).await?;
                self.pos = 0;
                continue;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
