//! Splitting byte streams into records.
//!
//! A record ends at the leftmost occurrence of any configured separator,
//! at the per-line cap when a separator is too far away, or at end of
//! input. An optional end-of sentinel truncates the stream at its first
//! occurrence.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;

const READ_CHUNK: usize = 8 * 1024;

/// The pure splitting state machine: bytes in, records out.
///
/// Kept separate from any reader so both buffered streams and the file
/// tailer can feed it.
#[derive(Debug)]
pub struct LineSplitter {
    separators: Vec<Vec<u8>>,
    end_of: Vec<u8>,
    line_max: usize,
    buf: BytesMut,
    done: bool,
}

impl LineSplitter {
    /// Create a splitter. Empty `separators` defaults to `\n`; a
    /// `line_max` of zero means unlimited record length.
    #[must_use]
    pub fn new(separators: Vec<Vec<u8>>, end_of: Vec<u8>, line_max: usize) -> Self {
        let separators = if separators.is_empty() {
            vec![b"\n".to_vec()]
        } else {
            separators
        };
        Self {
            separators,
            end_of,
            line_max,
            buf: BytesMut::new(),
            done: false,
        }
    }

    /// Feed more input. Ignored once the sentinel was seen.
    pub fn push(&mut self, data: &[u8]) {
        if self.done {
            return;
        }
        self.buf.extend_from_slice(data);
        if !self.end_of.is_empty() {
            if let Some(idx) = find(&self.buf, &self.end_of) {
                self.buf.truncate(idx);
                self.done = true;
            }
        }
    }

    /// Whether the sentinel terminated the stream.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.done
    }

    /// Pop the next record, if one is complete.
    ///
    /// With `at_eof` set, a non-empty residual prefix is emitted (capped);
    /// without it, `None` means "need more input".
    pub fn next_record(&mut self, at_eof: bool) -> Option<Bytes> {
        let at_eof = at_eof || self.done;

        let mut found: Option<(usize, usize)> = None;
        for sep in &self.separators {
            if let Some(idx) = find(&self.buf, sep) {
                if found.map_or(true, |(best, _)| idx < best) {
                    found = Some((idx, sep.len()));
                }
            }
        }

        if let Some((idx, sep_len)) = found {
            if self.line_max == 0 || idx + sep_len <= self.line_max {
                let mut token = self.buf.split_to(idx);
                self.buf.advance(sep_len);
                drop_cr(&mut token);
                return Some(token.freeze());
            }
            let mut token = self.buf.split_to(self.line_max);
            drop_cr(&mut token);
            return Some(token.freeze());
        }

        if at_eof && !self.buf.is_empty() {
            let take = if self.line_max > 0 && self.buf.len() > self.line_max {
                self.line_max
            } else {
                self.buf.len()
            };
            let mut token = self.buf.split_to(take);
            drop_cr(&mut token);
            return Some(token.freeze());
        }
        None
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn drop_cr(token: &mut BytesMut) {
    if token.last() == Some(&b'\r') {
        token.truncate(token.len() - 1);
    }
}

/// An async record reader over any byte stream.
///
/// Reads at most `max_total` bytes from the underlying reader and applies
/// the [`LineSplitter`] rules to what it buffered.
pub struct LineBuffer<R> {
    reader: R,
    splitter: LineSplitter,
    remaining: u64,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineBuffer<R> {
    /// Wrap `reader`. A `max_total` of zero means unlimited.
    pub fn new(
        reader: R,
        max_total: u64,
        line_max: usize,
        separators: Vec<Vec<u8>>,
        end_of: Vec<u8>,
    ) -> Self {
        Self {
            reader,
            splitter: LineSplitter::new(separators, end_of, line_max),
            remaining: if max_total == 0 { u64::MAX } else { max_total },
            eof: false,
        }
    }

    /// Next record, or `None` at end of stream.
    pub async fn read_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            let at_eof = self.eof || self.splitter.finished() || self.remaining == 0;
            if let Some(token) = self.splitter.next_record(at_eof) {
                return Ok(Some(token));
            }
            if at_eof {
                return Ok(None);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let cap = usize::try_from(self.remaining.min(READ_CHUNK as u64)).unwrap_or(READ_CHUNK);
            let n = self.reader.read(&mut chunk[..cap]).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.remaining -= n as u64;
                self.splitter.push(&chunk[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seps(list: &[&str]) -> Vec<Vec<u8>> {
        list.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    async fn collect_lines(mut buf: LineBuffer<&[u8]>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = buf.read_line().await.unwrap() {
            out.push(String::from_utf8_lossy(&line).into_owned());
        }
        out
    }

    #[tokio::test]
    async fn test_default_lf_split_matches_plain_scanner() {
        let data = b"one\ntwo\r\nthree" as &[u8];
        let buf = LineBuffer::new(data, 0, 0, Vec::new(), Vec::new());
        assert_eq!(collect_lines(buf).await, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_multiple_separators_leftmost_wins() {
        let data = b"a=1;b=2\nc=3" as &[u8];
        let buf = LineBuffer::new(data, 0, 0, seps(&[";", "\n"]), Vec::new());
        assert_eq!(collect_lines(buf).await, vec!["a=1", "b=2", "c=3"]);
    }

    #[tokio::test]
    async fn test_sentinel_truncates_stream() {
        let data = b"alpha\nbeta\nEND\ngamma\n" as &[u8];
        let buf = LineBuffer::new(data, 0, 0, Vec::new(), b"END".to_vec());
        assert_eq!(collect_lines(buf).await, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_line_cap_splits_long_records() {
        let data = b"[server1]rest" as &[u8];
        let buf = LineBuffer::new(data, 0, 5, seps(&["]"]), Vec::new());
        assert_eq!(collect_lines(buf).await, vec!["[serv", "er1", "rest"]);
    }

    #[tokio::test]
    async fn test_max_total_truncates_input() {
        let data = b"0123456789\nabcdefghij\n" as &[u8];
        let buf = LineBuffer::new(data, 14, 0, Vec::new(), Vec::new());
        assert_eq!(collect_lines(buf).await, vec!["0123456789", "abc"]);
    }

    #[tokio::test]
    async fn test_residual_prefix_emitted_at_eof() {
        let data = b"no newline here" as &[u8];
        let buf = LineBuffer::new(data, 0, 0, Vec::new(), Vec::new());
        assert_eq!(collect_lines(buf).await, vec!["no newline here"]);
    }

    #[tokio::test]
    async fn test_empty_input_yields_nothing() {
        let data = b"" as &[u8];
        let buf = LineBuffer::new(data, 0, 0, Vec::new(), Vec::new());
        assert!(collect_lines(buf).await.is_empty());
    }

    #[test]
    fn test_splitter_sentinel_across_pushes() {
        let mut sp = LineSplitter::new(Vec::new(), b"STOP".to_vec(), 0);
        sp.push(b"keep\nST");
        sp.push(b"OPdropped");
        assert!(sp.finished());
        assert_eq!(sp.next_record(false).unwrap().as_ref(), b"keep");
        assert!(sp.next_record(true).is_none());
    }
}
