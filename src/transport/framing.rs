//! Bounded line framing for stream and serial links.

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

/// Splits a byte stream into newline-terminated frames of at most `max_len` bytes.
///
/// A line that grows past `max_len` is discarded up to its terminator and a warning
/// is logged. Trailing `\r` is stripped and blank lines are skipped.
///
/// [`next_frame`](Self::next_frame) is cancel-safe: partial lines are kept in the
/// framer between calls, so it can sit in a `tokio::select!` arm.
pub struct FrameReader<R> {
    reader: R,
    max_len: usize,
    line: Vec<u8>,
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            max_len,
            line: Vec::with_capacity(max_len),
            discarding: false,
        }
    }

    /// Next complete frame, or `None` once the peer closed the stream.
    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }

            let (chunk, terminated) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..pos], true),
                None => (available, false),
            };
            if !self.discarding {
                self.line.extend_from_slice(chunk);
            }
            let used = chunk.len() + usize::from(terminated);
            self.reader.consume(used);

            if !self.discarding && self.line.len() > self.max_len {
                warn!(
                    "Discarding oversized frame (> {} bytes) from stream",
                    self.max_len
                );
                self.line.clear();
                self.discarding = true;
            }

            if terminated {
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                let mut frame = std::mem::take(&mut self.line);
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                if frame.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(frame));
            }
        }
    }
}
