//! Bounded, concurrency-safe line buffer.
//!
//! Process output on the REST transport is retained here so that polling
//! clients can fetch a recent snapshot without the server holding unbounded
//! history.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::AsyncWrite;

/// Lines retained when no explicit cap is given.
pub const DEFAULT_MAX_LINES: usize = 1000;

/// An append-only byte sink that slices its input into newline-terminated
/// lines and retains only the most recent completed ones.
///
/// Partial trailing data (no `\n` yet) is buffered internally and excluded
/// from [`LineBuffer::contents`] until its line completes. Reads and writes
/// may be concurrent; a read observes a consistent prefix of the post-write
/// state.
#[derive(Debug)]
pub struct LineBuffer {
    max_lines: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    lines: VecDeque<String>,
    partial: Vec<u8>,
}

impl LineBuffer {
    /// `max_lines == 0` falls back to [`DEFAULT_MAX_LINES`].
    pub fn new(max_lines: usize) -> Self {
        let max_lines = if max_lines == 0 { DEFAULT_MAX_LINES } else { max_lines };
        Self {
            max_lines,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Append raw bytes, completing lines on every `\n`.
    pub fn append(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        for &byte in data {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&inner.partial).into_owned();
                inner.partial.clear();
                inner.lines.push_back(line);
                while inner.lines.len() > self.max_lines {
                    inner.lines.pop_front();
                }
            } else {
                inner.partial.push(byte);
            }
        }
    }

    /// The retained completed lines, joined by `\n`.
    pub fn contents(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for (i, line) in inner.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

/// [`AsyncWrite`] adapter handing bytes to a shared [`LineBuffer`]. Writes
/// never suspend.
#[derive(Debug, Clone)]
pub struct BufferWriter(pub Arc<LineBuffer>);

impl AsyncWrite for BufferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.append(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
