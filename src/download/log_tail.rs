//! Fixed-capacity tail buffers for subprocess output.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Keeps only the last `capacity` bytes written to it.
#[derive(Debug, Clone)]
pub struct LogTail {
    buf: VecDeque<u8>,
    capacity: usize,
    discarded: u64,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            discarded: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            self.discarded += chunk.len() as u64;
            return;
        }

        // Only the end of an oversized chunk can survive
        let chunk = if chunk.len() > self.capacity {
            let skip = chunk.len() - self.capacity;
            self.discarded += skip as u64;
            &chunk[skip..]
        } else {
            chunk
        };

        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.discarded += overflow as u64;
        }
        self.buf.extend(chunk);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether any bytes were dropped to stay within capacity.
    pub fn is_truncated(&self) -> bool {
        self.discarded > 0
    }

    /// The retained bytes, decoded lossily.
    pub fn to_string_lossy(&self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// A tail shared between the task draining a pipe and the job reading it.
pub type SharedLogTail = Arc<Mutex<LogTail>>;

pub fn shared(capacity: usize) -> SharedLogTail {
    Arc::new(Mutex::new(LogTail::new(capacity)))
}

/// Drain `reader` into `tail` until EOF or a read error.
pub fn spawn_drain<R>(mut reader: R, tail: SharedLogTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tail.lock().push(&chunk[..n]),
            }
        }
    })
}

/// Keep the last `max_chars` characters of `text`.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...{tail}")
}
