//! Replayable, capped log of a running job.
//!
//! Any number of cursors can read the log from the start while lines are
//! still being appended. Once `capacity` lines are held the oldest are
//! dropped; cursors that fell behind skip ahead to the oldest retained line.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

#[derive(Debug)]
struct LogState {
    lines: VecDeque<LogLine>,
    /// Sequence number of `lines[0]`.
    first_seq: u64,
    capacity: usize,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LogState>,
    notify: Notify,
}

#[derive(Debug, Clone)]
pub struct LogBuffer {
    shared: Arc<Shared>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState {
                    lines: VecDeque::new(),
                    first_seq: 0,
                    capacity: capacity.max(1),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, stream: LogStream, text: impl Into<String>) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            if state.lines.len() == state.capacity {
                state.lines.pop_front();
                state.first_seq += 1;
            }
            state.lines.push_back(LogLine {
                stream,
                text: text.into(),
            });
        }
        self.shared.notify.notify_waiters();
    }

    /// No more lines will arrive; pending cursors drain and then end.
    pub fn close(&self) {
        self.state().closed = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.state().lines.iter().cloned().collect()
    }

    /// Last `n` lines of one stream.
    pub fn tail(&self, stream: LogStream, n: usize) -> Vec<String> {
        let state = self.state();
        let mut tail: Vec<String> = state
            .lines
            .iter()
            .rev()
            .filter(|line| line.stream == stream)
            .take(n)
            .map(|line| line.text.clone())
            .collect();
        tail.reverse();
        tail
    }

    /// Cursor positioned at the oldest retained line.
    pub fn cursor(&self) -> LogCursor {
        LogCursor {
            buffer: self.clone(),
            next_seq: 0,
        }
    }
}

pub struct LogCursor {
    buffer: LogBuffer,
    next_seq: u64,
}

impl LogCursor {
    /// Next line if one is already available.
    pub fn try_next(&mut self) -> Option<LogLine> {
        let state = self.buffer.state();
        self.next_seq = self.next_seq.max(state.first_seq);
        let idx = usize::try_from(self.next_seq - state.first_seq).ok()?;
        let line = state.lines.get(idx)?.clone();
        self.next_seq += 1;
        Some(line)
    }

    /// Next line, waiting for one to be appended; `None` once the buffer is
    /// closed and drained.
    pub async fn next(&mut self) -> Option<LogLine> {
        let shared = Arc::clone(&self.buffer.shared);
        loop {
            // Registered before checking so a push between check and await is not lost.
            let notified = shared.notify.notified();
            if let Some(line) = self.try_next() {
                return Some(line);
            }
            if self.buffer.is_closed() {
                return self.try_next();
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_buffer_drops_oldest() {
        let buffer = LogBuffer::new(2);
        buffer.push(LogStream::Stdout, "a");
        buffer.push(LogStream::Stdout, "b");
        buffer.push(LogStream::Stderr, "c");

        let texts: Vec<_> = buffer.snapshot().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["b", "c"]);

        let mut cursor = buffer.cursor();
        assert_eq!(cursor.try_next().unwrap().text, "b");
    }

    #[test]
    fn tail_filters_by_stream() {
        let buffer = LogBuffer::new(10);
        buffer.push(LogStream::Stderr, "e1");
        buffer.push(LogStream::Stdout, "o1");
        buffer.push(LogStream::Stderr, "e2");
        buffer.push(LogStream::Stderr, "e3");
        assert_eq!(buffer.tail(LogStream::Stderr, 2), vec!["e2", "e3"]);
    }

    #[tokio::test]
    async fn readers_replay_from_start_and_follow() {
        let buffer = LogBuffer::new(100);
        buffer.push(LogStream::Stdout, "first");

        let mut early = buffer.cursor();
        assert_eq!(early.next().await.unwrap().text, "first");

        let writer = buffer.clone();
        let handle = tokio::spawn(async move {
            writer.push(LogStream::Stdout, "second");
            writer.close();
        });

        assert_eq!(early.next().await.unwrap().text, "second");
        assert!(early.next().await.is_none());
        handle.await.unwrap();

        let mut late = buffer.cursor();
        assert_eq!(late.next().await.unwrap().text, "first");
        assert_eq!(late.next().await.unwrap().text, "second");
        assert!(late.next().await.is_none());
    }
}
