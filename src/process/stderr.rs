// src/process/stderr.rs

use std::collections::VecDeque;

/// Bounded capture of a subprocess's stderr for crash diagnostics.
///
/// The first half of the budget keeps the beginning of the output, the second
/// half keeps a rolling window of the most recent bytes. Everything in between
/// is counted and dropped.
#[derive(Debug, Clone)]
pub struct StderrBuffer {
    head_limit: usize,
    tail_limit: usize,
    head: Vec<u8>,
    tail: VecDeque<u8>,
    dropped: usize,
}

impl StderrBuffer {
    pub fn new(limit: usize) -> Self {
        let head_limit = limit / 2;
        Self {
            head_limit,
            tail_limit: limit - head_limit,
            head: Vec::new(),
            tail: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, mut bytes: &[u8]) {
        if self.head.len() < self.head_limit {
            let take = bytes.len().min(self.head_limit - self.head.len());
            self.head.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }

        self.tail.extend(bytes.iter().copied());
        if self.tail.len() > self.tail_limit {
            let overflow = self.tail.len() - self.tail_limit;
            self.tail.drain(..overflow);
            self.dropped += overflow;
        }
    }

    /// Bytes that were seen but not retained.
    pub fn truncated_bytes(&self) -> usize {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.tail.is_empty()
    }

    pub fn render(&self) -> String {
        let (a, b) = self.tail.as_slices();
        let mut tail = Vec::with_capacity(self.tail.len());
        tail.extend_from_slice(a);
        tail.extend_from_slice(b);

        if self.dropped == 0 {
            let mut all = self.head.clone();
            all.extend_from_slice(&tail);
            return String::from_utf8_lossy(&all).into_owned();
        }

        format!(
            "{}\n... [{} bytes truncated] ...\n{}",
            String::from_utf8_lossy(&self.head),
            self.dropped,
            String::from_utf8_lossy(&tail)
        )
    }
}
