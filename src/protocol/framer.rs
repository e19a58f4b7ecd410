// src/protocol/framer.rs

//! Incremental framing of concatenated JSON objects.
//!
//! Worker subprocesses write JSON objects back to back on stdout with no
//! delimiter, and the pipe may hand them to us split at any byte. The framer
//! keeps the unconsumed tail between calls and tracks just enough lexical
//! state (brace depth plus whether we are inside a string literal) to find
//! where each top-level object ends. Only complete objects are handed to
//! `serde_json`.
//!
//! Scanning works on raw bytes: every byte we care about (`{`, `}`, `"`, `\`)
//! is ASCII and can never appear inside a multi-byte UTF-8 sequence.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    /// Balanced braces, but not valid JSON.
    #[error("Unable to parse child response data: {raw}")]
    Decode {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Lexical state of the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InString,
    /// Inside a string, directly after a backslash.
    InStringEscaped,
}

#[derive(Debug)]
pub struct JsonFramer {
    /// Bytes not yet resolved into a complete value.
    buf: Vec<u8>,
    /// Everything before this offset in `buf` has already been scanned.
    scan_pos: usize,
    /// Offset in `buf` of the `{` that opened the value being accumulated.
    value_start: Option<usize>,
    depth: usize,
    state: ScanState,
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            scan_pos: 0,
            value_start: None,
            depth: 0,
            state: ScanState::Normal,
        }
    }

    /// Feed one chunk and return every top-level object it completed.
    ///
    /// If one of the completed values fails to decode, the error is returned
    /// and the other values completed by this chunk are dropped with it; the
    /// offending bytes are consumed so later input can still be framed.
    pub fn parse(&mut self, chunk: &[u8]) -> Result<Vec<Value>, FrameError> {
        self.buf.extend_from_slice(chunk);

        let mut values = Vec::new();
        let mut failure = None;
        let mut consumed = 0;

        for i in self.scan_pos..self.buf.len() {
            let byte = self.buf[i];
            match self.state {
                ScanState::InStringEscaped => self.state = ScanState::InString,
                ScanState::InString => match byte {
                    b'\\' => self.state = ScanState::InStringEscaped,
                    b'"' => self.state = ScanState::Normal,
                    _ => {}
                },
                ScanState::Normal => match byte {
                    b'"' => self.state = ScanState::InString,
                    b'{' => {
                        if self.depth == 0 {
                            self.value_start = Some(i);
                        }
                        self.depth += 1;
                    }
                    b'}' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth > 0 {
                            continue;
                        }
                        if let Some(start) = self.value_start.take() {
                            let raw = &self.buf[start..=i];
                            match serde_json::from_slice::<Value>(raw) {
                                Ok(value) => values.push(value),
                                Err(source) => {
                                    if failure.is_none() {
                                        failure = Some(FrameError::Decode {
                                            raw: String::from_utf8_lossy(raw).into_owned(),
                                            source,
                                        });
                                    }
                                }
                            }
                        }
                        consumed = i + 1;
                    }
                    _ => {}
                },
            }
        }

        // Between values there is nothing worth keeping (whitespace, stray
        // newlines from `println!`-style writers).
        if self.depth == 0 && self.state == ScanState::Normal {
            consumed = self.buf.len();
        }

        self.buf.drain(..consumed);
        self.scan_pos = self.buf.len();
        if let Some(start) = self.value_start.as_mut() {
            *start -= consumed;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }

    /// Number of bytes held back waiting for the rest of a value.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the framer is in the middle of a value.
    pub fn is_mid_value(&self) -> bool {
        self.depth > 0 || self.state != ScanState::Normal
    }

    /// Forget all buffered input.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
