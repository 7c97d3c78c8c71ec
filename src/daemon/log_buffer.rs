use std::collections::VecDeque;
use std::fmt;
use std::sync::{PoisonError, RwLock};

const DEFAULT_MAX_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Ring buffer of captured nebula stdout/stderr lines.
pub struct LogBuffer {
    max_lines: usize,
    lines: RwLock<VecDeque<(Stream, String)>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: RwLock::new(VecDeque::new()),
        }
    }

    /// Append a line, evicting the oldest when over capacity.
    pub fn push(&self, stream: Stream, line: String) {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        lines.push_back((stream, line));
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }

    /// The last `n` lines, prefixed with their stream.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        let start = lines.len().saturating_sub(n);
        lines
            .iter()
            .skip(start)
            .map(|(stream, line)| format!("[{}] {}", stream, line))
            .collect()
    }

    pub fn clear(&self) {
        self.lines.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
