//! Live output capture for running tasks.
//!
//! While a task runs, its most recent stdout/stderr lines are kept in memory
//! so the HTTP tail endpoint can serve them without touching disk. Buffers
//! are dropped when the task finishes; the full output lives in the
//! [`OutputStore`](crate::store::OutputStore).

use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum number of lines retained per stream.
const MAX_BUFFERED_LINES: usize = 1000;

/// Bounded in-memory buffer of recent output lines.
#[derive(Debug)]
pub struct LineBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BUFFERED_LINES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Append one line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        let mut lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of the buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.iter().cloned().collect()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The pair of live buffers backing one running task.
#[derive(Debug, Default)]
pub struct TaskOutputBuffers {
    pub stdout: LineBuffer,
    pub stderr: LineBuffer,
}
