//! ---
//! tb_section: "02-worker-lifecycle"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "Shared sink collecting worker console output."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---

//! Bounded, worker-tagged console capture.
//!
//! Every worker's stdout and stderr lines land here, tagged with the
//! worker name and stream, so diagnostics can quote exactly what a
//! dying worker said. The buffer is bounded and drops its oldest lines
//! first; it is a crash log, not an archive.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Default number of lines retained across all workers.
pub const DEFAULT_CAPACITY: usize = 2048;

/// Which console stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// One captured console line.
#[derive(Debug, Clone)]
pub struct OutputLine {
    /// Worker that wrote the line.
    pub worker: String,
    /// Stream it was written to.
    pub stream: StreamKind,
    /// The line itself, without the trailing newline.
    pub line: String,
    /// When the harness read it.
    pub at: DateTime<Utc>,
}

/// Clonable handle to the shared console buffer.
///
/// All clones observe the same buffer. Pushes under a full buffer
/// evict the oldest line regardless of which worker wrote it.
#[derive(Debug, Clone)]
pub struct OutputSink {
    lines: Arc<Mutex<VecDeque<OutputLine>>>,
    capacity: usize,
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl OutputSink {
    /// Sink retaining at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(256)))),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: OutputLine) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Record a line read from a worker stream right now.
    pub fn record(&self, worker: &str, stream: StreamKind, line: impl Into<String>) {
        self.push(OutputLine {
            worker: worker.to_string(),
            stream,
            line: line.into(),
            at: Utc::now(),
        });
    }

    /// Copy of everything currently buffered, oldest first.
    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Buffered lines written by one worker, oldest first.
    pub fn lines_for(&self, worker: &str) -> Vec<OutputLine> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.worker == worker)
            .cloned()
            .collect()
    }

    /// Last `limit` stderr lines of one worker, joined with newlines.
    ///
    /// This is what startup failures quote when a worker dies before
    /// becoming ready.
    pub fn stderr_tail(&self, worker: &str, limit: usize) -> String {
        let lines = self.lines.lock();
        let mut tail: Vec<&str> = lines
            .iter()
            .rev()
            .filter(|line| line.worker == worker && line.stream == StreamKind::Stderr)
            .take(limit)
            .map(|line| line.line.as_str())
            .collect();
        tail.reverse();
        tail.join("\n")
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Whether nothing has been captured yet.
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_evicts_oldest_first() {
        let sink = OutputSink::new(3);
        for i in 0..5 {
            sink.record("w", StreamKind::Stdout, format!("line-{i}"));
        }
        let lines: Vec<String> = sink.snapshot().into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["line-2", "line-3", "line-4"]);
    }

    #[test]
    fn stderr_tail_filters_worker_and_stream() {
        let sink = OutputSink::new(16);
        sink.record("a", StreamKind::Stderr, "a-err-1");
        sink.record("b", StreamKind::Stderr, "b-err-1");
        sink.record("a", StreamKind::Stdout, "a-out-1");
        sink.record("a", StreamKind::Stderr, "a-err-2");
        sink.record("a", StreamKind::Stderr, "a-err-3");

        assert_eq!(sink.stderr_tail("a", 2), "a-err-2\na-err-3");
        assert_eq!(sink.stderr_tail("b", 8), "b-err-1");
        assert_eq!(sink.stderr_tail("missing", 8), "");
    }

    #[test]
    fn clones_share_one_buffer() {
        let sink = OutputSink::new(8);
        let other = sink.clone();
        other.record("w", StreamKind::Stdout, "hello");
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.lines_for("w")[0].line, "hello");
    }
}
