//! Recent-log capture for the `logs` control command.
//!
//! [`RecentLogs`] is a `tracing` layer that keeps the last few events in a
//! bounded ring buffer; [`LogReader`] renders them on demand.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Default number of events kept.
pub const DEFAULT_CAPACITY: usize = 200;

/// A single captured log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Seconds since the layer was created.
    pub elapsed_secs: f64,
    pub level: Level,
    pub target: String,
    /// Message followed by any structured fields as `key=value`.
    pub message: String,
}

#[derive(Debug)]
struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    start_time: Instant,
}

impl LogBuffer {
    fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

/// A `tracing` layer capturing events into a shared ring buffer.
#[derive(Debug, Clone)]
pub struct RecentLogs {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl RecentLogs {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer {
                entries: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                start_time: Instant::now(),
            })),
        }
    }

    pub fn reader(&self) -> LogReader {
        LogReader {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl Default for RecentLogs {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<S: Subscriber> Layer<S> for RecentLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);

        let mut buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed_secs = buf.start_time.elapsed().as_secs_f64();
        buf.push(LogEntry {
            elapsed_secs,
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

/// Read handle for captured entries.
#[derive(Debug, Clone)]
pub struct LogReader {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl LogReader {
    /// Snapshot of all captured entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        let buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buf.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the newest `n` entries, one per line.
    pub fn render_tail(&self, n: usize) -> String {
        let buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let skip = buf.entries.len().saturating_sub(n);
        let mut out = String::new();
        for entry in buf.entries.iter().skip(skip) {
            let _ = writeln!(
                out,
                "{:>9.3}s {:<5} {}: {}",
                entry.elapsed_secs, entry.level, entry.target, entry.message
            );
        }
        out
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    fields: String,
}

impl EntryVisitor {
    fn finish(mut self) -> String {
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(self.fields.trim_start());
        }
        self.message
    }
}

impl Visit for EntryVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}
