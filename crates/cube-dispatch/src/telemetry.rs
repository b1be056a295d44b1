//! Telemetry — process-health and log-line reports.
//!
//! The gateway is a producer only: reports go to a [`ReportSink`]. Log
//! lines are captured from `tracing` by [`LogCapture`] into a
//! [`LogBuffer`], which the reaper drains on every tick.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use cube_core::envelope::now_millis;

use crate::stats::StatsSnapshot;

/// Lines beyond this are dropped until the next flush.
const MAX_BUFFERED_LINES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub level: String,
    /// Emitting module path.
    pub tag: String,
    pub text: String,
    /// Unix milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub node: String,
    pub start_time: u64,
    pub timestamp: u64,
    pub uptime_secs: u64,
    pub usage: ResourceUsage,
    pub directors: usize,
    pub connected_directors: usize,
    pub online_contacts: usize,
    pub affinity_entries: usize,
    pub pending_blocks: usize,
    pub tracked_relays: usize,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogReport {
    pub node: String,
    pub timestamp: u64,
    pub logs: Vec<LogLine>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Report {
    Process(ProcessReport),
    Log(LogReport),
}

/// External submission channel for reports.
pub trait ReportSink: Send + Sync {
    fn submit(&self, report: &Report) -> anyhow::Result<()>;
}

/// Discards every report.
pub struct NullSink;

impl ReportSink for NullSink {
    fn submit(&self, _report: &Report) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Appends each report as one JSON line.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create report dir: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open report file: {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }
}

impl ReportSink for JsonLinesSink {
    fn submit(&self, report: &Report) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(report).context("failed to serialize report")?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&line)
            .with_context(|| format!("failed to write report to {}", self.path.display()))
    }
}

// ── Process usage ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceUsage {
    pub max_rss_kb: u64,
    pub user_cpu_ms: u64,
    pub system_cpu_ms: u64,
}

impl ResourceUsage {
    #[cfg(unix)]
    pub fn current() -> Self {
        // Safety: getrusage only writes into the zeroed struct we own.
        let usage = unsafe {
            let mut usage: libc::rusage = std::mem::zeroed();
            if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
                return Self::default();
            }
            usage
        };
        let millis = |tv: libc::timeval| tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
        Self {
            max_rss_kb: usage.ru_maxrss as u64,
            user_cpu_ms: millis(usage.ru_utime),
            system_cpu_ms: millis(usage.ru_stime),
        }
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        Self::default()
    }
}

// ── Log capture ───────────────────────────────────────────────────────────────

/// Log lines collected since the last drain. Cheap to clone.
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: LogLine) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() < MAX_BUFFERED_LINES {
            lines.push(line);
        }
    }

    pub fn drain(&self) -> Vec<LogLine> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `tracing` layer that copies every event into a [`LogBuffer`].
pub struct LogCapture {
    buffer: LogBuffer,
}

impl LogCapture {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: tracing::Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut text = EventText::default();
        event.record(&mut text);
        let meta = event.metadata();
        self.buffer.push(LogLine {
            level: meta.level().to_string(),
            tag: meta.target().to_string(),
            text: text.finish(),
            timestamp: now_millis(),
        });
    }
}

/// Flattens an event into `message k=v k=v`.
#[derive(Default)]
struct EventText {
    message: String,
    fields: Vec<String>,
}

impl EventText {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        format!("{} {}", self.message, self.fields.join(" "))
    }
}

impl Visit for EventText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
