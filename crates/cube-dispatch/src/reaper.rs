//! Reaper — periodic sweep of stale gateway state.
//!
//! Each tick, in order:
//!   1. devices invalid for longer than the grace window are removed from
//!      presence, their director is sent a `deviceTimeout` notice, and the
//!      session is forgotten (affinity + tracked relays)
//!   2. tracked relays older than the staleness bound are dropped
//!   3. affinity pins of invalid sessions are dropped
//!   4. a process report is submitted once per report interval, and any
//!      buffered log lines are flushed as a log report
//!
//! Items are independent: a failure on one is logged and the sweep goes on.
//! A sweep that panics is logged and the loop keeps ticking.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::broadcast;

use cube_core::config::DaemonConfig;
use cube_core::envelope::now_millis;
use cube_core::Envelope;

use crate::performer::Performer;
use crate::presence::ExpiredDevice;
use crate::telemetry::{LogBuffer, LogReport, ProcessReport, Report, ReportSink, ResourceUsage};

/// Cellet that owns contact presence on the directors.
pub const CONTACT_CELLET: &str = "Contact";

/// Action name of the device timeout notice.
pub const DEVICE_TIMEOUT: &str = "deviceTimeout";

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub node: String,
    pub interval: Duration,
    pub device_timeout: Duration,
    pub transmission_timeout: Duration,
    pub report_interval: Duration,
}

impl ReaperSettings {
    pub fn from_config(node: impl Into<String>, daemon: &DaemonConfig) -> Self {
        Self {
            node: node.into(),
            interval: daemon.interval(),
            device_timeout: daemon.device_timeout(),
            transmission_timeout: daemon.transmission_timeout(),
            report_interval: daemon.report_interval(),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub expired_devices: usize,
    pub timeout_notices: usize,
    pub expired_transmissions: usize,
    pub stale_affinity: usize,
    pub process_report: bool,
    pub log_lines: usize,
}

pub struct Reaper {
    performer: Arc<Performer>,
    settings: ReaperSettings,
    sink: Arc<dyn ReportSink>,
    logs: LogBuffer,
    started_at: Instant,
    start_time: u64,
    last_report: Mutex<Option<Instant>>,
}

impl Reaper {
    pub fn new(
        performer: Arc<Performer>,
        settings: ReaperSettings,
        sink: Arc<dyn ReportSink>,
        logs: LogBuffer,
    ) -> Self {
        Self {
            performer,
            settings,
            sink,
            logs,
            started_at: Instant::now(),
            start_time: now_millis(),
            last_report: Mutex::new(None),
        }
    }

    /// Sweep every `interval` until shutdown. The first sweep runs one
    /// interval after start.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.settings.interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("reaper shutting down");
                    return;
                }

                _ = interval.tick() => {
                    let now = Instant::now();
                    match std::panic::catch_unwind(AssertUnwindSafe(|| self.sweep(now))) {
                        Ok(summary) => {
                            if summary.expired_devices > 0
                                || summary.expired_transmissions > 0
                                || summary.stale_affinity > 0
                            {
                                tracing::debug!(?summary, "reaper sweep");
                            }
                        }
                        Err(_) => tracing::error!("reaper sweep panicked, continuing"),
                    }
                }
            }
        }
    }

    /// One sweep as of `now`.
    pub fn sweep(&self, now: Instant) -> SweepSummary {
        let mut summary = SweepSummary::default();

        let expired = self
            .performer
            .presence()
            .take_expired(now, self.settings.device_timeout);
        summary.expired_devices = expired.len();
        for device in &expired {
            if self.notify_device_timeout(device) {
                summary.timeout_notices += 1;
            }
            self.performer.remove_session(device.device.session.id());
        }

        summary.expired_transmissions = self
            .performer
            .expire_transmissions(now, self.settings.transmission_timeout);
        if summary.expired_transmissions > 0 {
            tracing::debug!(
                count = summary.expired_transmissions,
                "dropped stale tracked relays"
            );
        }

        summary.stale_affinity = self.performer.prune_affinity();

        if self.report_due(now) {
            summary.process_report = self.submit(Report::Process(self.process_report()));
        }
        summary.log_lines = self.flush_logs();

        summary
    }

    fn notify_device_timeout(&self, expired: &ExpiredDevice) -> bool {
        tracing::info!(
            contact = expired.contact_id,
            device = %expired.device.name,
            platform = %expired.device.platform,
            invalid_ms = expired.invalid_for.as_millis() as u64,
            "device timeout"
        );

        let envelope = device_timeout_envelope(expired);
        match self
            .performer
            .transmit(&expired.device.session, CONTACT_CELLET, envelope)
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    contact = expired.contact_id,
                    error = %e,
                    "device timeout notice not sent"
                );
                false
            }
        }
    }

    fn report_due(&self, now: Instant) -> bool {
        let mut last = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
        let due = match *last {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.settings.report_interval,
        };
        if due {
            *last = Some(now);
        }
        due
    }

    pub fn process_report(&self) -> ProcessReport {
        let performer = &self.performer;
        let registry = performer.registry();
        ProcessReport {
            node: self.settings.node.clone(),
            start_time: self.start_time,
            timestamp: now_millis(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            usage: ResourceUsage::current(),
            directors: registry.len(),
            connected_directors: registry
                .directors()
                .iter()
                .filter(|d| d.is_connected())
                .count(),
            online_contacts: performer.presence().len(),
            affinity_entries: performer.affinity().len(),
            pending_blocks: performer.pending_blocks(),
            tracked_relays: performer.pending_transmissions(),
            stats: performer.stats().snapshot(),
        }
    }

    fn flush_logs(&self) -> usize {
        let logs = self.logs.drain();
        if logs.is_empty() {
            return 0;
        }
        let count = logs.len();
        self.submit(Report::Log(LogReport {
            node: self.settings.node.clone(),
            timestamp: now_millis(),
            logs,
        }));
        count
    }

    fn submit(&self, report: Report) -> bool {
        match self.sink.submit(&report) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "report submission failed");
                false
            }
        }
    }
}

/// `deviceTimeout` notice: contact id, domain, device, failure time and
/// how long the session had been invalid, plus the device token.
pub fn device_timeout_envelope(expired: &ExpiredDevice) -> Envelope {
    let timeout = expired.invalid_for.as_millis() as u64;
    let failure_time = wall_clock_millis(expired.failure_time);
    let mut envelope = Envelope::new(DEVICE_TIMEOUT).with_param(
        "data",
        json!({
            "id": expired.contact_id,
            "domain": expired.domain,
            "device": expired.device.to_json(),
            "failureTime": failure_time,
            "timeout": timeout,
        }),
    );
    if let Some(token) = &expired.device.token {
        envelope.set_param("token", token.as_str());
    }
    envelope
}

/// Epoch millis of a past monotonic instant.
fn wall_clock_millis(at: Instant) -> u64 {
    let ago = Instant::now().saturating_duration_since(at).as_millis() as u64;
    now_millis().saturating_sub(ago)
}
