//! Cube dispatcher integration test harness.
//!
//! Scenarios run in-process: directors are fakes that record what they
//! are sent and, in echo mode, answer every request through
//! `Performer::on_received` the way a real director link would.
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;

use cube_core::envelope::PERFORMER_KEY;
use cube_core::Envelope;
use cube_dispatch::{
    Cellet, DirectorRegistry, Endpoint, Performer, Presence, Scope, Session, SessionId,
    SessionRef, Speaker,
};

mod reaping;
mod relay;
mod selection;

// ── Sessions ──────────────────────────────────────────────────────────────────

pub struct FakeSession {
    id: SessionId,
    valid: AtomicBool,
    failed_at: Mutex<Option<Instant>>,
}

impl FakeSession {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId(id),
            valid: AtomicBool::new(true),
            failed_at: Mutex::new(None),
        })
    }

    pub fn fail_at(&self, at: Instant) {
        self.valid.store(false, Ordering::SeqCst);
        *self.failed_at.lock().unwrap() = Some(at);
    }
}

impl Session for FakeSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn failure_time(&self) -> Option<Instant> {
        *self.failed_at.lock().unwrap()
    }
}

// ── Directors ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Answer every request with `code: 0` and the director's label.
    Echo,
    /// Record and never answer.
    Silent,
}

pub struct FakeDirector {
    pub label: String,
    mode: Mode,
    performer: OnceLock<Weak<Performer>>,
    pub sent: Mutex<Vec<(String, Envelope)>>,
}

impl FakeDirector {
    pub fn new(label: &str, mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            mode,
            performer: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.name.clone())
            .collect()
    }
}

impl Speaker for FakeDirector {
    fn speak(&self, cellet: &str, envelope: &Envelope) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((cellet.to_string(), envelope.clone()));

        if self.mode == Mode::Echo {
            let performer = self.performer.get().and_then(Weak::upgrade);
            if let (Some(performer), Some(record)) = (performer, envelope.param(PERFORMER_KEY)) {
                let reply = Envelope::new(envelope.name.clone())
                    .with_param(PERFORMER_KEY, record.clone())
                    .with_param("code", 0)
                    .with_param("director", self.label.clone());
                let cellet = cellet.to_string();
                tokio::spawn(async move { performer.on_received(&cellet, reply) });
            }
        }
        Ok(())
    }
}

/// A gateway wired to fake directors, one per `(label, weight, cellets)`
/// where `cellets` is comma-delimited.
pub struct Gateway {
    pub performer: Arc<Performer>,
    pub directors: HashMap<String, Arc<FakeDirector>>,
}

impl Gateway {
    pub fn build(entries: &[(&str, u32, &str)], mode: Mode, block_timeout: Duration) -> Self {
        let mut registry = DirectorRegistry::new();
        let mut directors = HashMap::new();
        for (i, (label, weight, cellets)) in entries.iter().enumerate() {
            let director = registry
                .register(
                    Endpoint::new("10.1.0.1", 6000 + i as u16),
                    Scope::new(*weight, cellets.split(',').map(str::trim)),
                )
                .unwrap();
            let fake = FakeDirector::new(label, mode);
            director.attach(fake.clone());
            directors.insert(label.to_string(), fake);
        }

        let performer = Arc::new(Performer::new(registry, Presence::new(), block_timeout));
        for fake in directors.values() {
            fake.performer.set(Arc::downgrade(&performer)).ok();
        }
        Self {
            performer,
            directors,
        }
    }

    pub fn director(&self, label: &str) -> &Arc<FakeDirector> {
        &self.directors[label]
    }
}

// ── Client-facing cellet ──────────────────────────────────────────────────────

pub struct RecordingCellet {
    name: String,
    pub delivered: Mutex<Vec<(SessionId, Envelope)>>,
}

impl RecordingCellet {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl Cellet for RecordingCellet {
    fn name(&self) -> &str {
        &self.name
    }

    fn speak(&self, session: &SessionRef, envelope: Envelope) -> bool {
        self.delivered.lock().unwrap().push((session.id(), envelope));
        true
    }
}

/// Poll `cond` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

// ── Harness checks ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_echo_director_answers_through_performer() {
    let gw = Gateway::build(&[("d1", 1, "Contact")], Mode::Echo, Duration::from_secs(2));
    let s: SessionRef = FakeSession::new(1);

    let reply = gw
        .performer
        .sync_transmit(&s, "Contact", Envelope::new("ping"))
        .await
        .unwrap();
    assert_eq!(reply.param("director"), Some(&json!("d1")));
    assert_eq!(gw.director("d1").sent_names(), vec!["ping".to_string()]);
}
