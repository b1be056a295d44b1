//! Performer — the call relay between client sessions and directors.
//!
//! Outbound, three modes share one serial-number space:
//!
//!   transmit         fire-and-forget, no bookkeeping
//!   transmit_tracked reply is forwarded to the originating session
//!                    through the recorded cellet
//!   sync_transmit    caller awaits the reply, bounded by `block_timeout`
//!
//! Inbound director envelopes are classified once (see
//! [`cube_core::Inbound`]) and routed to a waiting call, a tracked relay,
//! the recipient's online devices, or a per-cellet listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use cube_core::envelope::now_millis;
use cube_core::{Envelope, Inbound, PerformerRecord};

use crate::affinity::AffinityTable;
use crate::director::{Director, Endpoint, Speaker};
use crate::error::DispatchError;
use crate::presence::Presence;
use crate::registry::DirectorRegistry;
use crate::selector::WeightedSelector;
use crate::session::{SessionId, SessionRef};
use crate::stats::PerformerStats;

/// Client-facing handler for one service name.
pub trait Cellet: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver an envelope to a client session. Returns false if the
    /// session could not accept it.
    fn speak(&self, session: &SessionRef, envelope: Envelope) -> bool;
}

/// Receives director envelopes that are neither replies nor pushes.
pub trait PerformerListener: Send + Sync {
    fn on_received(&self, cellet: &str, envelope: Envelope);
}

/// A relay whose reply must be forwarded back to `session`.
struct Transmission {
    session: SessionRef,
    cellet: Arc<dyn Cellet>,
    created_at: Instant,
}

pub struct Performer {
    registry: Arc<DirectorRegistry>,
    affinity: AffinityTable,
    selector: WeightedSelector,
    presence: Presence,
    stats: Arc<PerformerStats>,
    blocks: DashMap<u64, oneshot::Sender<Envelope>>,
    transmissions: DashMap<u64, Transmission>,
    listeners: DashMap<String, Arc<dyn PerformerListener>>,
    cellets: DashMap<String, Arc<dyn Cellet>>,
    serial: AtomicU64,
    block_timeout: Duration,
}

impl Performer {
    /// Takes ownership of a fully registered registry and computes its
    /// sections; no director can be added afterwards.
    pub fn new(mut registry: DirectorRegistry, presence: Presence, block_timeout: Duration) -> Self {
        registry.compute_sections();
        let registry = Arc::new(registry);
        let affinity = AffinityTable::new();
        let stats = Arc::new(PerformerStats::default());
        let selector = WeightedSelector::new(registry.clone(), affinity.clone(), stats.clone());

        Self {
            registry,
            affinity,
            selector,
            presence,
            stats,
            blocks: DashMap::new(),
            transmissions: DashMap::new(),
            listeners: DashMap::new(),
            cellets: DashMap::new(),
            serial: AtomicU64::new(1),
            block_timeout,
        }
    }

    /// Open every director connection. Returns how many connected.
    pub async fn start<F, Fut>(&self, connect: F) -> usize
    where
        F: FnMut(Endpoint) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<Arc<dyn Speaker>>>,
    {
        let connected = self.registry.open(connect).await;
        tracing::info!(
            directors = self.registry.len(),
            connected,
            "performer started"
        );
        connected
    }

    pub fn stop(&self) {
        self.registry.close();
        tracing::info!("performer stopped");
    }

    // ── Registration ────────────────────────────────────────────────────────

    /// At most one listener per cellet; a later call replaces the earlier one.
    pub fn set_listener(&self, cellet: impl Into<String>, listener: Arc<dyn PerformerListener>) {
        self.listeners.insert(cellet.into(), listener);
    }

    /// Register the client-facing cellet used for out-of-band pushes.
    pub fn add_cellet(&self, cellet: Arc<dyn Cellet>) {
        self.cellets.insert(cellet.name().to_string(), cellet);
    }

    // ── Outbound ────────────────────────────────────────────────────────────

    /// Fire-and-forget. Returns the serial number stamped on the envelope.
    pub fn transmit(
        &self,
        session: &SessionRef,
        cellet: &str,
        mut envelope: Envelope,
    ) -> Result<u64, DispatchError> {
        let director = self.select(session, cellet)?;
        let sn = self.stamp(&mut envelope);
        self.speak(&director, cellet, &envelope)?;
        Ok(sn)
    }

    /// Send and forward the eventual reply to `session` through `cellet`.
    pub fn transmit_tracked(
        &self,
        session: &SessionRef,
        cellet: &Arc<dyn Cellet>,
        mut envelope: Envelope,
    ) -> Result<u64, DispatchError> {
        let name = cellet.name();
        let director = self.select(session, name)?;
        let sn = self.stamp(&mut envelope);

        self.transmissions.insert(
            sn,
            Transmission {
                session: session.clone(),
                cellet: cellet.clone(),
                created_at: Instant::now(),
            },
        );

        if let Err(e) = self.speak(&director, name, &envelope) {
            self.transmissions.remove(&sn);
            return Err(e);
        }
        Ok(sn)
    }

    /// Send and wait for the reply, at most `block_timeout`. The returned
    /// envelope has its correlation record stripped. There is no
    /// cancellation sent to the director on timeout.
    pub async fn sync_transmit(
        &self,
        session: &SessionRef,
        cellet: &str,
        mut envelope: Envelope,
    ) -> Result<Envelope, DispatchError> {
        let director = self.select(session, cellet)?;
        let sn = self.stamp(&mut envelope);

        let (tx, rx) = oneshot::channel();
        self.blocks.insert(sn, tx);

        if let Err(e) = self.speak(&director, cellet, &envelope) {
            self.blocks.remove(&sn);
            return Err(e);
        }

        match tokio::time::timeout(self.block_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.blocks.remove(&sn);
                Err(DispatchError::Cancelled(sn))
            }
            Err(_) => {
                self.blocks.remove(&sn);
                self.stats.record_timeout();
                tracing::warn!(
                    cellet,
                    sn,
                    director = %director.endpoint,
                    timeout_ms = self.block_timeout.as_millis() as u64,
                    "service timeout"
                );
                Err(DispatchError::Timeout {
                    service: cellet.to_string(),
                    sn,
                })
            }
        }
    }

    fn select(&self, session: &SessionRef, cellet: &str) -> Result<Arc<Director>, DispatchError> {
        self.selector.select(session, cellet).ok_or_else(|| {
            tracing::error!(cellet, "can not connect");
            DispatchError::NoDirector(cellet.to_string())
        })
    }

    fn stamp(&self, envelope: &mut Envelope) -> u64 {
        let sn = self.serial.fetch_add(1, Ordering::Relaxed);
        envelope.stamp_performer(PerformerRecord {
            sn,
            ts: now_millis(),
        });
        sn
    }

    fn speak(&self, director: &Director, cellet: &str, envelope: &Envelope) -> Result<(), DispatchError> {
        director.speak(cellet, envelope).map_err(|e| {
            self.stats.record_send_failure();
            tracing::warn!(cellet, error = %e, "send to director failed");
            e
        })
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    /// Entry point for every envelope a director sends on `cellet`.
    pub fn on_received(&self, cellet: &str, envelope: Envelope) {
        let inbound = match envelope.classify() {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(cellet, error = %e, "dropping malformed envelope");
                return;
            }
        };

        match inbound {
            Inbound::Reply { record, envelope } => self.on_reply(record.sn, envelope),
            Inbound::Push { record, envelope } => self.push(cellet, record.id, envelope),
            Inbound::Event(envelope) => self.on_event(cellet, envelope),
        }
    }

    fn on_reply(&self, sn: u64, envelope: Envelope) {
        if let Some((_, waiter)) = self.blocks.remove(&sn) {
            if waiter.send(envelope).is_err() {
                tracing::debug!(sn, "blocking caller already gone");
            }
            return;
        }

        if let Some((_, tran)) = self.transmissions.remove(&sn) {
            if !tran.cellet.speak(&tran.session, envelope) {
                tracing::debug!(
                    sn,
                    session = %tran.session.id(),
                    cellet = tran.cellet.name(),
                    "reply not delivered to session"
                );
            }
            return;
        }

        self.stats.record_orphan();
        tracing::debug!(sn, "orphaned reply");
    }

    /// Out-of-band push: best-effort, at most once per online device at
    /// the moment of lookup.
    fn push(&self, cellet: &str, recipient: u64, envelope: Envelope) {
        let devices = match self.presence.online_devices(recipient) {
            Some(devices) if !devices.is_empty() => devices,
            _ => {
                self.stats.record_dropped_push();
                tracing::info!(cellet, recipient, "push dropped, recipient not online");
                return;
            }
        };

        let Some(target) = self.cellets.get(cellet).map(|c| c.value().clone()) else {
            self.stats.record_dropped_push();
            tracing::warn!(cellet, recipient, "push dropped, no cellet registered");
            return;
        };

        for device in devices {
            if !target.speak(&device.session, envelope.clone()) {
                tracing::debug!(
                    recipient,
                    device = %device.name,
                    "push not delivered to device"
                );
            }
        }
    }

    fn on_event(&self, cellet: &str, envelope: Envelope) {
        let listener = self.listeners.get(cellet).map(|l| l.value().clone());
        match listener {
            Some(listener) => listener.on_received(cellet, envelope),
            None => {
                self.stats.record_unhandled_event();
                tracing::warn!(cellet, name = %envelope.name, "no listener for event");
            }
        }
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    /// Forget a session: its affinity pin and every tracked relay it originated.
    pub fn remove_session(&self, id: SessionId) {
        self.affinity.remove(id);
        self.transmissions.retain(|_, t| t.session.id() != id);
    }

    /// Drop tracked relays older than `max_age`. Nobody is notified.
    pub fn expire_transmissions(&self, now: Instant, max_age: Duration) -> usize {
        let before = self.transmissions.len();
        self.transmissions
            .retain(|_, t| now.saturating_duration_since(t.created_at) <= max_age);
        let removed = before.saturating_sub(self.transmissions.len());
        if removed > 0 {
            self.stats.record_expired_transmissions(removed as u64);
        }
        removed
    }

    /// Drop affinity pins whose session is no longer valid.
    pub fn prune_affinity(&self) -> usize {
        self.affinity.retain_valid()
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn registry(&self) -> &Arc<DirectorRegistry> {
        &self.registry
    }

    pub fn affinity(&self) -> &AffinityTable {
        &self.affinity
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn stats(&self) -> &PerformerStats {
        &self.stats
    }

    pub fn pending_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn pending_transmissions(&self) -> usize {
        self.transmissions.len()
    }
}
