//! Pass-through cellets: every client frame on service `X` is relayed to a
//! director as a tracked transmit through cellet `X`, and the reply is
//! written back to the same client.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use cube_core::Envelope;
use cube_dispatch::{Cellet, Contact, Device, Performer, Presence, Session, SessionId, SessionRef};

use crate::transport::ClientSession;

/// Connected clients by session id. Cheap to clone.
#[derive(Clone, Default)]
pub struct Clients {
    sessions: Arc<DashMap<SessionId, Arc<ClientSession>>>,
}

impl Clients {
    pub fn insert(&self, session: Arc<ClientSession>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Reply action that signs a contact in on the replying session.
pub const SIGN_IN: &str = "signIn";

/// Reply action that signs the replying session's device out.
pub const SIGN_OUT: &str = "signOut";

pub struct PassThroughCellet {
    name: String,
    clients: Clients,
    presence: Presence,
}

impl PassThroughCellet {
    pub fn new(name: impl Into<String>, clients: Clients, presence: Presence) -> Self {
        Self {
            name: name.into(),
            clients,
            presence,
        }
    }

    /// Relay one client frame. Errors are reported back to the client as
    /// the same action with a non-zero `code`.
    pub fn relay(self: &Arc<Self>, performer: &Performer, session: &SessionRef, envelope: Envelope) {
        let action = envelope.name.clone();
        let cellet: Arc<dyn Cellet> = self.clone();
        if let Err(e) = performer.transmit_tracked(session, &cellet, envelope) {
            tracing::warn!(
                session = %session.id(),
                cellet = %self.name,
                action = %action,
                error = %e,
                "relay failed"
            );
            let failure = Envelope::new(action)
                .with_param("code", 1)
                .with_param("error", e.to_string());
            self.speak(session, failure);
        }
    }
}

impl PassThroughCellet {
    /// Drop every device of contact `id` bound to `session`; the contact
    /// goes with its last device.
    fn sign_out(&self, id: u64, session: &SessionRef) {
        let Some(contact) = self.presence.contact(id) else {
            return;
        };
        let removed = contact
            .devices
            .iter()
            .filter(|d| d.session.id() == session.id())
            .filter(|d| self.presence.remove_device(id, d))
            .count();
        tracing::info!(contact = id, session = %session.id(), devices = removed, "contact signed out");
    }
}

impl Cellet for PassThroughCellet {
    fn name(&self) -> &str {
        &self.name
    }

    fn speak(&self, session: &SessionRef, envelope: Envelope) -> bool {
        if envelope.name == SIGN_IN {
            if let Some(contact) = signed_in_contact(&envelope, session) {
                tracing::info!(
                    contact = contact.id,
                    session = %session.id(),
                    "contact signed in"
                );
                self.presence.add_contact(contact);
            }
        } else if envelope.name == SIGN_OUT {
            if let Some(id) = signed_out_contact(&envelope) {
                self.sign_out(id, session);
            }
        }

        match self.clients.get(session.id()) {
            Some(client) => client.send(&self.name, &envelope),
            None => false,
        }
    }
}

/// The contact a successful `signIn` reply signs in on `session`:
/// `code == 0`, `data = {id, domain, name, device: {name, platform}}`,
/// optional `token`.
pub fn signed_in_contact(envelope: &Envelope, session: &SessionRef) -> Option<Contact> {
    if envelope.param("code").and_then(Value::as_i64) != Some(0) {
        return None;
    }
    let data = envelope.param("data")?;
    let id = data.get("id")?.as_u64()?;
    let domain = data.get("domain").and_then(Value::as_str).unwrap_or_default();
    let name = data.get("name").and_then(Value::as_str).unwrap_or_default();
    let device = data.get("device")?;

    let mut signed_in = Device::new(
        device.get("name")?.as_str()?,
        device.get("platform")?.as_str()?,
        session.clone(),
    );
    if let Some(token) = envelope.param("token").and_then(Value::as_str) {
        signed_in = signed_in.with_token(token);
    }

    let mut contact = Contact::new(id, domain, name);
    contact.add_device(signed_in);
    Some(contact)
}

/// The contact id of a successful `signOut` reply: `code == 0`,
/// `data = {id, ...}`.
pub fn signed_out_contact(envelope: &Envelope) -> Option<u64> {
    if envelope.param("code").and_then(Value::as_i64) != Some(0) {
        return None;
    }
    envelope.param("data")?.get("id")?.as_u64()
}
