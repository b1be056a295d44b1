//! Presence — online contacts and the devices (sessions) they are signed in on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};

use crate::session::SessionRef;

/// One signed-in device of a contact.
#[derive(Clone)]
pub struct Device {
    pub name: String,
    pub platform: String,
    pub token: Option<String>,
    pub session: SessionRef,
}

impl Device {
    pub fn new(name: impl Into<String>, platform: impl Into<String>, session: SessionRef) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            token: None,
            session,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Devices are the same device when name and platform match.
    pub fn same_device(&self, other: &Device) -> bool {
        self.name == other.name && self.platform == other.platform
    }

    pub fn is_online(&self) -> bool {
        self.session.is_valid()
    }

    pub fn to_json(&self) -> Value {
        json!({ "name": self.name, "platform": self.platform })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("session", &self.session.id())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Contact {
    pub id: u64,
    pub domain: String,
    pub name: String,
    pub devices: Vec<Device>,
}

impl Contact {
    pub fn new(id: u64, domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            domain: domain.into(),
            name: name.into(),
            devices: Vec::new(),
        }
    }

    /// Add a device, replacing an existing entry for the same device.
    pub fn add_device(&mut self, device: Device) {
        self.devices.retain(|d| !d.same_device(&device));
        self.devices.push(device);
    }
}

/// A device removed by [`Presence::take_expired`].
#[derive(Debug, Clone)]
pub struct ExpiredDevice {
    pub contact_id: u64,
    pub domain: String,
    pub device: Device,
    pub failure_time: Instant,
    /// How long the session had been invalid when it was removed.
    pub invalid_for: Duration,
}

/// Online contacts keyed by contact id. Cheap to clone.
#[derive(Clone, Default)]
pub struct Presence {
    contacts: Arc<DashMap<u64, Contact>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a contact, or merge a re-sign-in into the existing record.
    pub fn add_contact(&self, contact: Contact) {
        self.contacts
            .entry(contact.id)
            .and_modify(|current| {
                current.name = contact.name.clone();
                for device in &contact.devices {
                    current.add_device(device.clone());
                }
            })
            .or_insert_with(|| contact.clone());
    }

    pub fn remove_contact(&self, id: u64) -> Option<Contact> {
        self.contacts.remove(&id).map(|(_, c)| c)
    }

    pub fn contact(&self, id: u64) -> Option<Contact> {
        self.contacts.get(&id).map(|c| c.clone())
    }

    /// Devices of `id` whose sessions are currently valid.
    /// `None` if the contact is not online at all.
    pub fn online_devices(&self, id: u64) -> Option<Vec<Device>> {
        self.contacts.get(&id).map(|c| {
            c.devices
                .iter()
                .filter(|d| d.is_online())
                .cloned()
                .collect()
        })
    }

    /// Remove one device of `id`. A contact left without devices is
    /// removed too.
    pub fn remove_device(&self, id: u64, device: &Device) -> bool {
        let removed = match self.contacts.get_mut(&id) {
            Some(mut c) => {
                let before = c.devices.len();
                c.devices.retain(|d| !d.same_device(device));
                before != c.devices.len()
            }
            None => false,
        };
        if removed {
            self.contacts.remove_if(&id, |_, c| c.devices.is_empty());
        }
        removed
    }

    /// Remove every device whose session has been invalid for longer than
    /// `grace` as of `now`, and return them. Contacts whose last device
    /// expired are removed as well.
    pub fn take_expired(&self, now: Instant, grace: Duration) -> Vec<ExpiredDevice> {
        let mut expired = Vec::new();
        let mut emptied = Vec::new();
        for mut entry in self.contacts.iter_mut() {
            let contact = entry.value_mut();
            let (id, domain) = (contact.id, contact.domain.clone());
            let before = expired.len();
            contact.devices.retain(|device| {
                if device.session.is_valid() {
                    return true;
                }
                let Some(failure_time) = device.session.failure_time() else {
                    tracing::warn!(
                        contact = id,
                        device = %device.name,
                        "invalid session without failure time"
                    );
                    return true;
                };
                let invalid_for = now.saturating_duration_since(failure_time);
                if invalid_for <= grace {
                    return true;
                }
                expired.push(ExpiredDevice {
                    contact_id: id,
                    domain: domain.clone(),
                    device: device.clone(),
                    failure_time,
                    invalid_for,
                });
                false
            });
            if expired.len() > before && contact.devices.is_empty() {
                emptied.push(id);
            }
        }
        for id in emptied {
            self.contacts.remove_if(&id, |_, c| c.devices.is_empty());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
