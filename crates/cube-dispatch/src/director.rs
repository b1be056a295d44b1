//! Directors — backend nodes the gateway relays to.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use cube_core::Envelope;

use crate::error::DispatchError;

/// Network endpoint of a director. Identity of the director for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a director offers: relative weight and the service names it serves.
#[derive(Debug, Clone)]
pub struct Scope {
    pub weight: u32,
    pub cellets: BTreeSet<String>,
}

impl Scope {
    pub fn new<I, S>(weight: u32, cellets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            weight,
            cellets: cellets.into_iter().map(Into::into).collect(),
        }
    }

    pub fn serves(&self, cellet: &str) -> bool {
        self.cellets.contains(cellet)
    }
}

/// A director's slice `[begin, end)` of one service's weight space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub begin: u32,
    pub end: u32,
    /// Sum of weights of every director offering the service.
    pub total_weight: u32,
}

impl Section {
    pub fn contains(&self, anchor: u32) -> bool {
        self.begin <= anchor && anchor < self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// Outbound half of a director connection.
///
/// `speak` must not block on network I/O: it enqueues and returns. An error
/// means the envelope was not accepted for sending.
pub trait Speaker: Send + Sync {
    fn speak(&self, cellet: &str, envelope: &Envelope) -> anyhow::Result<()>;

    /// Tear down the connection. Default: nothing to release.
    fn close(&self) {}
}

/// A registered backend node.
pub struct Director {
    pub endpoint: Endpoint,
    pub scope: Scope,
    speaker: RwLock<Option<Arc<dyn Speaker>>>,
}

impl fmt::Debug for Director {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Director")
            .field("endpoint", &self.endpoint)
            .field("scope", &self.scope)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Director {
    pub fn new(endpoint: Endpoint, scope: Scope) -> Self {
        Self {
            endpoint,
            scope,
            speaker: RwLock::new(None),
        }
    }

    pub fn attach(&self, speaker: Arc<dyn Speaker>) {
        *self.speaker.write().unwrap_or_else(|e| e.into_inner()) = Some(speaker);
    }

    /// Drop and close the live connection, if any.
    pub fn detach(&self) {
        let prev = self.speaker.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(speaker) = prev {
            speaker.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.speaker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Enqueue an envelope for `cellet` on this director's connection.
    pub fn speak(&self, cellet: &str, envelope: &Envelope) -> Result<(), DispatchError> {
        let speaker = self
            .speaker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| DispatchError::NotConnected(self.endpoint.clone()))?;

        speaker
            .speak(cellet, envelope)
            .map_err(|e| DispatchError::SendFailed {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })
    }
}
