//! Routing envelope — the unit relayed between client sessions and directors.
//!
//! The gateway has no opinion about payload content. It only reads and
//! writes two reserved params:
//!
//!   `_performer`: `{sn, ts}` correlation record stamped on every outbound
//!                  envelope and echoed back by the director on the reply.
//!   `_director`:  `{id}` recipient record a director attaches when it
//!                  pushes an envelope out-of-band.
//!
//! Both are stripped before an envelope reaches its final recipient.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved param carrying the performer correlation record.
pub const PERFORMER_KEY: &str = "_performer";

/// Reserved param carrying the out-of-band recipient record.
pub const DIRECTOR_KEY: &str = "_director";

/// Action name plus free-form params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Correlation record: gateway-assigned serial number and send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformerRecord {
    pub sn: u64,
    /// Unix milliseconds at send time.
    pub ts: u64,
}

/// Out-of-band recipient record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorRecord {
    /// Contact id of the recipient.
    pub id: u64,
}

/// An inbound director envelope, classified once at the demux entry point.
/// Reserved records are already stripped from `envelope`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a blocking call or a tracked relay.
    Reply {
        record: PerformerRecord,
        envelope: Envelope,
    },
    /// Backend-originated push to a recipient's online devices.
    Push {
        record: DirectorRecord,
        envelope: Envelope,
    },
    /// Neither record present.
    Event(Envelope),
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed {key} record: {source}")]
    MalformedRecord {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Envelope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Builder-style param insert.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn remove_param(&mut self, key: &str) -> Option<Value> {
        self.params.remove(key)
    }

    /// Attach (or replace) the performer correlation record.
    pub fn stamp_performer(&mut self, record: PerformerRecord) {
        // PerformerRecord is two integers; serialization cannot fail.
        let value = serde_json::json!({ "sn": record.sn, "ts": record.ts });
        self.params.insert(PERFORMER_KEY.into(), value);
    }

    /// Read the performer record without removing it.
    pub fn performer(&self) -> Result<Option<PerformerRecord>, EnvelopeError> {
        read_record(&self.params, PERFORMER_KEY)
    }

    /// Classify by reserved records (performer first, then director) and
    /// strip the record that decided the class.
    pub fn classify(mut self) -> Result<Inbound, EnvelopeError> {
        if let Some(record) = read_record::<PerformerRecord>(&self.params, PERFORMER_KEY)? {
            self.params.remove(PERFORMER_KEY);
            return Ok(Inbound::Reply {
                record,
                envelope: self,
            });
        }
        if let Some(record) = read_record::<DirectorRecord>(&self.params, DIRECTOR_KEY)? {
            self.params.remove(DIRECTOR_KEY);
            return Ok(Inbound::Push {
                record,
                envelope: self,
            });
        }
        Ok(Inbound::Event(self))
    }
}

fn read_record<T: for<'de> Deserialize<'de>>(
    params: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<T>, EnvelopeError> {
    match params.get(key) {
        None => Ok(None),
        Some(value) => T::deserialize(value)
            .map(Some)
            .map_err(|source| EnvelopeError::MalformedRecord { key, source }),
    }
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
