//! Session abstraction — one client's live transport connection.
//!
//! Sessions are supplied by the transport layer. The engine only needs a
//! stable identity, a validity flag, and the instant the session failed.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Transport-assigned identity. Two sessions are the same session iff
/// their ids are equal; ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    fn is_valid(&self) -> bool;

    /// When the session became invalid. `None` while valid.
    fn failure_time(&self) -> Option<Instant>;
}

pub type SessionRef = Arc<dyn Session>;
