//! Session affinity — the sticky session → director pin.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::director::Director;
use crate::session::{SessionId, SessionRef};

struct Pin {
    session: SessionRef,
    director: Arc<Director>,
}

/// Shared across request tasks and the reaper. Cheap to clone.
#[derive(Clone, Default)]
pub struct AffinityTable {
    pins: Arc<DashMap<SessionId, Pin>>,
}

impl AffinityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Director>> {
        self.pins.get(&id).map(|p| p.director.clone())
    }

    /// Return the existing pin for `session`, or run `choose` and pin its
    /// result. The shard holding the key stays locked for the duration, so
    /// concurrent first selections for one session agree on a director.
    pub fn get_or_pin<F>(&self, session: &SessionRef, choose: F) -> Option<Arc<Director>>
    where
        F: FnOnce() -> Option<Arc<Director>>,
    {
        match self.pins.entry(session.id()) {
            Entry::Occupied(e) => Some(e.get().director.clone()),
            Entry::Vacant(v) => {
                let director = choose()?;
                v.insert(Pin {
                    session: session.clone(),
                    director: director.clone(),
                });
                Some(director)
            }
        }
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Director>> {
        self.pins.remove(&id).map(|(_, p)| p.director)
    }

    /// Drop every pin whose session is no longer valid. Returns the count removed.
    pub fn retain_valid(&self) -> usize {
        let before = self.pins.len();
        self.pins.retain(|id, pin| {
            let valid = pin.session.is_valid();
            if !valid {
                tracing::debug!(
                    session = %id,
                    director = %pin.director.endpoint,
                    "removed stale affinity"
                );
            }
            valid
        });
        before.saturating_sub(self.pins.len())
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}
