//! Routing counters. Lock-free, shared by every request task.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PerformerStats {
    selections: AtomicU64,
    /// Sessions routed to the first director because nobody offers the cellet.
    fallback_selections: AtomicU64,
    selection_failures: AtomicU64,
    send_failures: AtomicU64,
    timeouts: AtomicU64,
    orphaned_replies: AtomicU64,
    dropped_pushes: AtomicU64,
    unhandled_events: AtomicU64,
    expired_transmissions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub selections: u64,
    pub fallback_selections: u64,
    pub selection_failures: u64,
    pub send_failures: u64,
    pub timeouts: u64,
    pub orphaned_replies: u64,
    pub dropped_pushes: u64,
    pub unhandled_events: u64,
    pub expired_transmissions: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PerformerStats {
    counter!(record_selection, selections);
    counter!(record_fallback, fallback_selections);
    counter!(record_selection_failure, selection_failures);
    counter!(record_send_failure, send_failures);
    counter!(record_timeout, timeouts);
    counter!(record_orphan, orphaned_replies);
    counter!(record_dropped_push, dropped_pushes);
    counter!(record_unhandled_event, unhandled_events);

    pub fn record_expired_transmissions(&self, n: u64) {
        self.expired_transmissions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            selections: self.selections.load(Ordering::Relaxed),
            fallback_selections: self.fallback_selections.load(Ordering::Relaxed),
            selection_failures: self.selection_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            orphaned_replies: self.orphaned_replies.load(Ordering::Relaxed),
            dropped_pushes: self.dropped_pushes.load(Ordering::Relaxed),
            unhandled_events: self.unhandled_events.load(Ordering::Relaxed),
            expired_transmissions: self.expired_transmissions.load(Ordering::Relaxed),
        }
    }
}
