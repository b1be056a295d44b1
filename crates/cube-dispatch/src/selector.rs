//! Weighted director selection with per-session stickiness.
//!
//! A session's first selection draws `anchor` uniformly from
//! `[0, total_weight)` for the requested cellet and takes the director
//! whose section contains it. The result is pinned in the affinity table
//! and returned for every later request from that session, whatever the
//! cellet, even one the pinned director does not advertise.

use std::sync::Arc;

use rand::Rng;

use crate::affinity::AffinityTable;
use crate::director::Director;
use crate::registry::DirectorRegistry;
use crate::session::SessionRef;
use crate::stats::PerformerStats;

#[derive(Clone)]
pub struct WeightedSelector {
    registry: Arc<DirectorRegistry>,
    affinity: AffinityTable,
    stats: Arc<PerformerStats>,
}

impl WeightedSelector {
    pub fn new(
        registry: Arc<DirectorRegistry>,
        affinity: AffinityTable,
        stats: Arc<PerformerStats>,
    ) -> Self {
        Self {
            registry,
            affinity,
            stats,
        }
    }

    /// Director for `session`, pinning a fresh choice on first use.
    /// `None` when nothing can be selected; nothing is pinned in that case.
    pub fn select(&self, session: &SessionRef, cellet: &str) -> Option<Arc<Director>> {
        let selected = self.affinity.get_or_pin(session, || self.choose(cellet));
        match &selected {
            Some(director) => {
                self.stats.record_selection();
                tracing::debug!(
                    session = %session.id(),
                    cellet,
                    director = %director.endpoint,
                    "director selected"
                );
            }
            None => {
                self.stats.record_selection_failure();
                tracing::warn!(session = %session.id(), cellet, "no director available");
            }
        }
        selected
    }

    /// Fresh weighted choice, ignoring affinity.
    fn choose(&self, cellet: &str) -> Option<Arc<Director>> {
        if !self.registry.offers(cellet) {
            let first = self.registry.first()?.clone();
            self.stats.record_fallback();
            tracing::warn!(
                cellet,
                director = %first.endpoint,
                "no director offers cellet, falling back to first director"
            );
            return Some(first);
        }

        let total_weight = self.total_weight(cellet)?;
        if total_weight == 0 {
            return None;
        }
        let anchor = rand::thread_rng().gen_range(0..total_weight);
        self.locate(cellet, anchor)
    }

    fn total_weight(&self, cellet: &str) -> Option<u32> {
        let (_, sections) = self.registry.candidates(cellet)?;
        sections.first().map(|s| s.total_weight)
    }

    /// Director whose section for `cellet` contains `anchor`.
    pub fn locate(&self, cellet: &str, anchor: u32) -> Option<Arc<Director>> {
        let (directors, sections) = self.registry.candidates(cellet)?;
        directors
            .iter()
            .zip(sections)
            .find(|(_, section)| section.contains(anchor))
            .map(|(director, _)| director.clone())
    }
}
