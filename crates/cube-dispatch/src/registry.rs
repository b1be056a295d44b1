//! Director registry — the static set of backend nodes and, per service
//! name, each node's weighted section.
//!
//! Lifecycle: `register` every director, `compute_sections` once, then
//! share the registry read-only (behind an `Arc`) and `open` connections.
//! Selection before `compute_sections` finds no sections and fails.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::director::{Director, Endpoint, Scope, Section, Speaker};
use crate::error::DispatchError;

#[derive(Default)]
pub struct DirectorRegistry {
    /// Registration order.
    directors: Vec<Arc<Director>>,
    /// cellet name -> directors offering it, in registration order.
    by_cellet: HashMap<String, Vec<Arc<Director>>>,
    /// cellet name -> sections, parallel to `by_cellet`.
    sections: HashMap<String, Vec<Section>>,
}

impl DirectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a director. Rejects an endpoint that is already registered.
    pub fn register(
        &mut self,
        endpoint: Endpoint,
        scope: Scope,
    ) -> Result<Arc<Director>, DispatchError> {
        if self.directors.iter().any(|d| d.endpoint == endpoint) {
            return Err(DispatchError::DuplicateDirector(endpoint));
        }

        let director = Arc::new(Director::new(endpoint, scope));
        for cellet in &director.scope.cellets {
            self.by_cellet
                .entry(cellet.clone())
                .or_default()
                .push(director.clone());
        }
        self.directors.push(director.clone());

        tracing::info!(
            endpoint = %director.endpoint,
            weight = director.scope.weight,
            cellets = ?director.scope.cellets,
            "director registered"
        );
        Ok(director)
    }

    /// Tile each service's weight space `[0, total)` with one contiguous
    /// section per director, in registration order.
    pub fn compute_sections(&mut self) {
        self.sections.clear();
        for (cellet, directors) in &self.by_cellet {
            let total_weight = directors
                .iter()
                .fold(0u32, |acc, d| acc.saturating_add(d.scope.weight));

            let mut cursor = 0u32;
            let sections = directors
                .iter()
                .map(|d| {
                    let begin = cursor;
                    cursor = cursor.saturating_add(d.scope.weight);
                    Section {
                        begin,
                        end: cursor,
                        total_weight,
                    }
                })
                .collect();

            tracing::debug!(cellet = %cellet, total_weight, "sections computed");
            self.sections.insert(cellet.clone(), sections);
        }
    }

    pub fn directors(&self) -> &[Arc<Director>] {
        &self.directors
    }

    pub fn len(&self) -> usize {
        self.directors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directors.is_empty()
    }

    /// First director registered overall.
    pub fn first(&self) -> Option<&Arc<Director>> {
        self.directors.first()
    }

    /// Does any director advertise this cellet?
    pub fn offers(&self, cellet: &str) -> bool {
        self.by_cellet.contains_key(cellet)
    }

    /// Directors and their sections for a cellet, in registration order.
    /// `None` if nobody offers it or sections have not been computed.
    pub fn candidates(&self, cellet: &str) -> Option<(&[Arc<Director>], &[Section])> {
        let directors = self.by_cellet.get(cellet)?;
        let sections = self.sections.get(cellet)?;
        Some((directors.as_slice(), sections.as_slice()))
    }

    pub fn section(&self, endpoint: &Endpoint, cellet: &str) -> Option<Section> {
        let (directors, sections) = self.candidates(cellet)?;
        directors
            .iter()
            .position(|d| &d.endpoint == endpoint)
            .map(|i| sections[i])
    }

    /// Open the persistent connection of every director. Failures are
    /// logged and skipped. Returns how many directors are connected.
    pub async fn open<F, Fut>(&self, mut connect: F) -> usize
    where
        F: FnMut(Endpoint) -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<dyn Speaker>>>,
    {
        let mut connected = 0;
        for director in &self.directors {
            match connect(director.endpoint.clone()).await {
                Ok(speaker) => {
                    director.attach(speaker);
                    connected += 1;
                    tracing::info!(endpoint = %director.endpoint, "director connected");
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %director.endpoint,
                        error = %e,
                        "director connection failed"
                    );
                }
            }
        }
        connected
    }

    /// Tear down every director connection.
    pub fn close(&self) {
        for director in &self.directors {
            director.detach();
        }
        tracing::info!(count = self.directors.len(), "director connections closed");
    }
}
