//! Process-wide store of signed events.
//!
//! Relay subscriptions write every received event here unconditionally; the
//! store dedups by event id. Batch removal (deletion propagation) takes the
//! write lock so a concurrent query never observes a partially removed set.

use std::collections::HashMap;
use std::sync::RwLock;

use nostr_sdk::prelude::*;

/// Filter parameters for [`EventStore::query`].
///
/// A deliberately small subset of relay filter semantics: kind, author(s) and
/// the `d` identifier tag, which is all the sync engine queries by.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    kind: Option<Kind>,
    authors: Option<Vec<PublicKey>>,
    identifier: Option<String>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors = Some(vec![author]);
        self
    }

    pub fn authors(mut self, authors: Vec<PublicKey>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Match events carrying this `d` tag.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(identifier) = &self.identifier {
            let found = event
                .tags
                .iter()
                .filter(|tag| tag.kind() == TagKind::d())
                .any(|tag| tag.content() == Some(identifier.as_str()));
            if !found {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct EventStore {
    events: RwLock<HashMap<EventId, Event>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, deduplicating by id.
    ///
    /// Returns `true` if the event was new, `false` if it was already present.
    pub fn insert(&self, event: Event) -> bool {
        let mut events = self.events.write().expect("event store lock poisoned");
        match events.entry(event.id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(event);
                true
            }
        }
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.events
            .read()
            .expect("event store lock poisoned")
            .contains_key(id)
    }

    pub fn get(&self, id: &EventId) -> Option<Event> {
        self.events
            .read()
            .expect("event store lock poisoned")
            .get(id)
            .cloned()
    }

    /// Query events, ordered by `created_at` then id for determinism.
    pub fn query(&self, query: &EventQuery) -> Vec<Event> {
        let events = self.events.read().expect("event store lock poisoned");
        let mut matched: Vec<Event> = events
            .values()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()))
        });
        matched
    }

    /// Remove a batch of events in one step.
    ///
    /// Holds the write lock for the whole batch, so queries either see all of
    /// the removed events or none of them. Returns the number removed.
    pub fn remove_ids(&self, ids: &[EventId]) -> usize {
        let mut events = self.events.write().expect("event store lock poisoned");
        ids.iter().filter(|id| events.remove(id).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.events.read().expect("event store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
