//! Identity Map: one live entity handle per persisted record.
//!
//! Within a session, loading the same `(collection, id)` twice returns the
//! same [`Entity`] handle, so changes made through one reference are visible
//! through every other and the unit of work tracks the record once.

use docmodel_core::{Entity, Value, id_string};
use std::collections::HashMap;

/// Key of an identity map entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub collection: String,
    pub id: String,
}

impl IdentityKey {
    pub fn new(collection: &str, id: &Value) -> Self {
        Self {
            collection: collection.to_string(),
            id: id_string(id),
        }
    }

    /// Key of a persisted entity; `None` before it has an identity.
    pub fn of(entity: &Entity) -> Option<Self> {
        entity.id().map(|id| Self::new(entity.collection(), &id))
    }
}

/// Per-session map of persisted records to live handles.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, Entity>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &str, id: &Value) -> Option<Entity> {
        self.entries.get(&IdentityKey::new(collection, id)).cloned()
    }

    /// Register a persisted entity. Returns the handle already mapped for
    /// the same record, if there is one (the existing handle is kept).
    pub fn insert(&mut self, entity: &Entity) -> Option<Entity> {
        let key = IdentityKey::of(entity)?;
        if let Some(existing) = self.entries.get(&key) {
            if !existing.is_same(entity) {
                tracing::debug!(
                    collection = %key.collection,
                    id = %key.id,
                    "Identity map already holds another handle for this record"
                );
            }
            return Some(existing.clone());
        }
        self.entries.insert(key, entity.clone());
        None
    }

    /// Remove the entry for `entity` if it maps to this very handle.
    pub fn remove(&mut self, entity: &Entity) -> bool {
        let Some(key) = IdentityKey::of(entity) else {
            return false;
        };
        match self.entries.get(&key) {
            Some(existing) if existing.is_same(entity) => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        IdentityKey::of(entity)
            .and_then(|key| self.entries.get(&key))
            .is_some_and(|existing| existing.is_same(entity))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
