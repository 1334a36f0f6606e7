//! Change tracking and change-set computation for DocModel sessions.
//!
//! This module keeps the last-known-persisted record of every clean entity
//! and diffs current state against it to produce `$set`/`$unset` updates.

use docmodel_core::{Document, EntityToken, Update};
use std::collections::HashMap;
use std::time::Instant;

/// Snapshot of an entity's stored record at a point in time.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    data: Document,
    taken_at: Instant,
}

impl RecordSnapshot {
    pub fn new(data: Document) -> Self {
        Self {
            data,
            taken_at: Instant::now(),
        }
    }

    pub fn data(&self) -> &Document {
        &self.data
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Attribute changes of one entity since its baseline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Changed or added attributes with their new values.
    pub set: Document,
    /// Attributes removed since the baseline.
    pub unset: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    pub fn into_update(self) -> Update {
        Update {
            set: self.set,
            unset: self.unset,
        }
    }
}

/// Tracks baselines of clean entities.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityToken, RecordSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` as the baseline for `token`.
    #[tracing::instrument(level = "trace", skip(self, record))]
    pub fn snapshot(&mut self, token: EntityToken, record: Document) {
        tracing::trace!(%token, attributes = record.len(), "Taking record snapshot");
        self.snapshots.insert(token, RecordSnapshot::new(record));
    }

    /// Has `current` diverged from the baseline? No baseline counts as dirty.
    pub fn is_dirty(&self, token: EntityToken, current: &Document) -> bool {
        let Some(snapshot) = self.snapshots.get(&token) else {
            return true;
        };
        snapshot.data != *current
    }

    /// Diff `current` against the baseline.
    ///
    /// Without a baseline every current attribute is reported under `set`.
    pub fn change_set(&self, token: EntityToken, current: &Document) -> ChangeSet {
        let Some(snapshot) = self.snapshots.get(&token) else {
            return ChangeSet {
                set: current.clone(),
                unset: Vec::new(),
            };
        };

        let mut changes = ChangeSet::default();
        for (name, value) in current {
            if snapshot.data.get(name) != Some(value) {
                changes.set.insert(name.clone(), value.clone());
            }
        }
        for name in snapshot.data.keys() {
            if !current.contains_key(name) {
                changes.unset.push(name.clone());
            }
        }
        tracing::debug!(
            %token,
            set = changes.set.len(),
            unset = changes.unset.len(),
            "Computed change set"
        );
        changes
    }

    pub fn has_snapshot(&self, token: EntityToken) -> bool {
        self.snapshots.contains_key(&token)
    }

    pub fn get_snapshot(&self, token: EntityToken) -> Option<&RecordSnapshot> {
        self.snapshots.get(&token)
    }

    pub fn clear(&mut self, token: EntityToken) {
        self.snapshots.remove(&token);
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
