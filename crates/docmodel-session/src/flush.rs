//! Commit ordering and execution for DocModel sessions.
//!
//! A commit runs in three phases:
//! - entity writes in dependency order (insert / `$set`+`$unset` / remove)
//! - deferred reference updates for entities written before their targets
//!   had an identity
//! - join-collection link/unlink operations for many-to-many associations
//!
//! The store has no transactions. Every operation that reached the store
//! before a failure stays applied and is listed in the resulting
//! [`CommitError`].

use crate::change_tracker::ChangeTracker;
use crate::unit_of_work::RecordStatus;
use docmodel_core::store::{by_id, field_eq};
use docmodel_core::{
    AssociationValue, Cardinality, CommitError, Document, DocumentStore, Entity, EntityToken,
    Error, ID_KEY, Registry, Result, Update, Value, id_string,
};
use std::collections::{HashMap, HashSet};

/// A pending join-collection operation (for many-to-many associations).
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOp {
    /// Insert a join document.
    Link {
        collection: String,
        local_key: String,
        local_value: Value,
        remote_key: String,
        remote_value: Value,
    },
    /// Remove a join document.
    Unlink {
        collection: String,
        local_key: String,
        local_value: Value,
        remote_key: String,
        remote_value: Value,
    },
}

impl LinkOp {
    pub fn link(
        collection: impl Into<String>,
        local_key: impl Into<String>,
        local_value: Value,
        remote_key: impl Into<String>,
        remote_value: Value,
    ) -> Self {
        Self::Link {
            collection: collection.into(),
            local_key: local_key.into(),
            local_value,
            remote_key: remote_key.into(),
            remote_value,
        }
    }

    pub fn unlink(
        collection: impl Into<String>,
        local_key: impl Into<String>,
        local_value: Value,
        remote_key: impl Into<String>,
        remote_value: Value,
    ) -> Self {
        Self::Unlink {
            collection: collection.into(),
            local_key: local_key.into(),
            local_value,
            remote_key: remote_key.into(),
            remote_value,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            LinkOp::Link { collection, .. } | LinkOp::Unlink { collection, .. } => collection,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, LinkOp::Link { .. })
    }

    fn document(local_key: &str, local: &Value, remote_key: &str, remote: &Value) -> Document {
        let mut doc = Document::new();
        doc.insert(local_key.to_string(), local.clone());
        doc.insert(remote_key.to_string(), remote.clone());
        doc
    }

    /// Human-readable form used in commit error reports.
    pub fn describe(&self) -> String {
        match self {
            LinkOp::Link {
                collection,
                local_value,
                remote_value,
                ..
            } => format!(
                "link {collection} {} -> {}",
                id_string(local_value),
                id_string(remote_value)
            ),
            LinkOp::Unlink {
                collection,
                local_value,
                remote_value,
                ..
            } => format!(
                "unlink {collection} {} -> {}",
                id_string(local_value),
                id_string(remote_value)
            ),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, store), fields(op = %self.describe()))]
    pub fn execute(&self, store: &dyn DocumentStore) -> Result<()> {
        match self {
            LinkOp::Link {
                collection,
                local_key,
                local_value,
                remote_key,
                remote_value,
            } => {
                let doc = Self::document(local_key, local_value, remote_key, remote_value);
                store.insert(collection, doc).map(|_| ())
            }
            LinkOp::Unlink {
                collection,
                local_key,
                local_value,
                remote_key,
                remote_value,
            } => {
                let filter = Self::document(local_key, local_value, remote_key, remote_value);
                store.remove(collection, &filter).map(|_| ())
            }
        }
    }
}

/// Result of a successful flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitReport {
    /// Records inserted.
    pub inserted: usize,
    /// Records updated (including deferred reference updates).
    pub updated: usize,
    /// Records removed.
    pub removed: usize,
    /// Join documents inserted.
    pub linked: usize,
    /// Join documents removed.
    pub unlinked: usize,
}

impl CommitReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.removed + self.linked + self.unlinked
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// One node of the commit dependency graph.
#[derive(Debug)]
pub struct DependencyNode {
    entity: Entity,
    status: RecordStatus,
    walked: bool,
    /// Nodes that must be written before this one.
    edges: Vec<usize>,
}

impl DependencyNode {
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }
}

/// Orders entity writes so that dependencies come first.
///
/// Cycles are tolerated: each node is walked once, and a node reached again
/// while its own dependencies are being visited is simply skipped.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<DependencyNode>,
    index: HashMap<EntityToken, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, entity: &Entity, status: RecordStatus) {
        if self.index.contains_key(&entity.token()) {
            return;
        }
        self.index.insert(entity.token(), self.nodes.len());
        self.nodes.push(DependencyNode {
            entity: entity.clone(),
            status,
            walked: false,
            edges: Vec::new(),
        });
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.index.contains_key(&entity.token())
    }

    pub fn status_of(&self, entity: &Entity) -> Option<RecordStatus> {
        self.index
            .get(&entity.token())
            .map(|i| self.nodes[*i].status)
    }

    /// Record that `after` must be written after `before`.
    pub fn add_edge(&mut self, after: &Entity, before: &Entity) {
        let (Some(&a), Some(&b)) = (
            self.index.get(&after.token()),
            self.index.get(&before.token()),
        ) else {
            return;
        };
        if a != b && !self.nodes[a].edges.contains(&b) {
            self.nodes[a].edges.push(b);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn visit(nodes: &mut [DependencyNode], i: usize, out: &mut Vec<usize>) {
        if nodes[i].walked {
            return;
        }
        nodes[i].walked = true;
        let edges = nodes[i].edges.clone();
        for dep in edges {
            Self::visit(nodes, dep, out);
        }
        out.push(i);
    }

    /// Topologically sort the nodes (insertion order breaks ties).
    pub fn sort(mut self) -> Vec<DependencyNode> {
        let mut order = Vec::with_capacity(self.nodes.len());
        for i in 0..self.nodes.len() {
            Self::visit(&mut self.nodes, i, &mut order);
        }
        let mut slots: Vec<Option<DependencyNode>> = self.nodes.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect()
    }
}

/// Issues store operations for a commit and keeps the completion log.
pub struct Executor<'a> {
    store: &'a dyn DocumentStore,
    completed: Vec<String>,
    report: CommitReport,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            completed: Vec::new(),
            report: CommitReport::default(),
        }
    }

    pub fn report(&self) -> CommitReport {
        self.report
    }

    /// Operations issued so far.
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Run one store operation, wrapping a failure into a [`CommitError`].
    fn run<T>(
        &mut self,
        operation: String,
        op: impl FnOnce(&dyn DocumentStore) -> Result<T>,
    ) -> Result<T> {
        match op(self.store) {
            Ok(value) => {
                tracing::trace!(operation = %operation, "Commit operation done");
                self.completed.push(operation);
                Ok(value)
            }
            Err(source) => {
                tracing::warn!(
                    operation = %operation,
                    completed = self.completed.len(),
                    error = %source,
                    "Commit operation failed; earlier operations stay applied"
                );
                Err(Error::Commit(CommitError {
                    completed: std::mem::take(&mut self.completed),
                    operation,
                    source: Box::new(source),
                }))
            }
        }
    }

    fn identity(entity: &Entity) -> Result<Value> {
        entity.id().ok_or_else(|| {
            Error::IntegrityConstraint(format!(
                "{} {} has no identity to write against",
                entity.entity_type(),
                entity.token()
            ))
        })
    }

    /// Write the entity nodes in order. Returns entities whose references
    /// could not all be written yet.
    pub fn write_entities(
        &mut self,
        nodes: &[DependencyNode],
        tracker: &ChangeTracker,
        registry: &Registry,
    ) -> Result<Vec<Entity>> {
        let mut deferred = Vec::new();
        for node in nodes {
            let entity = &node.entity;
            let collection = entity.collection().to_string();
            match node.status {
                RecordStatus::New => {
                    let (mut record, missing) = entity.to_record();
                    if let Some(id) = entity.id() {
                        record.insert(ID_KEY.to_string(), id);
                    }
                    let id = self.run(format!("insert {collection}"), |store| {
                        store.insert(&collection, record)
                    })?;
                    entity.assign_id(id)?;
                    self.report.inserted += 1;
                    if missing {
                        deferred.push(entity.clone());
                    }
                }
                RecordStatus::Dirty => {
                    let id = Self::identity(entity)?;
                    let (record, missing) = entity.to_record();
                    let changes = tracker.change_set(entity.token(), &record);
                    if missing {
                        deferred.push(entity.clone());
                    }
                    if changes.is_empty() {
                        continue;
                    }
                    let update = changes.into_update();
                    self.run(format!("update {collection} {}", id_string(&id)), |store| {
                        store.update(&collection, &by_id(&id), &update)
                    })?;
                    self.report.updated += 1;
                }
                RecordStatus::Deleted => {
                    let id = Self::identity(entity)?;
                    self.run(format!("remove {collection} {}", id_string(&id)), |store| {
                        store.remove(&collection, &by_id(&id))
                    })?;
                    self.report.removed += 1;
                    self.purge_links(entity, &id, registry)?;
                }
                RecordStatus::Clean | RecordStatus::Cancelled => {}
            }
        }
        Ok(deferred)
    }

    /// Remove join documents naming a deleted entity, on either end.
    fn purge_links(&mut self, entity: &Entity, id: &Value, registry: &Registry) -> Result<()> {
        let mut targets: Vec<(String, String)> = Vec::new();
        for desc in entity.metadata().associations() {
            if desc.is_owning_side() && desc.cardinality() == Cardinality::ManyToMany {
                if let Some(join) = desc.join_collection() {
                    targets.push((join.name.clone(), join.local_key.clone()));
                }
            }
        }
        for (_, desc) in registry.referrers_of(entity.entity_type()) {
            if desc.cardinality() == Cardinality::ManyToMany {
                if let Some(join) = desc.join_collection() {
                    targets.push((join.name.clone(), join.remote_key.clone()));
                }
            }
        }
        let mut seen = HashSet::new();
        for (collection, key) in targets {
            if !seen.insert((collection.clone(), key.clone())) {
                continue;
            }
            let filter = field_eq(&key, id.clone());
            let removed = self.run(
                format!("unlink {collection} {key}={}", id_string(id)),
                |store| store.remove(&collection, &filter),
            )?;
            self.report.unlinked += usize::try_from(removed).unwrap_or(usize::MAX);
        }
        Ok(())
    }

    /// Write the references that were missing when these entities were written.
    pub fn write_deferred(&mut self, deferred: &[Entity]) -> Result<()> {
        for entity in deferred {
            let id = Self::identity(entity)?;
            let (record, missing) = entity.to_record();
            let mut update = Update::new();
            for desc in entity.metadata().associations() {
                if desc.is_stored() {
                    if let Some(value) = record.get(desc.property()) {
                        update.set.insert(desc.property().to_string(), value.clone());
                    }
                }
            }
            if missing {
                tracing::warn!(
                    entity_type = entity.entity_type(),
                    id = %id_string(&id),
                    "Dangling reference: a referenced entity still has no identity after commit"
                );
            }
            if update.is_empty() {
                continue;
            }
            let collection = entity.collection().to_string();
            self.run(
                format!("update {collection} {} (deferred references)", id_string(&id)),
                |store| store.update(&collection, &by_id(&id), &update),
            )?;
            self.report.updated += 1;
        }
        Ok(())
    }

    /// Flush pending many-to-many link/unlink operations of live entities.
    pub fn write_links(&mut self, entities: &[Entity]) -> Result<()> {
        for entity in entities {
            let mut touched = false;
            for desc in entity.metadata().associations() {
                if desc.cardinality() != Cardinality::ManyToMany || !desc.is_owning_side() {
                    continue;
                }
                let AssociationValue::Collection(collection) = entity.association(desc.property())?
                else {
                    continue;
                };
                if !collection.has_pending_ops() {
                    continue;
                }
                let Some(join) = collection.join() else {
                    return Err(Error::IntegrityConstraint(format!(
                        "{}.{} has no join collection",
                        entity.entity_type(),
                        desc.property()
                    )));
                };
                let Some(owner_id) = entity.id() else {
                    tracing::warn!(
                        entity_type = entity.entity_type(),
                        property = desc.property(),
                        "Skipping links of an entity without identity"
                    );
                    continue;
                };
                touched = true;
                let ops = collection
                    .pending_unlinks()
                    .iter()
                    .map(|p| (false, p))
                    .chain(collection.pending_links().iter().map(|p| (true, p)));
                for (link, proxy) in ops {
                    let Some(remote_id) = proxy.target_id() else {
                        tracing::debug!(
                            target_type = proxy.target_type(),
                            "Link target has no identity yet; keeping it pending"
                        );
                        continue;
                    };
                    let op = if link {
                        LinkOp::link(
                            &join.name,
                            &join.local_key,
                            owner_id.clone(),
                            &join.remote_key,
                            remote_id,
                        )
                    } else {
                        LinkOp::unlink(
                            &join.name,
                            &join.local_key,
                            owner_id.clone(),
                            &join.remote_key,
                            remote_id,
                        )
                    };
                    self.run(op.describe(), |store| op.execute(store))?;
                    if link {
                        self.report.linked += 1;
                    } else {
                        self.report.unlinked += 1;
                    }
                }
            }
            if touched {
                let remaining = entity.settle_pending_links();
                if remaining > 0 {
                    tracing::debug!(
                        entity_type = entity.entity_type(),
                        remaining,
                        "Links left pending"
                    );
                }
            }
        }
        Ok(())
    }
}
