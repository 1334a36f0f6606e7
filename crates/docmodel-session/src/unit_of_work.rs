//! Unit of Work: the per-session registry of pending changes.
//!
//! Every tracked entity has a [`RecordStatus`]. Transitions:
//!
//! | from \ call | `register_new` | `register_clean` | `register_dirty` | `register_deleted` |
//! |-------------|----------------|------------------|------------------|--------------------|
//! | untracked   | NEW            | CLEAN            | UnknownRecord    | UnknownRecord      |
//! | NEW         | Repeated       | Repeated         | NEW              | CANCELLED (dropped)|
//! | CLEAN       | Repeated       | Repeated         | DIRTY            | DELETED            |
//! | DIRTY       | Repeated       | Repeated         | DIRTY            | DELETED            |
//! | DELETED     | Repeated       | Repeated         | UpdateError      | DELETED            |
//!
//! [`UnitOfWork::commit`] expands cascades, orders the writes, executes them
//! and moves every written record back to CLEAN (or drops it when deleted).

use crate::cascade;
use crate::change_tracker::{ChangeSet, ChangeTracker};
use crate::flush::{CommitReport, DependencyGraph, DependencyNode, Executor};
use docmodel_core::{
    Document, DocumentStore, Entity, EntityLoader, EntityToken, Error, RecordError, Registry,
    Result, Value, id_string,
};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Lifecycle status of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    /// Registered for insertion.
    New,
    /// Persisted and unchanged since its baseline.
    Clean,
    /// Persisted and modified.
    Dirty,
    /// Persisted and scheduled for removal.
    Deleted,
    /// Registered new then deleted before any write; never tracked afterwards.
    Cancelled,
}

impl RecordStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RecordStatus::New => "NEW",
            RecordStatus::Clean => "CLEAN",
            RecordStatus::Dirty => "DIRTY",
            RecordStatus::Deleted => "DELETED",
            RecordStatus::Cancelled => "CANCELLED",
        }
    }

    /// Does this status produce a write at commit time?
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            RecordStatus::New | RecordStatus::Dirty | RecordStatus::Deleted
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked entity and its status.
#[derive(Debug, Clone)]
pub struct Record {
    entity: Entity,
    status: RecordStatus,
}

impl Record {
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }
}

/// Count of pending writes by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub new: usize,
    pub dirty: usize,
    pub deleted: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// What the unit of work needs from its session during a commit.
pub trait CommitContext: EntityLoader {
    fn store(&self) -> &dyn DocumentStore;

    fn registry(&self) -> &Registry;

    /// Entities materialized since the last call, each with the record it
    /// was loaded from.
    fn take_loaded(&mut self) -> Vec<(Entity, Document)>;
}

/// Commit behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct CommitOptions {
    /// Promote modified CLEAN entities to DIRTY before planning.
    pub detect_dirty: bool,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self { detect_dirty: true }
    }
}

/// Result of a successful commit.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub report: CommitReport,
    /// Entities inserted by this commit (now CLEAN, with an identity).
    pub inserted: Vec<Entity>,
    /// Entities removed by this commit (no longer tracked).
    pub removed: Vec<Entity>,
}

/// Tracks entity statuses and baselines for one session.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    records: HashMap<EntityToken, Record>,
    /// Registration order, used to break ties when ordering writes.
    order: Vec<EntityToken>,
    change_tracker: ChangeTracker,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    fn repeated(&self, entity: &Entity) -> Option<Error> {
        self.records.get(&entity.token()).map(|record| {
            Error::RepeatedRegistration(RecordError::new(
                entity.entity_type(),
                entity.token(),
                format!("already tracked as {}", record.status),
            ))
        })
    }

    fn unknown(entity: &Entity) -> Error {
        Error::UnknownRecord(RecordError::new(
            entity.entity_type(),
            entity.token(),
            "not tracked by this unit of work",
        ))
    }

    fn track(&mut self, entity: &Entity, status: RecordStatus) {
        self.records.insert(
            entity.token(),
            Record {
                entity: entity.clone(),
                status,
            },
        );
        self.order.push(entity.token());
    }

    fn drop_record(&mut self, token: EntityToken) -> Option<Record> {
        let record = self.records.remove(&token)?;
        self.order.retain(|t| *t != token);
        self.change_tracker.clear(token);
        Some(record)
    }

    fn transition(entity: &Entity, from: Option<RecordStatus>, to: RecordStatus) {
        tracing::trace!(
            entity = %entity.token(),
            entity_type = entity.entity_type(),
            from = from.map_or("untracked", RecordStatus::as_str),
            to = %to,
            "Record transition"
        );
    }

    /// Track an entity that should be inserted.
    pub fn register_new(&mut self, entity: &Entity) -> Result<()> {
        if let Some(err) = self.repeated(entity) {
            return Err(err);
        }
        self.track(entity, RecordStatus::New);
        Self::transition(entity, None, RecordStatus::New);
        Ok(())
    }

    /// Track a persisted entity, taking its current record as the baseline.
    pub fn register_clean(&mut self, entity: &Entity) -> Result<()> {
        if let Some(err) = self.repeated(entity) {
            return Err(err);
        }
        self.change_tracker
            .snapshot(entity.token(), entity.to_record().0);
        self.track(entity, RecordStatus::Clean);
        Self::transition(entity, None, RecordStatus::Clean);
        Ok(())
    }

    /// Track a just-materialized entity with the record it was read from.
    /// Returns `false` if it was already tracked.
    pub fn track_loaded(&mut self, entity: &Entity, baseline: Document) -> bool {
        if self.records.contains_key(&entity.token()) {
            return false;
        }
        self.change_tracker.snapshot(entity.token(), baseline);
        self.track(entity, RecordStatus::Clean);
        true
    }

    /// Reset the baseline of an entity that was just re-read from the store.
    ///
    /// CLEAN/DIRTY records become CLEAN; a DELETED record stays DELETED.
    /// An untracked entity starts being tracked as CLEAN.
    pub fn refreshed(&mut self, entity: &Entity, baseline: Document) {
        let Some(record) = self.records.get_mut(&entity.token()) else {
            self.track_loaded(entity, baseline);
            return;
        };
        if matches!(record.status, RecordStatus::Clean | RecordStatus::Dirty) {
            record.status = RecordStatus::Clean;
        }
        tracing::trace!(entity = %entity.token(), status = %record.status, "Baseline refreshed");
        self.change_tracker.snapshot(entity.token(), baseline);
    }

    /// Mark a tracked entity as modified.
    pub fn register_dirty(&mut self, entity: &Entity) -> Result<()> {
        let Some(record) = self.records.get_mut(&entity.token()) else {
            return Err(Self::unknown(entity));
        };
        match record.status {
            RecordStatus::Deleted => Err(Error::Update(RecordError::new(
                entity.entity_type(),
                entity.token(),
                "cannot modify an entity scheduled for deletion",
            ))),
            RecordStatus::Clean | RecordStatus::Dirty => {
                let from = record.status;
                record.status = RecordStatus::Dirty;
                Self::transition(entity, Some(from), RecordStatus::Dirty);
                Ok(())
            }
            RecordStatus::New | RecordStatus::Cancelled => Ok(()),
        }
    }

    /// Schedule a tracked entity for removal.
    ///
    /// A NEW entity is cancelled instead: it is dropped from tracking and
    /// [`RecordStatus::Cancelled`] is returned.
    pub fn register_deleted(&mut self, entity: &Entity) -> Result<RecordStatus> {
        let Some(record) = self.records.get_mut(&entity.token()) else {
            return Err(Self::unknown(entity));
        };
        let from = record.status;
        if from == RecordStatus::New {
            self.drop_record(entity.token());
            Self::transition(entity, Some(from), RecordStatus::Cancelled);
            return Ok(RecordStatus::Cancelled);
        }
        record.status = RecordStatus::Deleted;
        Self::transition(entity, Some(from), RecordStatus::Deleted);
        Ok(RecordStatus::Deleted)
    }

    /// The record of a tracked entity.
    pub fn retrieve_record(&self, entity: &Entity) -> Result<&Record> {
        self.records
            .get(&entity.token())
            .ok_or_else(|| Self::unknown(entity))
    }

    pub fn status(&self, entity: &Entity) -> Option<RecordStatus> {
        self.records.get(&entity.token()).map(|r| r.status)
    }

    pub fn is_tracked(&self, entity: &Entity) -> bool {
        self.records.contains_key(&entity.token())
    }

    /// Has a tracked entity diverged from its baseline? NEW entities always have.
    ///
    /// A reference to an entity that has no identity yet also counts as a
    /// modification, since the stored record cannot reflect it.
    pub fn is_modified(&self, entity: &Entity) -> bool {
        match self.status(entity) {
            Some(RecordStatus::New) => true,
            Some(_) => Self::diverged(&self.change_tracker, entity),
            None => false,
        }
    }

    fn diverged(tracker: &ChangeTracker, entity: &Entity) -> bool {
        let (record, missing) = entity.to_record();
        missing || tracker.is_dirty(entity.token(), &record)
    }

    /// Attribute changes of a tracked entity since its baseline.
    pub fn change_set(&self, entity: &Entity) -> Result<ChangeSet> {
        self.retrieve_record(entity)?;
        Ok(self
            .change_tracker
            .change_set(entity.token(), &entity.to_record().0))
    }

    /// Stop tracking an entity. Its pending writes are discarded.
    pub fn evict(&mut self, entity: &Entity) -> bool {
        self.drop_record(entity.token()).is_some()
    }

    /// Stop tracking everything.
    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
        self.change_tracker.clear_all();
    }

    /// Tracked records in registration order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.order.iter().filter_map(|t| self.records.get(t))
    }

    /// A tracked entity of `entity_type` with identity `id`.
    pub fn find_tracked(&self, entity_type: &str, id: &Value) -> Option<Entity> {
        let wanted = id_string(id);
        self.records()
            .map(Record::entity)
            .find(|e| {
                e.entity_type() == entity_type && e.id().is_some_and(|v| id_string(&v) == wanted)
            })
            .cloned()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for record in self.records.values() {
            match record.status {
                RecordStatus::New => counts.new += 1,
                RecordStatus::Dirty => counts.dirty += 1,
                RecordStatus::Deleted => counts.deleted += 1,
                RecordStatus::Clean | RecordStatus::Cancelled => {}
            }
        }
        counts
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.change_tracker
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Start tracking entities the session materialized since the last call.
    pub(crate) fn adopt(&mut self, ctx: &mut dyn CommitContext) {
        for (entity, baseline) in ctx.take_loaded() {
            self.track_loaded(&entity, baseline);
        }
    }

    /// Promote modified CLEAN records to DIRTY.
    fn detect_dirty(&mut self) {
        let mut promoted = 0usize;
        for record in self.records.values_mut() {
            if record.status == RecordStatus::Clean
                && Self::diverged(&self.change_tracker, &record.entity)
            {
                record.status = RecordStatus::Dirty;
                promoted += 1;
            }
        }
        if promoted > 0 {
            tracing::debug!(promoted, "Detected modified entities");
        }
    }

    fn plan(&self, cascaded: &HashMap<EntityToken, EntityToken>) -> Vec<DependencyNode> {
        let mut graph = DependencyGraph::new();
        for record in self.records() {
            if record.status.is_pending() {
                graph.add_node(&record.entity, record.status);
            }
        }
        for record in self.records() {
            if !matches!(record.status, RecordStatus::New | RecordStatus::Dirty) {
                continue;
            }
            for desc in record.entity.metadata().associations() {
                if !desc.is_stored() {
                    continue;
                }
                for proxy in record.entity.references(desc.property()).unwrap_or_default() {
                    if let Some(target) = proxy.actual() {
                        if graph.status_of(&target) == Some(RecordStatus::New) {
                            graph.add_edge(&record.entity, &target);
                        }
                    }
                }
            }
        }
        for (child, owner) in cascaded {
            if let (Some(child), Some(owner)) = (self.records.get(child), self.records.get(owner)) {
                graph.add_edge(&child.entity, &owner.entity);
            }
        }
        graph.sort()
    }

    fn live_entities(&self) -> Vec<Entity> {
        self.records()
            .filter(|r| r.status != RecordStatus::Deleted)
            .map(|r| r.entity.clone())
            .collect()
    }

    /// Write every pending change to the store.
    ///
    /// On a store failure the error is a [`docmodel_core::CommitError`];
    /// operations already issued stay applied and every record keeps its
    /// pre-commit status.
    #[tracing::instrument(level = "info", skip(self, ctx))]
    pub fn commit(
        &mut self,
        ctx: &mut dyn CommitContext,
        options: CommitOptions,
    ) -> Result<CommitOutcome> {
        let start = Instant::now();
        self.adopt(ctx);
        if options.detect_dirty {
            self.detect_dirty();
        }
        cascade::expand_persist(self, ctx)?;
        let cascaded = cascade::expand_deletes(self, ctx)?;

        let nodes = self.plan(&cascaded);
        let live = self.live_entities();
        tracing::debug!(
            writes = nodes.len(),
            cascaded_deletes = cascaded.len(),
            "Commit plan ready"
        );

        let mut executor = Executor::new(ctx.store());
        let deferred = executor.write_entities(&nodes, &self.change_tracker, ctx.registry())?;
        executor.write_deferred(&deferred)?;
        executor.write_links(&live)?;
        let report = executor.report();

        let mut outcome = CommitOutcome {
            report,
            ..CommitOutcome::default()
        };
        for node in nodes {
            let entity = node.entity();
            match node.status() {
                RecordStatus::New | RecordStatus::Dirty => {
                    if node.status() == RecordStatus::New {
                        outcome.inserted.push(entity.clone());
                    }
                    self.change_tracker
                        .snapshot(entity.token(), entity.to_record().0);
                    if let Some(record) = self.records.get_mut(&entity.token()) {
                        record.status = RecordStatus::Clean;
                    }
                }
                RecordStatus::Deleted => {
                    self.drop_record(entity.token());
                    outcome.removed.push(entity.clone());
                }
                RecordStatus::Clean | RecordStatus::Cancelled => {}
            }
        }

        tracing::info!(
            inserted = report.inserted,
            updated = report.updated,
            removed = report.removed,
            linked = report.linked,
            unlinked = report.unlinked,
            elapsed_ms = start.elapsed().as_millis(),
            "Commit finished"
        );
        Ok(outcome)
    }
}
