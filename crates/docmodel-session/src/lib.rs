//! Session and Unit of Work for DocModel.
//!
//! `docmodel-session` is the **unit-of-work layer**. It coordinates entity
//! identity, change tracking and cascading persistence against a
//! [`DocumentStore`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one live handle per persisted record.
//! - **Change tracking**: inserts, updates and deletes are recorded and only
//!   written on [`Session::flush`].
//! - **Association wiring**: loaded entities get proxies, reverse proxies and
//!   many-to-many collections according to the registry.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: No autoflush by default.
//! - **No hidden back-references**: proxies resolve through whatever
//!   [`EntityLoader`] is passed to them, usually the session itself.
//! - **No transactions**: a failed flush reports what was already written.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(store, registry);
//!
//! let book = session.collection("Book")?.create();
//! book.set("title", "The Dispossessed")?;
//! session.persist(&[book.clone()])?;
//! session.flush()?;
//!
//! let author = book.reference("author")?.unwrap().resolve(&mut session)?;
//! session.delete(&[book])?;
//! session.flush()?;
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod manager;
pub mod n1_detection;
pub mod unit_of_work;

pub use change_tracker::{ChangeSet, ChangeTracker, RecordSnapshot};
pub use flush::{CommitReport, DependencyGraph, LinkOp};
pub use identity_map::{IdentityKey, IdentityMap};
pub use manager::SessionManager;
pub use n1_detection::{N1QueryTracker, N1Stats};
pub use unit_of_work::{
    CommitContext, CommitOptions, CommitOutcome, PendingCounts, Record, RecordStatus, UnitOfWork,
};

use docmodel_core::store::{by_id, by_ids, field_eq};
use docmodel_core::{
    AssociationCollection, AssociationDescriptor, AssociationValue, Cardinality, Cascade,
    Document, DocumentStore, Entity, EntityLoader, EntityToken, Error, Filter, ID_KEY, Proxy,
    Registry, Result, SessionId, TypeMetadata, Value, id_string,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether to flush pending changes before collection queries.
    pub auto_flush: bool,
    /// Whether flush scans CLEAN entities for modifications.
    pub detect_dirty: bool,
    /// Whether loads return the already-live handle of a persisted record.
    pub identity_map: bool,
    /// Single proxy resolutions per association before an N+1 warning
    /// (`None` disables detection).
    pub n1_threshold: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: false,
            detect_dirty: true,
            identity_map: true,
            n1_threshold: Some(3),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn detect_dirty(mut self, value: bool) -> Self {
        self.detect_dirty = value;
        self
    }

    #[must_use]
    pub fn identity_map(mut self, value: bool) -> Self {
        self.identity_map = value;
        self
    }

    #[must_use]
    pub fn n1_threshold(mut self, value: Option<usize>) -> Self {
        self.n1_threshold = value;
        self
    }
}

// ============================================================================
// Loading and Association Wiring
// ============================================================================

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a session owns except its unit of work.
///
/// Split out so the unit of work can borrow it as a [`CommitContext`]
/// while being mutated itself.
struct SessionContext<S: DocumentStore> {
    id: SessionId,
    store: S,
    registry: Arc<Registry>,
    config: SessionConfig,
    identity_map: IdentityMap,
    n1: N1QueryTracker,
    /// Materialized entities not yet handed to the unit of work.
    loaded: Vec<(Entity, Document)>,
}

/// Move the stored association fields out of a raw record.
fn split_stored(meta: &TypeMetadata, doc: &mut Document) -> Document {
    let mut stored = Document::new();
    for desc in meta.associations() {
        if desc.is_stored() {
            if let Some(value) = doc.remove(desc.property()) {
                stored.insert(desc.property().to_string(), value);
            }
        }
    }
    stored
}

impl<S: DocumentStore> SessionContext<S> {
    fn not_found(collection: &str, id: &Value) -> Error {
        Error::DocumentNotFound {
            collection: collection.to_string(),
            id: id_string(id),
        }
    }

    /// Turn a raw record into a tracked-to-be entity with wired associations.
    fn materialize(&mut self, meta: &Arc<TypeMetadata>, mut doc: Document) -> Result<Entity> {
        let Some(id) = doc.remove(ID_KEY) else {
            return Err(Error::IntegrityConstraint(format!(
                "record of collection '{}' has no {ID_KEY}",
                meta.collection()
            )));
        };
        if self.config.identity_map {
            if let Some(existing) = self.identity_map.get(meta.collection(), &id) {
                return Ok(existing);
            }
        }
        let stored = split_stored(meta, &mut doc);
        let entity = Entity::materialized(Arc::clone(meta), id, doc);
        self.wire(&entity, stored)?;
        let baseline = entity.to_record().0;
        if self.config.identity_map {
            self.identity_map.insert(&entity);
        }
        tracing::trace!(
            entity_type = meta.name(),
            entity = %entity.token(),
            "Materialized entity"
        );
        self.loaded.push((entity.clone(), baseline));
        Ok(entity)
    }

    fn find_entities(&mut self, meta: &Arc<TypeMetadata>, filter: &Filter) -> Result<Vec<Entity>> {
        let docs = self.store.find(meta.collection(), filter, None)?;
        docs.into_iter()
            .map(|doc| self.materialize(meta, doc))
            .collect()
    }

    /// Ids listed in `field` of the join documents matching `local_key == id`.
    fn join_members(&self, join_name: &str, local_key: &str, remote_key: &str, id: &Value) -> Result<Vec<Value>> {
        Ok(self
            .store
            .find(
                join_name,
                &field_eq(local_key, id.clone()),
                Some(&[remote_key][..]),
            )?
            .into_iter()
            .filter_map(|mut doc| doc.remove(remote_key))
            .collect())
    }

    fn wire_owning(
        &self,
        entity: &Entity,
        desc: &AssociationDescriptor,
        id: &Value,
        stored: &mut Document,
    ) -> Result<AssociationValue> {
        let malformed = |found: &Value| {
            Error::IntegrityConstraint(format!(
                "{}.{} is {} but the stored value is {found}",
                entity.entity_type(),
                desc.property(),
                desc.cardinality()
            ))
        };
        match desc.cardinality() {
            Cardinality::OneToOne | Cardinality::ManyToOne => {
                match stored.remove(desc.property()) {
                    None | Some(Value::Null) => Ok(AssociationValue::One(None)),
                    Some(found @ (Value::Array(_) | Value::Object(_))) => Err(malformed(&found)),
                    Some(target) => Ok(AssociationValue::One(Some(Proxy::make(
                        self.id, target, desc,
                    )))),
                }
            }
            Cardinality::OneToMany => match stored.remove(desc.property()) {
                None | Some(Value::Null) => Ok(AssociationValue::Many(Vec::new())),
                Some(Value::Array(ids)) => Ok(AssociationValue::Many(
                    ids.into_iter()
                        .map(|target| Proxy::make(self.id, target, desc))
                        .collect(),
                )),
                Some(found) => Err(malformed(&found)),
            },
            Cardinality::ManyToMany => {
                let join = desc.join_collection().ok_or_else(|| {
                    Error::IntegrityConstraint(format!(
                        "{}.{} has no join collection",
                        entity.entity_type(),
                        desc.property()
                    ))
                })?;
                let members = self
                    .join_members(&join.name, &join.local_key, &join.remote_key, id)?
                    .into_iter()
                    .map(|target| Proxy::make(self.id, target, desc))
                    .collect();
                Ok(AssociationValue::Collection(AssociationCollection::loaded(
                    Some(join.clone()),
                    desc.is_read_only(),
                    members,
                )))
            }
        }
    }

    fn wire_inverted(
        &self,
        entity: &Entity,
        desc: &AssociationDescriptor,
        id: &Value,
    ) -> Result<AssociationValue> {
        let owning = self.registry.inverse_of(entity.entity_type(), desc)?;
        if owning.cardinality() == Cardinality::ManyToMany {
            let Some(join) = owning.join_collection().map(|j| j.swapped()) else {
                return Err(Error::IntegrityConstraint(format!(
                    "{}.{} has no join collection",
                    desc.target_type(),
                    owning.property()
                )));
            };
            let members = self
                .join_members(&join.name, &join.local_key, &join.remote_key, id)?
                .into_iter()
                .map(|target| Proxy::reverse(self.id, target, desc))
                .collect();
            return Ok(AssociationValue::Collection(AssociationCollection::loaded(
                Some(join),
                true,
                members,
            )));
        }

        let target = self.registry.metadata(desc.target_type())?;
        let proxies: Vec<Proxy> = self
            .store
            .find(
                target.collection(),
                &field_eq(owning.property(), id.clone()),
                Some(&[ID_KEY][..]),
            )?
            .into_iter()
            .filter_map(|mut doc| doc.remove(ID_KEY))
            .map(|target| Proxy::reverse(self.id, target, desc))
            .collect();

        if !desc.cardinality().is_single() {
            return Ok(AssociationValue::Many(proxies));
        }
        if proxies.len() > 1 {
            return Err(Error::IntegrityConstraint(format!(
                "{}.{} is {} but {} records of '{}' refer to {}",
                entity.entity_type(),
                desc.property(),
                desc.cardinality(),
                proxies.len(),
                target.collection(),
                id_string(id)
            )));
        }
        Ok(AssociationValue::One(proxies.into_iter().next()))
    }

    /// Install proxies for every association of a persisted entity.
    fn wire(&self, entity: &Entity, mut stored: Document) -> Result<()> {
        let Some(id) = entity.id() else {
            return Err(Error::IntegrityConstraint(format!(
                "cannot wire associations of {} {} without identity",
                entity.entity_type(),
                entity.token()
            )));
        };
        let meta = Arc::clone(entity.metadata());
        for desc in meta.associations() {
            let value = if desc.is_owning_side() {
                self.wire_owning(entity, desc, &id, &mut stored)?
            } else {
                self.wire_inverted(entity, desc, &id)?
            };
            entity.wire(desc.property(), value);
        }
        Ok(())
    }
}

impl<S: DocumentStore> EntityLoader for SessionContext<S> {
    fn load(&mut self, entity_type: &str, id: &Value) -> Result<Entity> {
        let meta = Arc::clone(self.registry.metadata(entity_type)?);
        if self.config.identity_map {
            if let Some(existing) = self.identity_map.get(meta.collection(), id) {
                return Ok(existing);
            }
        }
        let doc = self
            .store
            .find_one(meta.collection(), &by_id(id))?
            .ok_or_else(|| Self::not_found(meta.collection(), id))?;
        self.materialize(&meta, doc)
    }

    fn record_resolution(&mut self, entity_type: &str, property: &str) {
        self.n1.record_load(entity_type, property);
    }
}

impl<S: DocumentStore> CommitContext for SessionContext<S> {
    fn store(&self) -> &dyn DocumentStore {
        &self.store
    }

    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn take_loaded(&mut self) -> Vec<(Entity, Document)> {
        std::mem::take(&mut self.loaded)
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit-of-work session over one document store.
///
/// Entities are plain handles; the session tracks which of them are new,
/// modified or deleted and writes the difference on [`Session::flush`].
pub struct Session<S: DocumentStore> {
    uow: UnitOfWork,
    ctx: SessionContext<S>,
}

impl<S: DocumentStore> Session<S> {
    /// Create a session with the default configuration.
    pub fn new(store: S, registry: Arc<Registry>) -> Self {
        Self::with_config(store, registry, SessionConfig::default())
    }

    pub fn with_config(store: S, registry: Arc<Registry>, config: SessionConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, ?config, "Opening session");
        Self {
            uow: UnitOfWork::new(),
            ctx: SessionContext {
                id,
                store,
                registry,
                n1: N1QueryTracker::from_threshold(config.n1_threshold),
                config,
                identity_map: IdentityMap::new(),
                loaded: Vec::new(),
            },
        }
    }

    pub fn id(&self) -> SessionId {
        self.ctx.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    pub fn store(&self) -> &S {
        &self.ctx.store
    }

    /// Hand freshly materialized entities to the unit of work.
    fn sync(&mut self) {
        for (entity, baseline) in self.ctx.take_loaded() {
            self.uow.track_loaded(&entity, baseline);
        }
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Accessor for the collection of `entity_type`.
    pub fn collection(&mut self, entity_type: &str) -> Result<Collection<'_, S>> {
        let meta = Arc::clone(self.ctx.registry.metadata(entity_type)?);
        Ok(Collection {
            session: self,
            meta,
        })
    }

    // ========================================================================
    // Unit of Work Operations
    // ========================================================================

    /// Schedule entities for writing.
    ///
    /// Untracked entities are registered NEW; tracked, modified ones are
    /// marked DIRTY. Persisting an entity scheduled for deletion fails with
    /// [`Error::Update`].
    #[tracing::instrument(level = "debug", skip(self, entities), fields(count = entities.len()))]
    pub fn persist(&mut self, entities: &[Entity]) -> Result<()> {
        self.sync();
        for entity in entities {
            self.ctx.registry.metadata(entity.entity_type())?;
            match self.uow.status(entity) {
                None => self.uow.register_new(entity)?,
                Some(RecordStatus::Clean) => {
                    if self.uow.is_modified(entity) {
                        self.uow.register_dirty(entity)?;
                    }
                }
                Some(RecordStatus::Deleted) => self.uow.register_dirty(entity)?,
                Some(RecordStatus::New | RecordStatus::Dirty | RecordStatus::Cancelled) => {}
            }
        }
        Ok(())
    }

    /// Schedule entities for removal. Unsaved entities are simply cancelled.
    #[tracing::instrument(level = "debug", skip(self, entities), fields(count = entities.len()))]
    pub fn delete(&mut self, entities: &[Entity]) -> Result<()> {
        self.sync();
        for entity in entities {
            self.uow.register_deleted(entity)?;
        }
        Ok(())
    }

    /// Re-read an entity from the store, discarding in-memory changes.
    ///
    /// Cascades to the targets of owning associations declaring REFRESH.
    /// Inverted associations never cascade a refresh; such a cascade is
    /// skipped with a warning.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity_type = entity.entity_type()))]
    pub fn refresh(&mut self, entity: &Entity) -> Result<()> {
        self.sync();
        let mut visited = HashSet::new();
        self.refresh_one(entity, &mut visited)
    }

    fn refresh_one(&mut self, entity: &Entity, visited: &mut HashSet<EntityToken>) -> Result<()> {
        if !visited.insert(entity.token()) {
            return Ok(());
        }
        let Some(id) = entity.id() else {
            return Err(Error::IntegrityConstraint(format!(
                "cannot refresh {} {} without identity",
                entity.entity_type(),
                entity.token()
            )));
        };
        let meta = Arc::clone(entity.metadata());
        let mut doc = self
            .ctx
            .store
            .find_one(meta.collection(), &by_id(&id))?
            .ok_or_else(|| SessionContext::<S>::not_found(meta.collection(), &id))?;
        doc.remove(ID_KEY);
        let stored = split_stored(&meta, &mut doc);
        entity.replace_attributes(doc);
        self.ctx.wire(entity, stored)?;
        self.uow.refreshed(entity, entity.to_record().0);
        if self.ctx.config.identity_map {
            self.ctx.identity_map.insert(entity);
        }
        tracing::trace!(entity = %entity.token(), "Refreshed from store");

        for desc in meta.associations() {
            if !desc.cascades(Cascade::REFRESH) {
                continue;
            }
            if !desc.is_owning_side() {
                tracing::warn!(
                    entity_type = meta.name(),
                    property = desc.property(),
                    "Refresh does not cascade through an inverted association; skipped"
                );
                continue;
            }
            for proxy in entity.references(desc.property())? {
                let target = match (proxy.actual(), proxy.target_id()) {
                    (Some(target), _) => target,
                    (None, Some(target_id)) => {
                        let target = self.ctx.load(proxy.target_type(), &target_id)?;
                        self.sync();
                        proxy.prime(target.clone());
                        target
                    }
                    (None, None) => continue,
                };
                self.refresh_one(&target, visited)?;
            }
        }
        Ok(())
    }

    /// Write all pending changes to the store.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<CommitReport> {
        let options = CommitOptions {
            detect_dirty: self.ctx.config.detect_dirty,
        };
        let outcome = self.uow.commit(&mut self.ctx, options)?;
        for entity in &outcome.removed {
            self.ctx.identity_map.remove(entity);
        }
        if self.ctx.config.identity_map {
            for entity in &outcome.inserted {
                self.ctx.identity_map.insert(entity);
            }
        }
        Ok(outcome.report)
    }

    /// Resolve the `property` proxies of many entities with one store query.
    ///
    /// Returns the number of proxies resolved.
    #[tracing::instrument(level = "debug", skip(self, entities), fields(count = entities.len()))]
    pub fn resolve_all(&mut self, entities: &[Entity], property: &str) -> Result<usize> {
        self.sync();
        let mut pending = Vec::new();
        for entity in entities {
            for proxy in entity.references(property)? {
                if !proxy.is_resolved() && proxy.target_id().is_some() {
                    pending.push(proxy);
                }
            }
        }
        let Some(first) = pending.first() else {
            return Ok(0);
        };
        let meta = Arc::clone(self.ctx.registry.metadata(first.target_type())?);

        let mut found: HashMap<String, Entity> = HashMap::new();
        let mut missing: Vec<Value> = Vec::new();
        for proxy in &pending {
            let Some(id) = proxy.target_id() else {
                continue;
            };
            let key = id_string(&id);
            if found.contains_key(&key) || missing.iter().any(|m| id_string(m) == key) {
                continue;
            }
            let live = if self.ctx.config.identity_map {
                self.ctx.identity_map.get(meta.collection(), &id)
            } else {
                None
            };
            match live {
                Some(entity) => {
                    found.insert(key, entity);
                }
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            for entity in self.ctx.find_entities(&meta, &by_ids(&missing))? {
                if let Some(id) = entity.id() {
                    found.insert(id_string(&id), entity);
                }
            }
            self.sync();
        }

        let mut resolved = 0usize;
        for proxy in &pending {
            let target = proxy
                .target_id()
                .and_then(|id| found.get(&id_string(&id)).cloned());
            match target {
                Some(target) => {
                    proxy.prime(target);
                    resolved += 1;
                }
                None => tracing::warn!(
                    target_type = proxy.target_type(),
                    property,
                    "Dangling reference: proxy target not found in store"
                ),
            }
        }
        tracing::debug!(property, resolved, queried = missing.len(), "Batch-resolved proxies");
        Ok(resolved)
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Status of an entity in this session, if tracked.
    pub fn record_status(&self, entity: &Entity) -> Option<RecordStatus> {
        self.uow.status(entity)
    }

    /// Number of entities tracked by the unit of work.
    pub fn tracked_count(&self) -> usize {
        self.uow.len() + self.ctx.loaded.len()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.uow.pending_counts()
    }

    /// Attribute changes of a tracked entity since it was loaded or flushed.
    pub fn change_set(&mut self, entity: &Entity) -> Result<ChangeSet> {
        self.sync();
        self.uow.change_set(entity)
    }

    pub fn n1_stats(&self) -> N1Stats {
        self.ctx.n1.stats()
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    /// Stop tracking an entity; its pending writes are dropped.
    pub fn evict(&mut self, entity: &Entity) -> bool {
        self.sync();
        let mapped = self.ctx.identity_map.remove(entity);
        self.uow.evict(entity) || mapped
    }

    /// Forget every tracked entity and pending change.
    pub fn clear(&mut self) {
        self.uow.clear();
        self.ctx.identity_map.clear();
        self.ctx.loaded.clear();
        self.ctx.n1.reset();
        tracing::debug!(session = self.ctx.id, "Session cleared");
    }
}

impl<S: DocumentStore> EntityLoader for Session<S> {
    fn load(&mut self, entity_type: &str, id: &Value) -> Result<Entity> {
        let entity = self.ctx.load(entity_type, id)?;
        self.sync();
        Ok(entity)
    }

    fn record_resolution(&mut self, entity_type: &str, property: &str) {
        self.ctx.record_resolution(entity_type, property);
    }
}

// ============================================================================
// Collection Accessor
// ============================================================================

/// Access to the records of one entity type, bound to a session.
pub struct Collection<'s, S: DocumentStore> {
    session: &'s mut Session<S>,
    meta: Arc<TypeMetadata>,
}

impl<S: DocumentStore> Collection<'_, S> {
    /// Backing collection name.
    pub fn name(&self) -> &str {
        self.meta.collection()
    }

    pub fn entity_type(&self) -> &str {
        self.meta.name()
    }

    /// New, untracked entity of this type.
    pub fn create(&self) -> Entity {
        Entity::new(Arc::clone(&self.meta))
    }

    fn before_query(&mut self) -> Result<()> {
        if self.session.ctx.config.auto_flush && !self.session.pending_counts().is_empty() {
            tracing::debug!(collection = self.name(), "Auto-flushing before query");
            self.session.flush()?;
        }
        Ok(())
    }

    /// Load one entity by identity.
    pub fn get(&mut self, id: impl Into<Value>) -> Result<Entity> {
        let id = id.into();
        self.session.load(self.meta.name(), &id)
    }

    pub fn find(&mut self, filter: &Filter) -> Result<Vec<Entity>> {
        self.before_query()?;
        let entities = self.session.ctx.find_entities(&self.meta, filter)?;
        self.session.sync();
        Ok(entities)
    }

    pub fn find_one(&mut self, filter: &Filter) -> Result<Option<Entity>> {
        Ok(self.find(filter)?.into_iter().next())
    }

    pub fn count(&mut self, filter: &Filter) -> Result<u64> {
        self.before_query()?;
        self.session.ctx.store.count(self.meta.collection(), filter)
    }

    /// Run a statement such as `"year >= :since"` against this collection.
    pub fn query(&mut self, statement: &str, params: &Document) -> Result<Vec<Entity>> {
        self.query_all(&[statement], params)
    }

    /// Run several statements combined with AND.
    #[tracing::instrument(level = "debug", skip(self, params), fields(collection = self.meta.collection()))]
    pub fn query_all(&mut self, statements: &[&str], params: &Document) -> Result<Vec<Entity>> {
        let query = docmodel_query::build(statements, params)?;
        for hint in &query.hints {
            self.session
                .ctx
                .store
                .hint_index(self.meta.collection(), &hint.path)?;
        }
        self.find(&query.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel_core::JoinCollection;
    use docmodel_memory::MemoryStore;
    use serde_json::json;

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register("Author", "authors").unwrap();
        registry.register("Book", "books").unwrap();
        registry.register("Tag", "tags").unwrap();
        registry
            .declare(
                "Book",
                AssociationDescriptor::many_to_one("author", "Author")
                    .cascade(Cascade::PERSIST | Cascade::REFRESH),
            )
            .unwrap();
        registry
            .declare(
                "Author",
                AssociationDescriptor::one_to_many("books", "Book")
                    .inverted_by("author")
                    .cascade(Cascade::REFRESH),
            )
            .unwrap();
        registry
            .declare(
                "Book",
                AssociationDescriptor::many_to_many("tags", "Tag")
                    .join(JoinCollection::new("book_tags", "book_id", "tag_id")),
            )
            .unwrap();
        registry.shared().unwrap()
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_config_defaults_and_serde() {
        let config = SessionConfig::default();
        assert!(!config.auto_flush);
        assert!(config.detect_dirty);
        assert!(config.identity_map);
        assert_eq!(config.n1_threshold, Some(3));

        let parsed: SessionConfig =
            serde_json::from_value(json!({"auto_flush": true, "n1_threshold": null})).unwrap();
        assert_eq!(
            parsed,
            SessionConfig::new().auto_flush(true).n1_threshold(None)
        );
    }

    #[test]
    fn test_persist_flush_and_load() {
        let store = MemoryStore::new();
        let mut session = Session::new(store.clone(), registry());

        let author = session.collection("Author").unwrap().create();
        author.set("name", "Ursula").unwrap();
        let book = session.collection("Book").unwrap().create();
        book.set("title", "The Dispossessed").unwrap();
        book.set_reference("author", Some(&author)).unwrap();

        session.persist(&[book.clone()]).unwrap();
        let report = session.flush().unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(session.record_status(&author), Some(RecordStatus::Clean));

        let author_id = author.id().unwrap();
        let stored = store.documents("books");
        assert_eq!(stored[0].get("author"), Some(&author_id));

        let book_id = book.id().unwrap();
        let mut other = Session::new(store.clone(), registry());
        let loaded = other.collection("Book").unwrap().get(book_id).unwrap();
        assert_eq!(loaded.get("title"), Some(json!("The Dispossessed")));
        let proxy = loaded.reference("author").unwrap().unwrap();
        assert!(!proxy.is_resolved());
        let resolved = proxy.resolve(&mut other).unwrap();
        assert_eq!(resolved.get("name"), Some(json!("Ursula")));
        assert_eq!(other.tracked_count(), 2);
    }

    #[test]
    fn test_identity_map_returns_same_handle() {
        let store = MemoryStore::new();
        store
            .seed("authors", vec![doc(json!({"_id": "a1", "name": "Ursula"}))])
            .unwrap();
        let mut session = Session::new(store.clone(), registry());
        let first = session.collection("Author").unwrap().get("a1").unwrap();
        let second = session.collection("Author").unwrap().get("a1").unwrap();
        assert!(first.is_same(&second));

        let config = SessionConfig::new().identity_map(false);
        let mut plain = Session::with_config(store, registry(), config);
        let first = plain.collection("Author").unwrap().get("a1").unwrap();
        let second = plain.collection("Author").unwrap().get("a1").unwrap();
        assert!(!first.is_same(&second));
    }

    #[test]
    fn test_inverted_association_is_wired_read_only() {
        let store = MemoryStore::new();
        store
            .seed("authors", vec![doc(json!({"_id": "a1", "name": "Ursula"}))])
            .unwrap();
        store
            .seed(
                "books",
                vec![
                    doc(json!({"_id": "b1", "title": "Lathe", "author": "a1"})),
                    doc(json!({"_id": "b2", "title": "Tehanu", "author": "a1"})),
                    doc(json!({"_id": "b3", "title": "Dune", "author": "a2"})),
                ],
            )
            .unwrap();

        let mut session = Session::new(store, registry());
        let author = session.collection("Author").unwrap().get("a1").unwrap();
        let books = author.references("books").unwrap();
        assert_eq!(books.len(), 2);
        assert!(books.iter().all(Proxy::is_reverse));

        let err = books[0]
            .set(&mut session, "title", json!("Changed"))
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnlyProxy { .. }));
    }

    #[test]
    fn test_missing_document() {
        let mut session = Session::new(MemoryStore::new(), registry());
        let err = session.collection("Book").unwrap().get("nope").unwrap_err();
        assert!(matches!(err, Error::DocumentNotFound { .. }));
    }

    #[test]
    fn test_malformed_reference_is_an_integrity_error() {
        let store = MemoryStore::new();
        store
            .seed("books", vec![doc(json!({"_id": "b1", "author": ["a1", "a2"]}))])
            .unwrap();
        let mut session = Session::new(store, registry());
        let err = session.collection("Book").unwrap().get("b1").unwrap_err();
        assert!(matches!(err, Error::IntegrityConstraint(_)));
    }

    #[test]
    fn test_detect_dirty_writes_changes() {
        let store = MemoryStore::new();
        store
            .seed("books", vec![doc(json!({"_id": "b1", "title": "Lathe", "draft": true}))])
            .unwrap();
        let mut session = Session::new(store.clone(), registry());
        let book = session.collection("Book").unwrap().get("b1").unwrap();
        book.set("title", "The Lathe of Heaven").unwrap();
        book.unset("draft").unwrap();

        let changes = session.change_set(&book).unwrap();
        assert_eq!(changes.unset, vec!["draft".to_string()]);

        let report = session.flush().unwrap();
        assert_eq!(report.updated, 1);
        let stored = &store.documents("books")[0];
        assert_eq!(stored.get("title"), Some(&json!("The Lathe of Heaven")));
        assert!(stored.get("draft").is_none());
        assert_eq!(session.record_status(&book), Some(RecordStatus::Clean));
        assert!(session.flush().unwrap().is_empty());
    }

    #[test]
    fn test_detect_dirty_disabled_requires_persist() {
        let store = MemoryStore::new();
        store
            .seed("books", vec![doc(json!({"_id": "b1", "title": "Lathe"}))])
            .unwrap();
        let config = SessionConfig::new().detect_dirty(false);
        let mut session = Session::with_config(store.clone(), registry(), config);
        let book = session.collection("Book").unwrap().get("b1").unwrap();
        book.set("title", "Tehanu").unwrap();
        assert!(session.flush().unwrap().is_empty());

        session.persist(&[book]).unwrap();
        assert_eq!(session.pending_counts().dirty, 1);
        assert_eq!(session.flush().unwrap().updated, 1);
        assert_eq!(
            store.documents("books")[0].get("title"),
            Some(&json!("Tehanu"))
        );
    }

    #[test]
    fn test_evict_and_clear() {
        let store = MemoryStore::new();
        store
            .seed("books", vec![doc(json!({"_id": "b1", "title": "Lathe"}))])
            .unwrap();
        let mut session = Session::new(store, registry());
        let book = session.collection("Book").unwrap().get("b1").unwrap();
        assert_eq!(session.tracked_count(), 1);
        assert!(session.evict(&book));
        assert_eq!(session.record_status(&book), None);

        let again = session.collection("Book").unwrap().get("b1").unwrap();
        assert!(!again.is_same(&book));
        session.clear();
        assert_eq!(session.tracked_count(), 0);
    }
}
