//! In-memory store implementation.

use crate::matcher::matches;
use docmodel_core::value::lookup_path;
use docmodel_core::{
    Document, DocumentStore, Filter, ID_KEY, Result, StoreError, StoreErrorKind, Update, Value,
    id_string,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of a logged driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Find,
    Insert,
    Update,
    Remove,
    Count,
    Hint,
}

impl OperationKind {
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            OperationKind::Insert | OperationKind::Update | OperationKind::Remove
        )
    }
}

/// One logged driver call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub collection: String,
    /// Filter for find/update/remove/count, the record for insert.
    pub document: Document,
}

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Also log find/count/hint calls, not only writes.
    pub log_reads: bool,
}

#[derive(Default)]
struct MemoryInner {
    collections: BTreeMap<String, Vec<Document>>,
    log: Vec<Operation>,
    indexes: BTreeMap<String, Vec<String>>,
    next_id: u64,
}

/// A shared, in-process document store.
///
/// Clones share the same data. Records keep insertion order, so `find`
/// results are deterministic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
    config: MemoryConfig,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with custom configuration.
    #[must_use]
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::default(),
            config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn log(&self, inner: &mut MemoryInner, kind: OperationKind, collection: &str, doc: &Document) {
        if kind.is_write() || self.config.log_reads {
            inner.log.push(Operation {
                kind,
                collection: collection.to_string(),
                document: doc.clone(),
            });
        }
    }

    /// Every logged call, oldest first.
    pub fn operations(&self) -> Vec<Operation> {
        self.read().log.clone()
    }

    /// Logged writes as `(kind, collection)` pairs.
    pub fn writes(&self) -> Vec<(OperationKind, String)> {
        self.read()
            .log
            .iter()
            .filter(|op| op.kind.is_write())
            .map(|op| (op.kind, op.collection.clone()))
            .collect()
    }

    /// Number of logged calls of one kind.
    pub fn count_of(&self, kind: OperationKind) -> usize {
        self.read().log.iter().filter(|op| op.kind == kind).count()
    }

    pub fn clear_log(&self) {
        self.write().log.clear();
    }

    /// Raw contents of a collection (bypasses the log).
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.read()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Paths hinted for a collection.
    pub fn hinted_indexes(&self, collection: &str) -> Vec<String> {
        self.read()
            .indexes
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Insert records directly, without logging.
    pub fn seed(&self, collection: &str, records: impl IntoIterator<Item = Document>) -> Result<()> {
        let mut inner = self.write();
        for record in records {
            Self::insert_record(&mut inner, collection, record)?;
        }
        Ok(())
    }

    /// 24 hex digits: seconds since the epoch followed by a per-store counter.
    fn generate_id(inner: &mut MemoryInner) -> String {
        inner.next_id += 1;
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        format!("{:08x}{:016x}", seconds & 0xffff_ffff, inner.next_id)
    }

    fn insert_record(inner: &mut MemoryInner, collection: &str, mut record: Document) -> Result<Value> {
        let id = match record.get(ID_KEY) {
            Some(id) if !id.is_null() => id.clone(),
            _ => {
                let id = Value::String(Self::generate_id(inner));
                record.insert(ID_KEY.to_string(), id.clone());
                id
            }
        };
        let records = inner.collections.entry(collection.to_string()).or_default();
        if records.iter().any(|r| r.get(ID_KEY) == Some(&id)) {
            return Err(StoreError::new(
                StoreErrorKind::DuplicateKey,
                format!("duplicate _id {}", id_string(&id)),
            )
            .in_collection(collection)
            .into());
        }
        records.push(record);
        Ok(id)
    }
}

fn project(record: &Document, fields: &[&str]) -> Document {
    let mut out = Document::new();
    if let Some(id) = record.get(ID_KEY) {
        out.insert(ID_KEY.to_string(), id.clone());
    }
    for field in fields {
        if let Some(value) = lookup_path(record, field) {
            set_path(&mut out, field, value.clone());
        }
    }
    out
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !child.is_object() {
                *child = Value::Object(Document::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

impl DocumentStore for MemoryStore {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Document>> {
        let mut inner = self.write();
        self.log(&mut inner, OperationKind::Find, collection, filter);
        let mut found = Vec::new();
        for record in inner.collections.get(collection).into_iter().flatten() {
            if matches(record, filter)? {
                found.push(match fields {
                    Some(fields) => project(record, fields),
                    None => record.clone(),
                });
            }
        }
        tracing::trace!(collection, found = found.len(), "memory find");
        Ok(found)
    }

    fn insert(&self, collection: &str, record: Document) -> Result<Value> {
        let mut inner = self.write();
        let id = Self::insert_record(&mut inner, collection, record.clone())?;
        let mut logged = record;
        logged.insert(ID_KEY.to_string(), id.clone());
        self.log(&mut inner, OperationKind::Insert, collection, &logged);
        tracing::trace!(collection, id = %id_string(&id), "memory insert");
        Ok(id)
    }

    fn update(&self, collection: &str, filter: &Filter, update: &Update) -> Result<u64> {
        let mut inner = self.write();
        self.log(&mut inner, OperationKind::Update, collection, filter);
        let mut matched = 0;
        if let Some(records) = inner.collections.get_mut(collection) {
            for record in records.iter_mut() {
                if !matches(record, filter)? {
                    continue;
                }
                for (path, value) in &update.set {
                    if path != ID_KEY {
                        set_path(record, path, value.clone());
                    }
                }
                for path in &update.unset {
                    if path != ID_KEY {
                        unset_path(record, path);
                    }
                }
                matched += 1;
            }
        }
        tracing::trace!(collection, matched, "memory update");
        Ok(matched)
    }

    fn remove(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut inner = self.write();
        self.log(&mut inner, OperationKind::Remove, collection, filter);
        let Some(records) = inner.collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut hits = Vec::with_capacity(records.len());
        for record in records.iter() {
            hits.push(matches(record, filter)?);
        }
        let before = records.len();
        let mut hits = hits.into_iter();
        records.retain(|_| !hits.next().unwrap_or(false));
        let removed = (before - records.len()) as u64;
        tracing::trace!(collection, removed, "memory remove");
        Ok(removed)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut inner = self.write();
        self.log(&mut inner, OperationKind::Count, collection, filter);
        let mut count = 0;
        for record in inner.collections.get(collection).into_iter().flatten() {
            if matches(record, filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn hint_index(&self, collection: &str, path: &str) -> Result<()> {
        let mut inner = self.write();
        let mut doc = Document::new();
        doc.insert(path.to_string(), Value::Bool(true));
        self.log(&mut inner, OperationKind::Hint, collection, &doc);
        let paths = inner.indexes.entry(collection.to_string()).or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
        Ok(())
    }
}
