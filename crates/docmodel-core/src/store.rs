//! Store driver contract.
//!
//! The mapper talks to the backing document store only through
//! [`DocumentStore`]: collection-scoped CRUD by filter document. Drivers are
//! blocking; every call returns once the store has answered.
//!
//! # Filters
//!
//! A [`Filter`] is a document whose keys are attribute paths (dotted paths
//! reach into embedded documents) and whose values are either a literal or an
//! operator object:
//!
//! ```json
//! {"author": "a1", "year": {"$gte": 1970}, "title": {"$regex": "^The"}}
//! ```
//!
//! Supported operators are listed in [`OPERATORS`]. A literal matches by
//! equality, or by membership when the stored value is an array.

use crate::Result;
use crate::value::{Document, ID_KEY, Value};
use std::sync::Arc;

/// A filter document.
pub type Filter = Document;

/// Operators a driver must understand in filter documents.
pub const OPERATORS: &[&str] = &["$eq", "$lt", "$lte", "$gt", "$gte", "$in", "$regex"];

/// Filter matching every record.
pub fn match_all() -> Filter {
    Filter::new()
}

/// Filter matching one identity.
pub fn by_id(id: &Value) -> Filter {
    let mut filter = Filter::new();
    filter.insert(ID_KEY.to_string(), id.clone());
    filter
}

/// Filter matching any of `ids`.
pub fn by_ids(ids: &[Value]) -> Filter {
    field_in(ID_KEY, ids)
}

/// Filter matching `path == value` (or array membership).
pub fn field_eq(path: &str, value: Value) -> Filter {
    let mut filter = Filter::new();
    filter.insert(path.to_string(), value);
    filter
}

/// Filter matching `path` against any of `values`.
pub fn field_in(path: &str, values: &[Value]) -> Filter {
    let mut op = Document::new();
    op.insert("$in".to_string(), Value::Array(values.to_vec()));
    let mut filter = Filter::new();
    filter.insert(path.to_string(), Value::Object(op));
    filter
}

/// A partial update: `$set` and `$unset`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.unset.push(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// The update in driver wire form: `{"$set": {..}, "$unset": {name: ""}}`.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if !self.set.is_empty() {
            doc.insert("$set".to_string(), Value::Object(self.set.clone()));
        }
        if !self.unset.is_empty() {
            let unset = self
                .unset
                .iter()
                .map(|name| (name.clone(), Value::String(String::new())))
                .collect();
            doc.insert("$unset".to_string(), Value::Object(unset));
        }
        doc
    }
}

/// Blocking CRUD access to a document store.
///
/// Methods take `&self`; drivers that keep local state use interior
/// mutability so a store can be shared between sessions.
pub trait DocumentStore {
    /// Records of `collection` matching `filter`, optionally projected onto
    /// `fields` (the identity key is always included).
    fn find(&self, collection: &str, filter: &Filter, fields: Option<&[&str]>)
    -> Result<Vec<Document>>;

    /// First record matching `filter`.
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        Ok(self.find(collection, filter, None)?.into_iter().next())
    }

    /// Insert a record, returning its identity (assigned by the store when
    /// the record carries none).
    fn insert(&self, collection: &str, record: Document) -> Result<Value>;

    /// Apply `update` to every matching record. Returns the number matched.
    fn update(&self, collection: &str, filter: &Filter, update: &Update) -> Result<u64>;

    /// Remove every matching record. Returns the number removed.
    fn remove(&self, collection: &str, filter: &Filter) -> Result<u64>;

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Advise the driver that `path` is about to be searched on.
    fn hint_index(&self, _collection: &str, _path: &str) -> Result<()> {
        Ok(())
    }
}

impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Document>> {
        (**self).find(collection, filter, fields)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        (**self).find_one(collection, filter)
    }

    fn insert(&self, collection: &str, record: Document) -> Result<Value> {
        (**self).insert(collection, record)
    }

    fn update(&self, collection: &str, filter: &Filter, update: &Update) -> Result<u64> {
        (**self).update(collection, filter, update)
    }

    fn remove(&self, collection: &str, filter: &Filter) -> Result<u64> {
        (**self).remove(collection, filter)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        (**self).count(collection, filter)
    }

    fn hint_index(&self, collection: &str, path: &str) -> Result<()> {
        (**self).hint_index(collection, path)
    }
}
