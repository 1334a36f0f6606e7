#![allow(dead_code)]

use docmodel::{
    AssociationDescriptor, Cascade, Document, DocumentStore, Filter, JoinCollection, MemoryStore,
    Registry, Result, StoreError, StoreErrorKind, Update, Value,
};
use std::sync::Arc;

/// Authors, books, tags, covers and publishers.
pub fn library() -> Arc<Registry> {
    let mut registry = Registry::new();
    for (name, collection) in [
        ("Author", "authors"),
        ("Book", "books"),
        ("Tag", "tags"),
        ("Cover", "covers"),
        ("Publisher", "publishers"),
    ] {
        registry.register(name, collection).unwrap();
    }
    registry
        .declare(
            "Book",
            AssociationDescriptor::many_to_one("author", "Author")
                .cascade(Cascade::PERSIST | Cascade::REFRESH),
        )
        .unwrap();
    registry
        .declare(
            "Book",
            AssociationDescriptor::many_to_many("tags", "Tag")
                .join(JoinCollection::new("book_tags", "book_id", "tag_id")),
        )
        .unwrap();
    registry
        .declare(
            "Book",
            AssociationDescriptor::one_to_one("cover", "Cover").cascade(Cascade::ALL),
        )
        .unwrap();
    registry
        .declare(
            "Book",
            AssociationDescriptor::many_to_one("publisher", "Publisher").read_only(true),
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
            "Tag",
            AssociationDescriptor::many_to_many("books", "Book").inverted_by("tags"),
        )
        .unwrap();
    registry.shared().unwrap()
}

/// Shelves sharing labels, and people pointing at each other.
pub fn warehouse() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register("Shelf", "shelves").unwrap();
    registry.register("Label", "labels").unwrap();
    registry.register("Person", "people").unwrap();
    registry
        .declare(
            "Shelf",
            AssociationDescriptor::many_to_one("label", "Label").cascade(Cascade::DELETE),
        )
        .unwrap();
    registry
        .declare(
            "Person",
            AssociationDescriptor::one_to_one("partner", "Person").cascade(Cascade::PERSIST),
        )
        .unwrap();
    registry.shared().unwrap()
}

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

/// A store that fails every write to one collection.
#[derive(Clone)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub failing_collection: String,
}

impl FailingStore {
    pub fn new(inner: MemoryStore, failing_collection: &str) -> Self {
        Self {
            inner,
            failing_collection: failing_collection.to_string(),
        }
    }

    fn check(&self, collection: &str) -> Result<()> {
        if collection == self.failing_collection {
            return Err(StoreError::new(StoreErrorKind::Connection, "connection reset")
                .in_collection(collection)
                .into());
        }
        Ok(())
    }
}

impl DocumentStore for FailingStore {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Document>> {
        self.inner.find(collection, filter, fields)
    }

    fn insert(&self, collection: &str, record: Document) -> Result<Value> {
        self.check(collection)?;
        self.inner.insert(collection, record)
    }

    fn update(&self, collection: &str, filter: &Filter, update: &Update) -> Result<u64> {
        self.check(collection)?;
        self.inner.update(collection, filter, update)
    }

    fn remove(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.check(collection)?;
        self.inner.remove(collection, filter)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.inner.count(collection, filter)
    }
}
