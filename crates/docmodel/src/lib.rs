//! DocModel - a document-store object mapper with sessions and lazy proxies.
//!
//! DocModel maps entity handles onto schemaless document collections:
//!
//! - A frozen `Registry` of entity types and association descriptors
//! - A `Session` with identity map, change tracking and cascading unit of work
//! - Lazy `Proxy` references resolved on first use
//! - A small statement compiler (`"year >= :since"`) translated to store filters
//! - `MemoryStore`, an in-memory driver for tests and prototyping
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::prelude::*;
//!
//! let registry = Registry::from_json(r#"{"types": [
//!     {"name": "Author", "collection": "authors"},
//!     {"name": "Book", "collection": "books", "associations": [
//!         {"property": "author", "target": "Author", "cardinality": "MANY_TO_ONE",
//!          "cascade": "persist"}
//!     ]}
//! ]}"#)?
//! .shared()?;
//!
//! let mut session = Session::new(MemoryStore::new(), registry);
//!
//! let author = session.collection("Author")?.create();
//! author.set("name", "Ursula K. Le Guin")?;
//! let book = session.collection("Book")?.create();
//! book.set("title", "The Dispossessed")?;
//! book.set("year", 1974)?;
//! book.set_reference("author", Some(&author))?;
//!
//! session.persist(&[book])?;
//! let report = session.flush()?; // inserts the author first, then the book
//!
//! let mut params = Document::new();
//! params.insert("since".into(), 1970.into());
//! let recent = session.collection("Book")?.query("year >= :since", &params)?;
//! ```
//!
//! # Features
//!
//! - **Explicit flushing**: nothing is written until `Session::flush`
//! - **Orphan-aware cascades**: shared dependents survive a cascading delete
//! - **No transactions**: a failed flush reports the operations already applied

pub use docmodel_core::store::{by_id, by_ids, field_eq, field_in, match_all};
pub use docmodel_core::{
    AssociationCollection, AssociationDescriptor, AssociationValue, Cardinality, Cascade,
    CommitError, Document, DocumentStore, Entity, EntityLoader, EntityToken, Error, Filter,
    ID_KEY, JoinCollection, MappingError, MappingErrorKind, Proxy, ProxyState, RecordError,
    Registry, Result, SessionId, StoreError, StoreErrorKind, TypeMetadata, Update, Value,
    id_string,
};

pub use docmodel_query::{IndexHint, Operator, Predicate, Query, build, compile, translate};

pub use docmodel_session::{
    ChangeSet, Collection, CommitReport, N1Stats, PendingCounts, RecordStatus, Session,
    SessionConfig, SessionManager, UnitOfWork,
};

pub use docmodel_memory::{MemoryConfig, MemoryStore, OperationKind};

/// Convenient imports for applications.
pub mod prelude {
    pub use crate::{
        // Associations
        AssociationDescriptor,
        Cardinality,
        Cascade,
        // Session
        CommitReport,
        // Core types
        Document,
        DocumentStore,
        Entity,
        EntityLoader,
        Error,
        Filter,
        JoinCollection,
        // Drivers
        MemoryStore,
        Proxy,
        RecordStatus,
        Registry,
        Result,
        Session,
        SessionConfig,
        SessionManager,
        Value,
        // Filters
        by_id,
        field_eq,
        match_all,
    };
}
