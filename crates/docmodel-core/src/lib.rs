//! Core types and traits for DocModel.
//!
//! This crate provides the foundational abstractions of the document mapper:
//!
//! - `Entity` handles with opaque tracking tokens
//! - `AssociationDescriptor` and the frozen metadata `Registry`
//! - `Proxy` lazy references and many-to-many `AssociationCollection`s
//! - `DocumentStore` trait for store drivers

pub mod association;
pub mod entity;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod value;

pub use association::{AssociationDescriptor, Cardinality, Cascade, JoinCollection};
pub use entity::{AssociationValue, Entity, EntityToken};
pub use error::{
    CommitError, Error, MappingError, MappingErrorKind, RecordError, Result, StoreError,
    StoreErrorKind,
};
pub use proxy::{AssociationCollection, EntityLoader, Proxy, ProxyState, SessionId};
pub use registry::{Registry, TypeMetadata};
pub use store::{DocumentStore, Filter, Update};
pub use value::{Document, ID_KEY, Value, id_string};
