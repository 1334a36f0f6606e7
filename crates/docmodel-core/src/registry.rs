//! Association metadata registry.
//!
//! The registry is populated once at start-up (type registration plus
//! association declarations), then frozen and shared behind an `Arc`. It
//! holds no request-scoped state, so concurrent readers need no locking.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register("Author", "authors")?;
//! registry.register("Book", "books")?;
//! registry.declare(
//!     "Book",
//!     AssociationDescriptor::many_to_one("author", "Author").cascade(Cascade::PERSIST),
//! )?;
//! registry.declare(
//!     "Author",
//!     AssociationDescriptor::one_to_many("books", "Book").inverted_by("author"),
//! )?;
//! let registry = registry.shared()?;
//! ```

use crate::association::{AssociationDescriptor, Cardinality, Cascade, JoinCollection};
use crate::entity::Entity;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything the registry knows about one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMetadata {
    name: String,
    collection: String,
    associations: Vec<AssociationDescriptor>,
}

impl TypeMetadata {
    pub fn new(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            associations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Association descriptors in declaration order.
    pub fn associations(&self) -> &[AssociationDescriptor] {
        &self.associations
    }

    pub fn association(&self, property: &str) -> Option<&AssociationDescriptor> {
        self.associations.iter().find(|a| a.property() == property)
    }

    pub fn is_association(&self, name: &str) -> bool {
        self.association(name).is_some()
    }
}

/// Process-wide map of entity type -> metadata.
#[derive(Debug, Default)]
pub struct Registry {
    types: HashMap<String, Arc<TypeMetadata>>,
    /// Registration order, for deterministic iteration.
    order: Vec<String>,
    frozen: bool,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type and its backing collection.
    ///
    /// Re-registering a type would re-assign its metadata and fails with a
    /// read-only metadata error.
    pub fn register(&mut self, name: &str, collection: &str) -> Result<()> {
        self.ensure_writable(name)?;
        if self.types.contains_key(name) {
            return Err(Error::read_only_metadata(
                name,
                format!("entity type {name} is already registered"),
            ));
        }
        tracing::trace!(entity_type = name, collection, "Registering entity type");
        self.types
            .insert(name.to_string(), Arc::new(TypeMetadata::new(name, collection)));
        self.order.push(name.to_string());
        Ok(())
    }

    /// Declare an association on a registered type.
    pub fn declare(&mut self, entity_type: &str, descriptor: AssociationDescriptor) -> Result<()> {
        self.ensure_writable(entity_type)?;
        descriptor.validate(entity_type)?;
        let meta = self
            .types
            .get_mut(entity_type)
            .ok_or_else(|| Error::unmapped_type(entity_type))?;
        if meta.is_association(descriptor.property()) {
            return Err(Error::duplicated_mapping(entity_type, descriptor.property()));
        }
        tracing::trace!(
            entity_type,
            property = descriptor.property(),
            target = descriptor.target_type(),
            cardinality = %descriptor.cardinality(),
            "Declaring association"
        );
        Arc::make_mut(meta).associations.push(descriptor);
        Ok(())
    }

    fn ensure_writable(&self, entity_type: &str) -> Result<()> {
        if self.frozen {
            return Err(Error::read_only_metadata(
                entity_type,
                "registry is frozen; metadata cannot change after warm-up",
            ));
        }
        Ok(())
    }

    /// Check cross-type consistency and forbid further writes.
    pub fn freeze(&mut self) -> Result<()> {
        self.validate()?;
        self.frozen = true;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freeze and share.
    pub fn shared(mut self) -> Result<Arc<Registry>> {
        self.freeze()?;
        Ok(Arc::new(self))
    }

    /// Every association must point at a registered type, and every inverted
    /// side must name an owning association on its target.
    pub fn validate(&self) -> Result<()> {
        for meta in self.types() {
            for desc in meta.associations() {
                if !self.types.contains_key(desc.target_type()) {
                    return Err(Error::IntegrityConstraint(format!(
                        "{}.{} targets unregistered type {}",
                        meta.name(),
                        desc.property(),
                        desc.target_type()
                    )));
                }
                if !desc.is_owning_side() {
                    self.inverse_of(meta.name(), desc)?;
                }
            }
        }
        Ok(())
    }

    /// Registered types in registration order.
    pub fn types(&self) -> impl Iterator<Item = &Arc<TypeMetadata>> {
        self.order.iter().filter_map(|name| self.types.get(name))
    }

    pub fn metadata(&self, entity_type: &str) -> Result<&Arc<TypeMetadata>> {
        self.types
            .get(entity_type)
            .ok_or_else(|| Error::unmapped_type(entity_type))
    }

    /// Ordered association descriptors of a type.
    pub fn describe(&self, entity_type: &str) -> Result<&[AssociationDescriptor]> {
        Ok(self.metadata(entity_type)?.associations())
    }

    pub fn association(&self, entity_type: &str, property: &str) -> Result<&AssociationDescriptor> {
        self.metadata(entity_type)?
            .association(property)
            .ok_or_else(|| Error::unmapped_property(entity_type, property))
    }

    /// The owning descriptor an inverted association is computed from.
    pub fn inverse_of(
        &self,
        entity_type: &str,
        desc: &AssociationDescriptor,
    ) -> Result<&AssociationDescriptor> {
        let Some(inverse) = desc.inverse_property() else {
            return Err(Error::IntegrityConstraint(format!(
                "{entity_type}.{} is not an inverted association",
                desc.property()
            )));
        };
        let target = self.metadata(desc.target_type())?;
        let owning = target.association(inverse).ok_or_else(|| {
            Error::IntegrityConstraint(format!(
                "{entity_type}.{} is inverted by {}.{inverse} which is not declared",
                desc.property(),
                desc.target_type()
            ))
        })?;
        if !owning.is_owning_side() {
            return Err(Error::IntegrityConstraint(format!(
                "{entity_type}.{} is inverted by {}.{inverse} which is not an owning side",
                desc.property(),
                desc.target_type()
            )));
        }
        Ok(owning)
    }

    /// Owning associations (on any type) that point at `target_type`.
    pub fn referrers_of(
        &self,
        target_type: &str,
    ) -> Vec<(&Arc<TypeMetadata>, &AssociationDescriptor)> {
        self.types()
            .flat_map(|meta| {
                meta.associations()
                    .iter()
                    .filter(|d| d.is_owning_side() && d.target_type() == target_type)
                    .map(move |d| (meta, d))
            })
            .collect()
    }

    /// Create a fresh, untracked entity of a registered type.
    pub fn create(&self, entity_type: &str) -> Result<Entity> {
        Ok(Entity::new(Arc::clone(self.metadata(entity_type)?)))
    }

    /// Build a registry from a declarative JSON mapping document.
    ///
    /// ```json
    /// {"types": [
    ///   {"name": "Book", "collection": "books", "associations": [
    ///     {"property": "author", "target": "Author", "cardinality": "MANY_TO_ONE",
    ///      "cascade": "persist, refresh"}
    ///   ]}
    /// ]}
    /// ```
    pub fn from_json(json: &str) -> Result<Registry> {
        let doc: MappingDocument = serde_json::from_str(json)?;
        let mut registry = Registry::new();
        for ty in &doc.types {
            registry.register(&ty.name, &ty.collection)?;
        }
        for ty in doc.types {
            for assoc in ty.associations {
                let cardinality: Cardinality = assoc.cardinality.parse()?;
                let mut desc = AssociationDescriptor::new(assoc.property, assoc.target, cardinality);
                if let Some(inverse) = assoc.inverted_by {
                    desc = desc.inverted_by(inverse);
                }
                if let Some(cascade) = assoc.cascade {
                    desc = desc.cascade(cascade.parse::<Cascade>()?);
                }
                if let Some(join) = assoc.join {
                    desc = desc.join(join);
                }
                desc = desc.read_only(assoc.read_only);
                registry.declare(&ty.name, desc)?;
            }
        }
        Ok(registry)
    }
}

#[derive(Deserialize)]
struct MappingDocument {
    types: Vec<MappedType>,
}

#[derive(Deserialize)]
struct MappedType {
    name: String,
    collection: String,
    #[serde(default)]
    associations: Vec<MappedAssociation>,
}

#[derive(Deserialize)]
struct MappedAssociation {
    property: String,
    target: String,
    cardinality: String,
    #[serde(default)]
    inverted_by: Option<String>,
    #[serde(default)]
    cascade: Option<String>,
    #[serde(default)]
    read_only: bool,
    #[serde(default)]
    join: Option<JoinCollection>,
}
