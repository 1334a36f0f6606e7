//! Association metadata for DocModel.
//!
//! Associations are declared once per entity type and stored in the
//! [`Registry`](crate::Registry). Higher layers (session, unit of work, proxy
//! wiring) read them to decide how a foreign reference is stored, how it is
//! loaded back, and which operations cascade through it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

/// The cardinality of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    /// One-to-one: `User` has one `Profile`.
    OneToOne,
    /// One-to-many: one `Author` has many `Book`s.
    OneToMany,
    /// Many-to-one: many `Book`s belong to one `Author`.
    ManyToOne,
    /// Many-to-many: `Book`s have many `Tag`s via a join collection.
    ManyToMany,
}

impl Cardinality {
    /// Does the association hold at most one target?
    pub const fn is_single(self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Cardinality::OneToOne => "ONE_TO_ONE",
            Cardinality::OneToMany => "ONE_TO_MANY",
            Cardinality::ManyToOne => "MANY_TO_ONE",
            Cardinality::ManyToMany => "MANY_TO_MANY",
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cardinality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "onetoone" => Ok(Cardinality::OneToOne),
            "onetomany" => Ok(Cardinality::OneToMany),
            "manytoone" => Ok(Cardinality::ManyToOne),
            "manytomany" => Ok(Cardinality::ManyToMany),
            _ => Err(Error::IntegrityConstraint(format!(
                "unknown association cardinality '{s}'"
            ))),
        }
    }
}

/// Operations propagated from an owner to its associated entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    pub const PERSIST: Cascade = Cascade(1);
    pub const DELETE: Cascade = Cascade(1 << 1);
    pub const REFRESH: Cascade = Cascade(1 << 2);
    pub const ALL: Cascade = Cascade(0b111);

    /// Are all operations in `other` included?
    pub const fn contains(self, other: Cascade) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Names of the included operations, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Cascade::PERSIST) {
            names.push("persist");
        }
        if self.contains(Cascade::DELETE) {
            names.push("delete");
        }
        if self.contains(Cascade::REFRESH) {
            names.push("refresh");
        }
        names
    }
}

impl BitOr for Cascade {
    type Output = Cascade;

    fn bitor(self, rhs: Cascade) -> Cascade {
        Cascade(self.0 | rhs.0)
    }
}

impl FromStr for Cascade {
    type Err = Error;

    /// Parse a comma separated list such as `"persist, delete"` or `"all"`.
    fn from_str(s: &str) -> Result<Self> {
        let mut cascade = Cascade::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            cascade = cascade
                | match part.to_ascii_lowercase().as_str() {
                    "persist" => Cascade::PERSIST,
                    "delete" => Cascade::DELETE,
                    "refresh" => Cascade::REFRESH,
                    "all" => Cascade::ALL,
                    other => {
                        return Err(Error::IntegrityConstraint(format!(
                            "unknown cascading operation '{other}'"
                        )));
                    }
                };
        }
        Ok(cascade)
    }
}

impl Serialize for Cascade {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

/// The join collection backing a many-to-many association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCollection {
    /// Join collection name (e.g. `"book_tags"`).
    pub name: String,
    /// Field pointing at the owning entity (e.g. `"book_id"`).
    pub local_key: String,
    /// Field pointing at the target entity (e.g. `"tag_id"`).
    pub remote_key: String,
}

impl JoinCollection {
    pub fn new(
        name: impl Into<String>,
        local_key: impl Into<String>,
        remote_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            local_key: local_key.into(),
            remote_key: remote_key.into(),
        }
    }

    /// The same join collection seen from the other end.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            name: self.name.clone(),
            local_key: self.remote_key.clone(),
            remote_key: self.local_key.clone(),
        }
    }
}

/// Metadata about one association property of an entity type.
///
/// Built with the chained setters below, then handed to the registry which
/// owns it immutably from then on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociationDescriptor {
    property: String,
    target_type: String,
    cardinality: Cardinality,
    owning_side: bool,
    inverted_by: Option<String>,
    cascade: Cascade,
    read_only: bool,
    join: Option<JoinCollection>,
}

impl AssociationDescriptor {
    /// Create an owning, writable association without cascading.
    pub fn new(
        property: impl Into<String>,
        target_type: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            property: property.into(),
            target_type: target_type.into(),
            cardinality,
            owning_side: true,
            inverted_by: None,
            cascade: Cascade::NONE,
            read_only: false,
            join: None,
        }
    }

    pub fn one_to_one(property: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self::new(property, target_type, Cardinality::OneToOne)
    }

    pub fn one_to_many(property: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self::new(property, target_type, Cardinality::OneToMany)
    }

    pub fn many_to_one(property: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self::new(property, target_type, Cardinality::ManyToOne)
    }

    pub fn many_to_many(property: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self::new(property, target_type, Cardinality::ManyToMany)
    }

    /// Make this the inverted side of `property` on the target type.
    ///
    /// The inverted side never stores anything and is always read-only.
    #[must_use]
    pub fn inverted_by(mut self, property: impl Into<String>) -> Self {
        self.inverted_by = Some(property.into());
        self.owning_side = false;
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn read_only(mut self, value: bool) -> Self {
        // The inverted side stays read-only whatever the caller asks for.
        self.read_only = value || !self.owning_side;
        self
    }

    /// Set the join collection (many-to-many owning side).
    #[must_use]
    pub fn join(mut self, join: JoinCollection) -> Self {
        self.join = Some(join);
        self
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn is_owning_side(&self) -> bool {
        self.owning_side
    }

    pub fn inverse_property(&self) -> Option<&str> {
        self.inverted_by.as_deref()
    }

    pub fn cascading(&self) -> Cascade {
        self.cascade
    }

    pub fn cascades(&self, op: Cascade) -> bool {
        self.cascade.contains(op)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn join_collection(&self) -> Option<&JoinCollection> {
        self.join.as_ref()
    }

    /// Does the owning record carry this association as a field?
    pub fn is_stored(&self) -> bool {
        self.owning_side && self.cardinality != Cardinality::ManyToMany
    }

    /// Check the descriptor is internally consistent.
    pub fn validate(&self, entity_type: &str) -> Result<()> {
        if self.property.is_empty() || self.target_type.is_empty() {
            return Err(Error::IntegrityConstraint(format!(
                "association on {entity_type} needs a property name and a target type"
            )));
        }
        if self.owning_side
            && self.cardinality == Cardinality::ManyToMany
            && self.join.is_none()
        {
            return Err(Error::IntegrityConstraint(format!(
                "{entity_type}.{} is an owning many-to-many association without a join collection",
                self.property
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardinality_parsing() {
        assert_eq!(
            "ONE_TO_MANY".parse::<Cardinality>().unwrap(),
            Cardinality::OneToMany
        );
        assert_eq!(
            "manyToOne".parse::<Cardinality>().unwrap(),
            Cardinality::ManyToOne
        );
        let err = "ONE_TO_FEW".parse::<Cardinality>().unwrap_err();
        assert!(matches!(err, Error::IntegrityConstraint(_)));
    }

    #[test]
    fn test_cascade_set_operations() {
        let cascade = Cascade::PERSIST | Cascade::DELETE;
        assert!(cascade.contains(Cascade::PERSIST));
        assert!(cascade.contains(Cascade::DELETE));
        assert!(!cascade.contains(Cascade::REFRESH));
        assert!(!Cascade::NONE.contains(Cascade::NONE));
        assert_eq!(cascade.names(), vec!["persist", "delete"]);
        assert_eq!("all".parse::<Cascade>().unwrap(), Cascade::ALL);
        assert_eq!(
            "persist, refresh".parse::<Cascade>().unwrap(),
            Cascade::PERSIST | Cascade::REFRESH
        );
        assert!("explode".parse::<Cascade>().is_err());
    }

    #[test]
    fn test_descriptor_builder_chain() {
        let desc = AssociationDescriptor::many_to_one("author", "Author")
            .cascade(Cascade::PERSIST)
            .read_only(false);

        assert_eq!(desc.property(), "author");
        assert_eq!(desc.target_type(), "Author");
        assert!(desc.is_owning_side());
        assert!(desc.is_stored());
        assert!(desc.cascades(Cascade::PERSIST));
        assert!(!desc.is_read_only());
    }

    #[test]
    fn test_inverted_side_is_read_only() {
        let desc = AssociationDescriptor::one_to_many("books", "Book")
            .inverted_by("author")
            .read_only(false);

        assert!(!desc.is_owning_side());
        assert!(desc.is_read_only());
        assert!(!desc.is_stored());
        assert_eq!(desc.inverse_property(), Some("author"));
    }

    #[test]
    fn test_many_to_many_requires_join() {
        let desc = AssociationDescriptor::many_to_many("tags", "Tag");
        assert!(desc.validate("Book").is_err());

        let desc = desc.join(JoinCollection::new("book_tags", "book_id", "tag_id"));
        assert!(desc.validate("Book").is_ok());
        assert!(!desc.is_stored());

        let swapped = desc.join_collection().unwrap().swapped();
        assert_eq!(swapped.local_key, "tag_id");
        assert_eq!(swapped.remote_key, "book_id");
    }
}
