//! Entity handles.
//!
//! An [`Entity`] is a shared handle (`Arc<RwLock<..>>` underneath) to one
//! in-memory record of a registered type: its identity, its plain attributes
//! and its association slots. Cloning the handle never copies the record;
//! every clone observes the same state.
//!
//! Each handle carries an opaque [`EntityToken`] minted at construction. The
//! unit of work keys its records by that token, so two handles that happen to
//! carry the same persisted id are still tracked separately.

use crate::association::{AssociationDescriptor, Cardinality};
use crate::proxy::{AssociationCollection, Proxy};
use crate::registry::TypeMetadata;
use crate::value::{Document, ID_KEY, Value, id_string};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identity token of an in-memory entity handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityToken(u64);

impl EntityToken {
    fn next() -> Self {
        EntityToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The value held by one association slot.
#[derive(Debug, Clone)]
pub enum AssociationValue {
    /// One-to-one / many-to-one: at most one target.
    One(Option<Proxy>),
    /// Owning one-to-many id list, or any reverse-computed list.
    Many(Vec<Proxy>),
    /// Many-to-many membership backed by a join collection.
    Collection(AssociationCollection),
}

impl AssociationValue {
    /// The empty value for a descriptor.
    pub fn empty_for(desc: &AssociationDescriptor) -> Self {
        match desc.cardinality() {
            Cardinality::ManyToMany => AssociationValue::Collection(AssociationCollection::new(
                desc.join_collection().cloned(),
                desc.is_read_only(),
            )),
            c if c.is_single() => AssociationValue::One(None),
            _ => AssociationValue::Many(Vec::new()),
        }
    }

    /// All proxies currently held (members for a collection).
    pub fn proxies(&self) -> Vec<Proxy> {
        match self {
            AssociationValue::One(p) => p.iter().cloned().collect(),
            AssociationValue::Many(list) => list.clone(),
            AssociationValue::Collection(c) => c.members().to_vec(),
        }
    }
}

struct EntityInner {
    token: EntityToken,
    metadata: Arc<TypeMetadata>,
    state: RwLock<EntityState>,
}

#[derive(Default)]
struct EntityState {
    id: Option<Value>,
    attributes: Document,
    associations: BTreeMap<String, AssociationValue>,
}

/// Shared handle to an in-memory entity.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    /// Create a new entity without identity (the store assigns one on insert).
    pub fn new(metadata: Arc<TypeMetadata>) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                token: EntityToken::next(),
                metadata,
                state: RwLock::new(EntityState::default()),
            }),
        }
    }

    /// Create a new entity with a client-generated identity.
    pub fn with_id(metadata: Arc<TypeMetadata>, id: impl Into<Value>) -> Self {
        let entity = Self::new(metadata);
        entity.write().id = Some(id.into());
        entity
    }

    /// Create a handle for a record read from the store.
    pub fn materialized(metadata: Arc<TypeMetadata>, id: Value, attributes: Document) -> Self {
        let entity = Self::new(metadata);
        {
            let mut state = entity.write();
            state.id = Some(id);
            state.attributes = attributes;
        }
        entity
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityState> {
        match self.inner.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityState> {
        match self.inner.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn token(&self) -> EntityToken {
        self.inner.token
    }

    pub fn metadata(&self) -> &Arc<TypeMetadata> {
        &self.inner.metadata
    }

    pub fn entity_type(&self) -> &str {
        self.inner.metadata.name()
    }

    pub fn collection(&self) -> &str {
        self.inner.metadata.collection()
    }

    /// Is `other` the very same handle (not merely the same persisted id)?
    pub fn is_same(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn id(&self) -> Option<Value> {
        self.read().id.clone()
    }

    /// Establish the identity. Once set, it never changes.
    pub fn assign_id(&self, id: Value) -> Result<()> {
        let mut state = self.write();
        match &state.id {
            None => {
                state.id = Some(id);
                Ok(())
            }
            Some(current) if *current == id => Ok(()),
            Some(current) => Err(Error::ImmutableIdentity {
                entity_type: self.entity_type().to_string(),
                current: id_string(current),
            }),
        }
    }

    fn check_plain_attribute(&self, name: &str) -> Result<()> {
        if name == ID_KEY || self.inner.metadata.is_association(name) {
            return Err(Error::ReservedAttribute {
                entity_type: self.entity_type().to_string(),
                attribute: name.to_string(),
            });
        }
        Ok(())
    }

    /// Read a plain attribute.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().attributes.get(name).cloned()
    }

    /// Write a plain attribute.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.check_plain_attribute(name)?;
        self.write().attributes.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Remove a plain attribute, returning its previous value.
    pub fn unset(&self, name: &str) -> Result<Option<Value>> {
        self.check_plain_attribute(name)?;
        Ok(self.write().attributes.remove(name))
    }

    /// Snapshot of the plain attributes.
    pub fn attributes(&self) -> Document {
        self.read().attributes.clone()
    }

    /// Overwrite every plain attribute (used when reloading from the store).
    pub fn replace_attributes(&self, attributes: Document) {
        self.write().attributes = attributes;
    }

    fn descriptor(&self, property: &str) -> Result<&AssociationDescriptor> {
        self.inner
            .metadata
            .association(property)
            .ok_or_else(|| Error::unmapped_property(self.entity_type(), property))
    }

    fn writable_descriptor(&self, property: &str) -> Result<&AssociationDescriptor> {
        let desc = self.descriptor(property)?;
        if desc.is_read_only() {
            return Err(Error::ReadOnlyProxy {
                entity_type: self.entity_type().to_string(),
                attribute: property.to_string(),
            });
        }
        Ok(desc)
    }

    /// Current value of an association slot (empty if never wired).
    pub fn association(&self, property: &str) -> Result<AssociationValue> {
        let desc = self.descriptor(property)?;
        Ok(self
            .read()
            .associations
            .get(property)
            .cloned()
            .unwrap_or_else(|| AssociationValue::empty_for(desc)))
    }

    /// Proxies held by an association slot.
    pub fn references(&self, property: &str) -> Result<Vec<Proxy>> {
        Ok(self.association(property)?.proxies())
    }

    /// The single proxy of a to-one association.
    pub fn reference(&self, property: &str) -> Result<Option<Proxy>> {
        match self.association(property)? {
            AssociationValue::One(proxy) => Ok(proxy),
            _ => Err(Error::IntegrityConstraint(format!(
                "{}.{property} is not a to-one association",
                self.entity_type()
            ))),
        }
    }

    /// Install a slot value without access checks (association wiring on load).
    pub fn wire(&self, property: &str, value: AssociationValue) {
        self.write().associations.insert(property.to_string(), value);
    }

    /// Point a to-one association at `target` (or clear it).
    pub fn set_reference(&self, property: &str, target: Option<&Entity>) -> Result<()> {
        let desc = self.writable_descriptor(property)?;
        if !desc.cardinality().is_single() {
            return Err(Error::IntegrityConstraint(format!(
                "{}.{property} is a {} association; use add_reference",
                self.entity_type(),
                desc.cardinality()
            )));
        }
        let proxy = target.map(|t| Proxy::for_entity(t, desc));
        self.wire(property, AssociationValue::One(proxy));
        Ok(())
    }

    /// Add `target` to a one-to-many list or many-to-many collection.
    pub fn add_reference(&self, property: &str, target: &Entity) -> Result<()> {
        let desc = self.writable_descriptor(property)?;
        let proxy = Proxy::for_entity(target, desc);
        let mut state = self.write();
        let slot = state
            .associations
            .entry(property.to_string())
            .or_insert_with(|| AssociationValue::empty_for(desc));
        match slot {
            AssociationValue::Many(list) => {
                if !list.iter().any(|p| p.refers_to(target)) {
                    list.push(proxy);
                }
                Ok(())
            }
            AssociationValue::Collection(collection) => collection.link(proxy),
            AssociationValue::One(_) => Err(Error::IntegrityConstraint(format!(
                "{}.{property} is a to-one association; use set_reference",
                self.entity_type()
            ))),
        }
    }

    /// Remove `target` from a list or collection. Returns whether it was present.
    pub fn remove_reference(&self, property: &str, target: &Entity) -> Result<bool> {
        let desc = self.writable_descriptor(property)?;
        let mut state = self.write();
        let Some(slot) = state.associations.get_mut(property) else {
            return Ok(false);
        };
        match slot {
            AssociationValue::One(current) => {
                if current.as_ref().is_some_and(|p| p.refers_to(target)) {
                    *current = None;
                    return Ok(true);
                }
                Ok(false)
            }
            AssociationValue::Many(list) => {
                let before = list.len();
                list.retain(|p| !p.refers_to(target));
                Ok(list.len() != before)
            }
            AssociationValue::Collection(collection) => {
                collection.unlink(&Proxy::for_entity(target, desc))
            }
        }
    }

    /// Forget the many-to-many link/unlink operations a flush has written.
    /// Operations on targets without an identity stay pending.
    ///
    /// Returns the number of operations still pending.
    pub fn settle_pending_links(&self) -> usize {
        let mut remaining = 0;
        for slot in self.write().associations.values_mut() {
            if let AssociationValue::Collection(collection) = slot {
                remaining += collection.settle_pending();
            }
        }
        remaining
    }

    /// Build the record stored for this entity (without the identity key):
    /// plain attributes plus the foreign references of stored associations.
    ///
    /// Returns the record and whether some referenced entity has no identity
    /// yet (its reference is written as `null` / left out of the id list).
    pub fn to_record(&self) -> (Document, bool) {
        let state = self.read();
        let mut record = state.attributes.clone();
        let mut missing = false;
        for desc in self.inner.metadata.associations() {
            if !desc.is_stored() {
                continue;
            }
            let value = match state.associations.get(desc.property()) {
                Some(AssociationValue::One(Some(proxy))) => proxy.target_id().unwrap_or_else(|| {
                    missing = true;
                    Value::Null
                }),
                Some(AssociationValue::Many(list)) => Value::Array(
                    list.iter()
                        .filter_map(|p| {
                            let id = p.target_id();
                            missing |= id.is_none();
                            id
                        })
                        .collect(),
                ),
                Some(AssociationValue::One(None) | AssociationValue::Collection(_)) | None => {
                    if desc.cardinality().is_single() {
                        Value::Null
                    } else {
                        Value::Array(Vec::new())
                    }
                }
            };
            record.insert(desc.property().to_string(), value);
        }
        (record, missing)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Entity")
            .field("type", &self.entity_type())
            .field("token", &self.inner.token)
            .field("id", &state.id)
            .field("attributes", &state.attributes)
            .field("associations", &state.associations.keys().collect::<Vec<_>>())
            .finish()
    }
}
