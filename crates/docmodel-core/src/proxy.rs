//! Lazy association proxies.
//!
//! A [`Proxy`] stands in for the target of an association. It carries the
//! target type and identity and materializes the target on first access
//! through an [`EntityLoader`] (usually the session). Resolution is memoized:
//! clones of a proxy share one cache, and a resolved proxy never re-reads the
//! store on its own.
//!
//! # States
//!
//! - **Unresolved**: target id known, entity not fetched yet
//! - **Resolved**: entity fetched (or supplied in memory) and cached
//!
//! # Example
//!
//! ```ignore
//! let author = book.reference("author")?.expect("book has an author");
//! let name = author.get(&mut session, "name")?;   // loads on first access
//! author.set(&mut session, "name", "Ursula")?;     // forwarded to the entity
//! ```

use crate::association::{AssociationDescriptor, Cascade, JoinCollection};
use crate::entity::Entity;
use crate::value::{Value, id_string};
use crate::{Error, Result};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Identifier of the session that produced a proxy.
pub type SessionId = u64;

/// Minimal session interface needed to resolve proxies.
///
/// Lives in the core crate so proxies do not depend on the concrete session
/// type; `docmodel-session` provides the implementation.
pub trait EntityLoader {
    /// Load one entity by identity, failing with `DocumentNotFound` if absent.
    fn load(&mut self, entity_type: &str, id: &Value) -> Result<Entity>;

    /// Called once per single-proxy resolution (for N+1 detection).
    fn record_resolution(&mut self, _entity_type: &str, _property: &str) {}
}

/// Observable resolution state of a proxy.
#[derive(Debug, Clone)]
pub enum ProxyState {
    Unresolved,
    Resolved(Entity),
}

struct ProxyInner {
    owner: Option<SessionId>,
    property: String,
    target_type: String,
    target_id: Option<Value>,
    read_only: bool,
    reverse: bool,
    cascade: Cascade,
    resolved: OnceLock<Entity>,
}

/// A lazy, possibly read-only handle to an associated entity.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    fn build(
        owner: Option<SessionId>,
        id: Option<Value>,
        desc: &AssociationDescriptor,
        reverse: bool,
    ) -> ProxyInner {
        ProxyInner {
            owner,
            property: desc.property().to_string(),
            target_type: desc.target_type().to_string(),
            target_id: id,
            read_only: desc.is_read_only() || reverse,
            reverse,
            cascade: desc.cascading(),
            resolved: OnceLock::new(),
        }
    }

    /// Proxy for a stored foreign reference (owning side).
    pub fn make(owner: SessionId, id: Value, desc: &AssociationDescriptor) -> Self {
        Self {
            inner: Arc::new(Self::build(Some(owner), Some(id), desc, false)),
        }
    }

    /// Proxy for a reverse-computed reference (inverted side). Always read-only.
    pub fn reverse(owner: SessionId, id: Value, desc: &AssociationDescriptor) -> Self {
        Self {
            inner: Arc::new(Self::build(Some(owner), Some(id), desc, true)),
        }
    }

    /// Proxy already resolved to an in-memory entity.
    pub fn for_entity(entity: &Entity, desc: &AssociationDescriptor) -> Self {
        let inner = Self::build(None, None, desc, false);
        let _ = inner.resolved.set(entity.clone());
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn owner(&self) -> Option<SessionId> {
        self.inner.owner
    }

    /// Association property this proxy was built for.
    pub fn property(&self) -> &str {
        &self.inner.property
    }

    pub fn target_type(&self) -> &str {
        &self.inner.target_type
    }

    /// Identity of the target: the cached entity's id once resolved.
    pub fn target_id(&self) -> Option<Value> {
        match self.inner.resolved.get() {
            Some(entity) => entity.id(),
            None => self.inner.target_id.clone(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn is_reverse(&self) -> bool {
        self.inner.reverse
    }

    pub fn cascading(&self) -> Cascade {
        self.inner.cascade
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.get().is_some()
    }

    pub fn state(&self) -> ProxyState {
        match self.inner.resolved.get() {
            Some(entity) => ProxyState::Resolved(entity.clone()),
            None => ProxyState::Unresolved,
        }
    }

    /// The materialized entity, if any. Diagnostics only; does not load.
    pub fn actual(&self) -> Option<Entity> {
        self.inner.resolved.get().cloned()
    }

    /// Does this proxy stand for `entity` (same handle, or same persisted id)?
    pub fn refers_to(&self, entity: &Entity) -> bool {
        if let Some(resolved) = self.inner.resolved.get() {
            return resolved.is_same(entity);
        }
        match (&self.inner.target_id, entity.id()) {
            (Some(id), Some(other)) => {
                *id == other && self.inner.target_type == entity.entity_type()
            }
            _ => false,
        }
    }

    /// Cache an entity loaded elsewhere (batch loading). No-op if already resolved.
    pub fn prime(&self, entity: Entity) {
        let _ = self.inner.resolved.set(entity);
    }

    /// Materialize the target, loading it on first call.
    pub fn resolve<L: EntityLoader + ?Sized>(&self, loader: &mut L) -> Result<Entity> {
        if let Some(entity) = self.inner.resolved.get() {
            return Ok(entity.clone());
        }
        let Some(id) = self.inner.target_id.as_ref() else {
            return Err(Error::IntegrityConstraint(format!(
                "proxy for {} has neither an identity nor an entity",
                self.inner.target_type
            )));
        };
        tracing::trace!(
            target_type = %self.inner.target_type,
            id = %id_string(id),
            "Resolving proxy"
        );
        loader.record_resolution(&self.inner.target_type, &self.inner.property);
        let entity = loader.load(&self.inner.target_type, id)?;
        let _ = self.inner.resolved.set(entity.clone());
        Ok(self.inner.resolved.get().cloned().unwrap_or(entity))
    }

    /// Read an attribute of the target (resolving it first).
    pub fn get<L: EntityLoader + ?Sized>(&self, loader: &mut L, name: &str) -> Result<Option<Value>> {
        Ok(self.resolve(loader)?.get(name))
    }

    /// Write an attribute of the target.
    ///
    /// Read-only and reverse proxies reject the write before any resolution.
    pub fn set<L: EntityLoader + ?Sized>(
        &self,
        loader: &mut L,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        if self.inner.read_only {
            return Err(Error::ReadOnlyProxy {
                entity_type: self.inner.target_type.clone(),
                attribute: name.to_string(),
            });
        }
        self.resolve(loader)?.set(name, value)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_resolved() {
            "resolved"
        } else {
            "unresolved"
        };
        f.debug_struct("Proxy")
            .field("state", &state)
            .field("target_type", &self.inner.target_type)
            .field("target_id", &self.target_id())
            .field("read_only", &self.inner.read_only)
            .field("reverse", &self.inner.reverse)
            .field("owner", &self.inner.owner)
            .finish()
    }
}

/// Membership of a many-to-many association.
///
/// `link()` and `unlink()` record changes that the unit of work writes to the
/// join collection on flush.
#[derive(Debug, Clone)]
pub struct AssociationCollection {
    join: Option<JoinCollection>,
    read_only: bool,
    members: Vec<Proxy>,
    pending_links: Vec<Proxy>,
    pending_unlinks: Vec<Proxy>,
}

impl AssociationCollection {
    pub fn new(join: Option<JoinCollection>, read_only: bool) -> Self {
        Self {
            join,
            read_only,
            members: Vec::new(),
            pending_links: Vec::new(),
            pending_unlinks: Vec::new(),
        }
    }

    /// A collection loaded from the join collection.
    pub fn loaded(join: Option<JoinCollection>, read_only: bool, members: Vec<Proxy>) -> Self {
        Self {
            members,
            ..Self::new(join, read_only)
        }
    }

    pub fn join(&self) -> Option<&JoinCollection> {
        self.join.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn members(&self) -> &[Proxy] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn pending_links(&self) -> &[Proxy] {
        &self.pending_links
    }

    pub fn pending_unlinks(&self) -> &[Proxy] {
        &self.pending_unlinks
    }

    pub fn has_pending_ops(&self) -> bool {
        !self.pending_links.is_empty() || !self.pending_unlinks.is_empty()
    }

    fn reject_write(&self, proxy: &Proxy) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyProxy {
                entity_type: proxy.target_type().to_string(),
                attribute: proxy.property().to_string(),
            });
        }
        Ok(())
    }

    fn same_target(a: &Proxy, b: &Proxy) -> bool {
        match (a.actual(), b.actual()) {
            (Some(x), Some(y)) if x.is_same(&y) => true,
            _ => match (a.target_id(), b.target_id()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    /// Add a member. Duplicate links are ignored.
    pub fn link(&mut self, proxy: Proxy) -> Result<()> {
        self.reject_write(&proxy)?;
        if let Some(pos) = self
            .pending_unlinks
            .iter()
            .position(|p| Self::same_target(p, &proxy))
        {
            self.pending_unlinks.remove(pos);
        } else if !self.members.iter().any(|p| Self::same_target(p, &proxy)) {
            self.pending_links.push(proxy.clone());
        }
        if !self.members.iter().any(|p| Self::same_target(p, &proxy)) {
            self.members.push(proxy);
        }
        Ok(())
    }

    /// Remove a member. Returns whether it was a member.
    pub fn unlink(&mut self, proxy: &Proxy) -> Result<bool> {
        self.reject_write(proxy)?;
        let Some(pos) = self
            .members
            .iter()
            .position(|p| Self::same_target(p, proxy))
        else {
            return Ok(false);
        };
        let removed = self.members.remove(pos);
        if let Some(pending) = self
            .pending_links
            .iter()
            .position(|p| Self::same_target(p, &removed))
        {
            self.pending_links.remove(pending);
        } else {
            self.pending_unlinks.push(removed);
        }
        Ok(true)
    }

    /// Drop pending operations whose target has an identity, i.e. the ones a
    /// flush has written. Operations on unsaved targets stay pending.
    ///
    /// Returns the number of operations still pending.
    pub fn settle_pending(&mut self) -> usize {
        self.pending_links.retain(|p| p.target_id().is_none());
        self.pending_unlinks.retain(|p| p.target_id().is_none());
        self.pending_links.len() + self.pending_unlinks.len()
    }
}
