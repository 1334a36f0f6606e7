//! Cascade expansion run at the start of every commit.
//!
//! PERSIST follows resolved targets of NEW/DIRTY entities and registers
//! whatever they reach. DELETE follows the proxies of DELETED entities and
//! schedules a target for removal only once nothing live still refers to it.

use crate::unit_of_work::{CommitContext, RecordStatus, UnitOfWork};
use docmodel_core::store::field_eq;
use docmodel_core::{
    AssociationDescriptor, Cardinality, Cascade, Entity, EntityLoader, EntityToken, Error, ID_KEY,
    Result, Value, id_string,
};
use std::collections::{HashMap, HashSet, VecDeque};

type RecordKey = (String, String);

fn key(entity_type: &str, id: &Value) -> RecordKey {
    (entity_type.to_string(), id_string(id))
}

/// Register everything reachable through PERSIST-cascading associations.
pub(crate) fn expand_persist(uow: &mut UnitOfWork, ctx: &mut dyn CommitContext) -> Result<()> {
    let mut queue: VecDeque<Entity> = uow
        .records()
        .filter(|r| matches!(r.status(), RecordStatus::New | RecordStatus::Dirty))
        .map(|r| r.entity().clone())
        .collect();
    let mut seen: HashSet<EntityToken> = queue.iter().map(Entity::token).collect();
    let mut registered = 0usize;

    while let Some(entity) = queue.pop_front() {
        for desc in entity.metadata().associations() {
            if !desc.cascades(Cascade::PERSIST) {
                continue;
            }
            for proxy in entity.references(desc.property())? {
                // unresolved proxies point at records that were never touched
                let Some(target) = proxy.actual() else {
                    continue;
                };
                if !seen.insert(target.token()) {
                    continue;
                }
                match uow.status(&target) {
                    None => {
                        ctx.registry().metadata(target.entity_type())?;
                        uow.register_new(&target)?;
                        registered += 1;
                    }
                    Some(RecordStatus::Clean) => {
                        if uow.is_modified(&target) {
                            uow.register_dirty(&target)?;
                            registered += 1;
                        }
                    }
                    Some(RecordStatus::New | RecordStatus::Dirty) => {}
                    Some(RecordStatus::Deleted | RecordStatus::Cancelled) => continue,
                }
                queue.push_back(target);
            }
        }
    }
    if registered > 0 {
        tracing::debug!(registered, "Cascaded persist");
    }
    Ok(())
}

/// Does `owner` currently reference `id` through `desc`?
fn holds(owner: &Entity, desc: &AssociationDescriptor, id: &Value) -> bool {
    let wanted = id_string(id);
    owner
        .references(desc.property())
        .unwrap_or_default()
        .iter()
        .any(|p| p.target_id().is_some_and(|v| id_string(&v) == wanted))
}

/// Is the record `(target_type, id)` referenced by nothing that survives
/// this commit?
///
/// Referrers are looked up both in the store and among tracked entities.
/// A tracked owner is judged by its in-memory state, so a reference that
/// was just cleared no longer counts.
fn is_orphan(
    uow: &UnitOfWork,
    ctx: &dyn CommitContext,
    target_type: &str,
    id: &Value,
    deleting: &HashSet<RecordKey>,
) -> Result<bool> {
    let store = ctx.store();
    for (meta, desc) in ctx.registry().referrers_of(target_type) {
        let owners: Vec<Value> = if desc.cardinality() == Cardinality::ManyToMany {
            let Some(join) = desc.join_collection() else {
                continue;
            };
            store
                .find(
                    &join.name,
                    &field_eq(&join.remote_key, id.clone()),
                    Some(&[join.local_key.as_str()][..]),
                )?
                .into_iter()
                .filter_map(|mut doc| doc.remove(&join.local_key))
                .collect()
        } else {
            store
                .find(
                    meta.collection(),
                    &field_eq(desc.property(), id.clone()),
                    Some(&[ID_KEY][..]),
                )?
                .into_iter()
                .filter_map(|mut doc| doc.remove(ID_KEY))
                .collect()
        };
        for owner_id in owners {
            if deleting.contains(&key(meta.name(), &owner_id)) {
                continue;
            }
            match uow.find_tracked(meta.name(), &owner_id) {
                Some(owner) if !holds(&owner, desc, id) => continue,
                _ => return Ok(false),
            }
        }
        let live_referrer = uow.records().any(|record| {
            record.status() != RecordStatus::Deleted
                && record.entity().entity_type() == meta.name()
                && holds(record.entity(), desc, id)
        });
        if live_referrer {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Schedule orphaned DELETE-cascade targets of deleted entities for removal,
/// until no more targets qualify.
///
/// Returns each cascaded entity mapped to the owner it was reached from.
pub(crate) fn expand_deletes(
    uow: &mut UnitOfWork,
    ctx: &mut dyn CommitContext,
) -> Result<HashMap<EntityToken, EntityToken>> {
    let mut cascaded = HashMap::new();
    let mut deleting: HashSet<RecordKey> = uow
        .records()
        .filter(|r| r.status() == RecordStatus::Deleted)
        .filter_map(|r| r.entity().id().map(|id| key(r.entity().entity_type(), &id)))
        .collect();

    loop {
        let owners: Vec<Entity> = uow
            .records()
            .filter(|r| r.status() == RecordStatus::Deleted)
            .map(|r| r.entity().clone())
            .collect();
        let mut changed = false;

        for owner in owners {
            for desc in owner.metadata().associations() {
                if !desc.cascades(Cascade::DELETE) {
                    continue;
                }
                for proxy in owner.references(desc.property())? {
                    let Some(id) = proxy.target_id() else {
                        if let Some(target) = proxy.actual() {
                            if uow.status(&target) == Some(RecordStatus::New) {
                                uow.register_deleted(&target)?;
                                changed = true;
                            }
                        }
                        continue;
                    };
                    let target_key = key(proxy.target_type(), &id);
                    if deleting.contains(&target_key) {
                        continue;
                    }
                    if !is_orphan(uow, &*ctx, proxy.target_type(), &id, &deleting)? {
                        tracing::trace!(
                            target_type = proxy.target_type(),
                            id = %target_key.1,
                            "Cascade delete skipped: target still referenced"
                        );
                        continue;
                    }
                    let target = match proxy
                        .actual()
                        .or_else(|| uow.find_tracked(proxy.target_type(), &id))
                    {
                        Some(target) => target,
                        None => match ctx.load(proxy.target_type(), &id) {
                            Ok(target) => {
                                uow.adopt(ctx);
                                target
                            }
                            Err(Error::DocumentNotFound { .. }) => continue,
                            Err(err) => return Err(err),
                        },
                    };
                    if !uow.is_tracked(&target) {
                        uow.register_clean(&target)?;
                    }
                    deleting.insert(target_key);
                    if uow.status(&target) == Some(RecordStatus::Deleted) {
                        continue;
                    }
                    uow.register_deleted(&target)?;
                    cascaded.insert(target.token(), owner.token());
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    if !cascaded.is_empty() {
        tracing::debug!(cascaded = cascaded.len(), "Cascaded delete");
    }
    Ok(cascaded)
}
