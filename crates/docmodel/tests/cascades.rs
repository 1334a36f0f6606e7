mod common;

use common::{doc, library, warehouse};
use docmodel::prelude::*;
use docmodel::OperationKind;
use serde_json::json;

/// Two shelves sharing one label, all persisted.
fn shared_label(session: &mut Session<MemoryStore>) -> (Entity, Entity, Entity) {
    let label = session.collection("Label").unwrap().create();
    label.set("text", "fragile").unwrap();
    let a = session.collection("Shelf").unwrap().create();
    a.set("row", 1).unwrap();
    a.set_reference("label", Some(&label)).unwrap();
    let b = session.collection("Shelf").unwrap().create();
    b.set("row", 2).unwrap();
    b.set_reference("label", Some(&label)).unwrap();

    session
        .persist(&[a.clone(), b.clone(), label.clone()])
        .unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.inserted, 3);
    (a, b, label)
}

#[test]
fn referenced_entity_is_inserted_before_its_referrer() {
    let store = MemoryStore::new();
    let mut session = Session::new(store.clone(), warehouse());
    let (a, _, label) = shared_label(&mut session);

    let writes = store.writes();
    assert_eq!(writes[0], (OperationKind::Insert, "labels".to_string()));
    let shelves = store.documents("shelves");
    assert!(shelves.iter().all(|s| s.get("label") == label.id().as_ref()));
    assert!(a.id().is_some());
}

#[test]
fn cascade_delete_keeps_shared_target() {
    let store = MemoryStore::new();
    let mut session = Session::new(store.clone(), warehouse());
    let (a, b, label) = shared_label(&mut session);

    session.delete(&[a]).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(store.documents("labels").len(), 1);
    assert_eq!(session.record_status(&label), Some(RecordStatus::Clean));

    store.clear_log();
    session.delete(&[b]).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.removed, 2);
    assert!(store.documents("labels").is_empty());
    assert!(store.documents("shelves").is_empty());
    assert_eq!(
        store.writes(),
        vec![
            (OperationKind::Remove, "shelves".to_string()),
            (OperationKind::Remove, "labels".to_string()),
        ]
    );
    assert_eq!(session.record_status(&label), None);
}

#[test]
fn deleting_every_referrer_at_once_removes_target() {
    let store = MemoryStore::new();
    let mut session = Session::new(store.clone(), warehouse());
    let (a, b, _) = shared_label(&mut session);

    session.delete(&[a, b]).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.removed, 3);
    assert!(store.documents("labels").is_empty());
}

#[test]
fn untracked_referrer_in_store_protects_target() {
    let store = MemoryStore::new();
    store
        .seed("labels", vec![doc(json!({"_id": "l1", "text": "fragile"}))])
        .unwrap();
    store
        .seed(
            "shelves",
            vec![
                doc(json!({"_id": "s1", "label": "l1"})),
                doc(json!({"_id": "s2", "label": "l1"})),
            ],
        )
        .unwrap();

    let mut session = Session::new(store.clone(), warehouse());
    let shelf = session.collection("Shelf").unwrap().get("s1").unwrap();
    session.delete(&[shelf]).unwrap();
    session.flush().unwrap();
    assert_eq!(store.documents("labels").len(), 1);

    let other = session.collection("Shelf").unwrap().get("s2").unwrap();
    session.delete(&[other]).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.removed, 2);
    assert!(store.documents("labels").is_empty());
}

#[test]
fn cleared_reference_does_not_protect_target() {
    let store = MemoryStore::new();
    let mut session = Session::new(store.clone(), warehouse());
    let (a, b, _) = shared_label(&mut session);

    b.set_reference("label", None).unwrap();
    session.delete(&[a]).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(report.updated, 1);
    assert!(store.documents("labels").is_empty());
    assert_eq!(
        store.documents("shelves")[0].get("label"),
        Some(&Value::Null)
    );
}

#[test]
fn cascade_persist_registers_reachable_entities() {
    let store = MemoryStore::new();
    store
        .seed("authors", vec![doc(json!({"_id": "a1", "name": "Le Guin"}))])
        .unwrap();
    store
        .seed("books", vec![doc(json!({"_id": "b1", "title": "Tehanu", "author": "a1"}))])
        .unwrap();
    let mut session = Session::new(store.clone(), library());

    let book = session.collection("Book").unwrap().get("b1").unwrap();
    let author = book
        .reference("author")
        .unwrap()
        .unwrap()
        .resolve(&mut session)
        .unwrap();
    author.set("name", "Ursula K. Le Guin").unwrap();

    let cover = session.collection("Cover").unwrap().create();
    cover.set("color", "blue").unwrap();
    book.set_reference("cover", Some(&cover)).unwrap();
    session.persist(&[book.clone()]).unwrap();

    let report = session
        .flush()
        .unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.updated, 2);
    assert_eq!(
        store.documents("authors")[0].get("name"),
        Some(&json!("Ursula K. Le Guin"))
    );
    assert_eq!(store.documents("books")[0].get("cover"), cover.id().as_ref());
}

#[test]
fn reference_cycle_converges_with_deferred_update() {
    let store = MemoryStore::new();
    let mut session = Session::new(store.clone(), warehouse());

    let x = session.collection("Person").unwrap().create();
    x.set("name", "Shevek").unwrap();
    let y = session.collection("Person").unwrap().create();
    y.set("name", "Takver").unwrap();
    x.set_reference("partner", Some(&y)).unwrap();
    y.set_reference("partner", Some(&x)).unwrap();

    session.persist(&[x.clone()]).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.updated, 1);

    let people = store.documents("people");
    let partner_of = |id: &Value| {
        people
            .iter()
            .find(|p| p.get("_id") == Some(id))
            .and_then(|p| p.get("partner").cloned())
    };
    assert_eq!(partner_of(&x.id().unwrap()), y.id());
    assert_eq!(partner_of(&y.id().unwrap()), x.id());

    assert_eq!(session.record_status(&x), Some(RecordStatus::Clean));
    assert!(session.flush().unwrap().is_empty());
}

#[test]
fn deleting_owner_removes_orphaned_one_to_one_target() {
    let store = MemoryStore::new();
    let mut session = Session::new(store.clone(), library());

    let book = session.collection("Book").unwrap().create();
    let cover = session.collection("Cover").unwrap().create();
    book.set_reference("cover", Some(&cover)).unwrap();
    session.persist(&[book.clone()]).unwrap();
    assert_eq!(session.flush().unwrap().inserted, 2);

    session.delete(&[book]).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.removed, 2);
    assert!(store.documents("covers").is_empty());
}
