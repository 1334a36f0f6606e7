mod common;

use common::{doc, library};
use docmodel::prelude::*;
use docmodel::{AssociationValue, MemoryConfig, OperationKind};
use serde_json::json;

fn seeded() -> MemoryStore {
    let store = MemoryStore::with_config(MemoryConfig { log_reads: true });
    store
        .seed(
            "authors",
            vec![
                doc(json!({"_id": "a1", "name": "Le Guin"})),
                doc(json!({"_id": "a2", "name": "Herbert"})),
            ],
        )
        .unwrap();
    store
        .seed(
            "books",
            vec![
                doc(json!({"_id": "b1", "title": "Lathe", "author": "a1", "publisher": "p1"})),
                doc(json!({"_id": "b2", "title": "Tehanu", "author": "a1"})),
                doc(json!({"_id": "b3", "title": "Dune", "author": "a2"})),
                doc(json!({"_id": "b4", "title": "Earthsea", "author": "a1"})),
            ],
        )
        .unwrap();
    store
        .seed("publishers", vec![doc(json!({"_id": "p1", "name": "Harper"}))])
        .unwrap();
    store
        .seed(
            "tags",
            vec![
                doc(json!({"_id": "t1", "name": "classic"})),
                doc(json!({"_id": "t2", "name": "fantasy"})),
            ],
        )
        .unwrap();
    store
        .seed(
            "book_tags",
            vec![
                doc(json!({"book_id": "b1", "tag_id": "t1"})),
                doc(json!({"book_id": "b2", "tag_id": "t1"})),
                doc(json!({"book_id": "b2", "tag_id": "t2"})),
            ],
        )
        .unwrap();
    store
}

#[test]
fn owning_reference_is_a_lazy_proxy() {
    let store = seeded();
    let mut session = Session::new(store, library());
    let book = session.collection("Book").unwrap().get("b1").unwrap();

    let proxy = book.reference("author").unwrap().unwrap();
    assert!(!proxy.is_resolved());
    assert!(proxy.actual().is_none());
    assert_eq!(proxy.target_id(), Some(json!("a1")));

    let author = proxy.resolve(&mut session).unwrap();
    assert!(proxy.is_resolved());
    assert!(proxy.actual().unwrap().is_same(&author));

    let again = session.collection("Author").unwrap().get("a1").unwrap();
    assert!(again.is_same(&author));
}

#[test]
fn proxy_writes_reach_the_target() {
    let store = seeded();
    let mut session = Session::new(store.clone(), library());
    let book = session.collection("Book").unwrap().get("b3").unwrap();
    let proxy = book.reference("author").unwrap().unwrap();

    proxy.set(&mut session, "name", "Frank Herbert").unwrap();
    assert_eq!(session.flush().unwrap().updated, 1);
    let authors = store.documents("authors");
    let herbert = authors.iter().find(|a| a.get("_id") == Some(&json!("a2")));
    assert_eq!(herbert.unwrap().get("name"), Some(&json!("Frank Herbert")));
}

#[test]
fn read_only_association_rejects_writes() {
    let store = seeded();
    let mut session = Session::new(store, library());
    let book = session.collection("Book").unwrap().get("b1").unwrap();
    let publisher = book.reference("publisher").unwrap().unwrap();
    assert!(publisher.is_read_only());

    let err = publisher.set(&mut session, "name", "Ace").unwrap_err();
    assert!(matches!(err, Error::ReadOnlyProxy { .. }));
    assert!(!publisher.is_resolved());

    publisher.resolve(&mut session).unwrap();
    let err = publisher.set(&mut session, "name", "Ace").unwrap_err();
    assert!(matches!(err, Error::ReadOnlyProxy { .. }));
    assert_eq!(publisher.get(&mut session, "name").unwrap(), Some(json!("Harper")));

    assert!(matches!(
        book.set_reference("publisher", None),
        Err(Error::ReadOnlyProxy { .. })
    ));
}

#[test]
fn inverted_side_is_computed_from_owning_references() {
    let store = seeded();
    let mut session = Session::new(store, library());
    let author = session.collection("Author").unwrap().get("a1").unwrap();

    let books = author.references("books").unwrap();
    let mut ids: Vec<Value> = books.iter().filter_map(Proxy::target_id).collect();
    ids.sort_by_key(|v| v.to_string());
    assert_eq!(ids, vec![json!("b1"), json!("b2"), json!("b4")]);
    assert!(books.iter().all(|p| p.is_reverse() && p.is_read_only()));

    let err = books[0]
        .set(&mut session, "title", "Changed")
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnlyProxy { .. }));

    let book = session.collection("Book").unwrap().get("b3").unwrap();
    assert!(matches!(
        author.add_reference("books", &book),
        Err(Error::ReadOnlyProxy { .. })
    ));
}

#[test]
fn many_to_many_collections_load_from_join_documents() {
    let store = seeded();
    let mut session = Session::new(store, library());

    let book = session.collection("Book").unwrap().get("b2").unwrap();
    let AssociationValue::Collection(tags) = book.association("tags").unwrap() else {
        panic!("tags should be a collection");
    };
    assert_eq!(tags.len(), 2);
    assert!(!tags.is_read_only());

    let tag = session.collection("Tag").unwrap().get("t1").unwrap();
    let AssociationValue::Collection(books) = tag.association("books").unwrap() else {
        panic!("books should be a collection");
    };
    assert_eq!(books.len(), 2);
    assert!(books.is_read_only());
    assert!(books.members().iter().all(Proxy::is_reverse));
}

#[test]
fn link_and_unlink_write_join_documents() {
    let store = seeded();
    let mut session = Session::new(store.clone(), library());

    let book = session.collection("Book").unwrap().get("b1").unwrap();
    let fantasy = session.collection("Tag").unwrap().get("t2").unwrap();
    let classic = session.collection("Tag").unwrap().get("t1").unwrap();

    let fresh = session.collection("Tag").unwrap().create();
    fresh.set("name", "anarchism").unwrap();
    session.persist(&[fresh.clone()]).unwrap();

    book.add_reference("tags", &fantasy).unwrap();
    book.add_reference("tags", &fresh).unwrap();
    assert!(book.remove_reference("tags", &classic).unwrap());

    let report = session.flush().unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.linked, 2);
    assert_eq!(report.unlinked, 1);
    assert_eq!(report.updated, 0);

    let links: Vec<(Value, Value)> = store
        .documents("book_tags")
        .into_iter()
        .filter(|d| d.get("book_id") == Some(&json!("b1")))
        .map(|d| (d["book_id"].clone(), d["tag_id"].clone()))
        .collect();
    assert_eq!(links.len(), 2);
    assert!(links.iter().any(|(_, t)| *t == json!("t2")));
    assert!(links.iter().any(|(_, t)| Some(t) == fresh.id().as_ref()));

    // pending operations are written once
    assert!(session.flush().unwrap().is_empty());
}

#[test]
fn link_to_unsaved_target_waits_for_its_identity() {
    let store = seeded();
    let mut session = Session::new(store.clone(), library());
    let book = session.collection("Book").unwrap().get("b1").unwrap();

    let fresh = session.collection("Tag").unwrap().create();
    fresh.set("name", "parable").unwrap();
    book.add_reference("tags", &fresh).unwrap();

    assert!(session.flush().unwrap().is_empty());
    let links_of_b1 = || {
        store
            .documents("book_tags")
            .into_iter()
            .filter(|d| d.get("book_id") == Some(&json!("b1")))
            .count()
    };
    assert_eq!(links_of_b1(), 1);

    session.persist(&[fresh.clone()]).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.linked, 1);
    assert_eq!(links_of_b1(), 2);
    assert!(
        store
            .documents("book_tags")
            .iter()
            .any(|d| d.get("tag_id") == fresh.id().as_ref())
    );

    assert!(session.flush().unwrap().is_empty());
}

#[test]
fn deleting_owner_purges_join_documents() {
    let store = seeded();
    let mut session = Session::new(store.clone(), library());
    let book = session.collection("Book").unwrap().get("b2").unwrap();
    session.delete(&[book]).unwrap();

    let report = session.flush().unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.unlinked, 2);
    assert_eq!(store.documents("book_tags").len(), 1);
}

#[test]
fn refresh_discards_changes_and_cascades_on_owning_side() {
    let store = seeded();
    let mut session = Session::new(store, library());
    let book = session.collection("Book").unwrap().get("b1").unwrap();
    let author = book
        .reference("author")
        .unwrap()
        .unwrap()
        .resolve(&mut session)
        .unwrap();

    book.set("title", "Changed").unwrap();
    author.set("name", "Changed").unwrap();
    session.refresh(&book).unwrap();

    assert_eq!(book.get("title"), Some(json!("Lathe")));
    assert_eq!(author.get("name"), Some(json!("Le Guin")));
    assert_eq!(session.record_status(&book), Some(RecordStatus::Clean));
    assert!(session.flush().unwrap().is_empty());
}

#[test]
fn refresh_through_inverted_side_is_a_no_op() {
    let store = seeded();
    let mut session = Session::new(store, library());
    let author = session.collection("Author").unwrap().get("a1").unwrap();
    let book = session.collection("Book").unwrap().get("b2").unwrap();

    book.set("title", "Changed").unwrap();
    author.set("name", "Changed").unwrap();
    session.refresh(&author).unwrap();

    assert_eq!(author.get("name"), Some(json!("Le Guin")));
    assert_eq!(book.get("title"), Some(json!("Changed")));
}

#[test]
fn refresh_of_removed_record_fails() {
    let store = seeded();
    let mut session = Session::new(store.clone(), library());
    let book = session.collection("Book").unwrap().get("b3").unwrap();
    store.remove("books", &by_id(&json!("b3"))).unwrap();

    assert!(matches!(
        session.refresh(&book),
        Err(Error::DocumentNotFound { .. })
    ));

    let unsaved = session.collection("Book").unwrap().create();
    assert!(matches!(
        session.refresh(&unsaved),
        Err(Error::IntegrityConstraint(_))
    ));
}

#[test]
fn resolve_all_batches_into_one_query() {
    let store = seeded();
    let mut session = Session::new(store.clone(), library());
    let books = session
        .collection("Book")
        .unwrap()
        .find(&match_all())
        .unwrap();
    assert_eq!(books.len(), 4);

    store.clear_log();
    let resolved = session.resolve_all(&books, "author").unwrap();
    assert_eq!(resolved, 4);
    let author_reads = store
        .operations()
        .iter()
        .filter(|op| op.kind == OperationKind::Find && op.collection == "authors")
        .count();
    assert_eq!(author_reads, 1);

    let first = books[0].reference("author").unwrap().unwrap();
    assert!(first.is_resolved());
    assert_eq!(session.n1_stats().total_loads, 0);
    assert_eq!(session.resolve_all(&books, "author").unwrap(), 0);
}

#[test]
fn one_by_one_resolution_is_counted() {
    let store = seeded();
    let mut session = Session::new(store, library());
    let books = session
        .collection("Book")
        .unwrap()
        .find(&match_all())
        .unwrap();

    for book in &books {
        book.reference("author")
            .unwrap()
            .unwrap()
            .resolve(&mut session)
            .unwrap();
    }
    let stats = session.n1_stats();
    assert_eq!(stats.total_loads, 4);
    assert_eq!(stats.relationships_loaded, 1);
    assert_eq!(stats.potential_n1, 1);
}
