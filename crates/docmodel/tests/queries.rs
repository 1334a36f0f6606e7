mod common;

use common::{doc, library};
use docmodel::prelude::*;
use docmodel::{Operator, compile};
use serde_json::json;

fn catalog() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .seed(
            "books",
            vec![
                doc(json!({"_id": "b1", "title": "The Lathe of Heaven", "year": 1971,
                           "meta": {"pages": 184}, "genres": ["sf"]})),
                doc(json!({"_id": "b2", "title": "The Dispossessed", "year": 1974,
                           "meta": {"pages": 387}, "genres": ["sf", "utopia"]})),
                doc(json!({"_id": "b3", "title": "Dune", "year": 1965,
                           "meta": {"pages": 412}, "genres": ["sf"]})),
            ],
        )
        .unwrap();
    store
}

fn titles(books: &[Entity]) -> Vec<String> {
    let mut titles: Vec<String> = books
        .iter()
        .filter_map(|b| b.get("title"))
        .filter_map(|t| t.as_str().map(str::to_string))
        .collect();
    titles.sort();
    titles
}

fn params(value: Value) -> Document {
    doc(value)
}

#[test]
fn statement_compiles_to_normalized_predicate() {
    let predicate = compile("book.author = :name").unwrap();
    assert_eq!(predicate.operator, Operator::Eq);
    assert_eq!(
        predicate.to_value(),
        json!({
            "left": {"type": "path", "original": "book.author", "value": "book.author"},
            "operand": "=",
            "right": {"type": "param", "original": ":name", "value": "name"}
        })
    );

    let err = compile("x in y").unwrap_err();
    assert!(matches!(err, Error::Syntax { .. }));
    assert_eq!(err.statement(), Some("x in y"));
}

#[test]
fn collection_query_binds_parameters() {
    let mut session = Session::new(catalog(), library());
    let mut books = session.collection("Book").unwrap();

    let recent = books
        .query("year >= :since", &params(json!({"since": 1970})))
        .unwrap();
    assert_eq!(
        titles(&recent),
        vec!["The Dispossessed", "The Lathe of Heaven"]
    );

    let long = books
        .query_all(
            &["meta.pages > 300", "title like :pattern"],
            &params(json!({"pattern": "The %"})),
        )
        .unwrap();
    assert_eq!(titles(&long), vec!["The Dispossessed"]);

    let utopias = books.query(r#"genres = "utopia""#, &Document::new()).unwrap();
    assert_eq!(titles(&utopias), vec!["The Dispossessed"]);

    let listed = books
        .query("year in :years", &params(json!({"years": [1965, 1971]})))
        .unwrap();
    assert_eq!(titles(&listed), vec!["Dune", "The Lathe of Heaven"]);

    let err = books.query("year = :missing", &Document::new()).unwrap_err();
    assert_eq!(err.statement(), Some("year = :missing"));
}

#[test]
fn query_results_share_identity_with_loaded_entities() {
    let mut session = Session::new(catalog(), library());
    let dune = session.collection("Book").unwrap().get("b3").unwrap();
    let found = session
        .collection("Book")
        .unwrap()
        .query(r#"title rlike "^Du""#, &Document::new())
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].is_same(&dune));
    assert_eq!(session.tracked_count(), 1);
}

#[test]
fn indexed_with_is_passed_to_the_store() {
    let store = catalog();
    let mut session = Session::new(store.clone(), library());
    let found = session
        .collection("Book")
        .unwrap()
        .query_all(
            &[r#"title indexed with "title_idx""#, "year < 1970"],
            &Document::new(),
        )
        .unwrap();
    assert_eq!(titles(&found), vec!["Dune"]);
    assert_eq!(store.hinted_indexes("books"), vec!["title".to_string()]);
}

#[test]
fn auto_flush_writes_pending_changes_before_queries() {
    let store = catalog();
    let config = SessionConfig::new().auto_flush(true);
    let mut session = Session::with_config(store.clone(), library(), config);

    let book = session.collection("Book").unwrap().create();
    book.set("title", "Tehanu").unwrap();
    book.set("year", 1990).unwrap();
    session.persist(&[book.clone()]).unwrap();

    let count = session
        .collection("Book")
        .unwrap()
        .count(&field_eq("year", json!(1990)))
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(session.record_status(&book), Some(RecordStatus::Clean));
    assert!(session.pending_counts().is_empty());
}

#[test]
fn without_auto_flush_queries_see_only_stored_state() {
    let store = catalog();
    let mut session = Session::new(store, library());

    let book = session.collection("Book").unwrap().create();
    book.set("year", 1990).unwrap();
    session.persist(&[book.clone()]).unwrap();

    let found = session
        .collection("Book")
        .unwrap()
        .find_one(&field_eq("year", json!(1990)))
        .unwrap();
    assert!(found.is_none());
    assert_eq!(session.record_status(&book), Some(RecordStatus::New));
}
