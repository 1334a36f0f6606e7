//! Document-filter dialect.
//!
//! Turns compiled [`Predicate`]s into store [`Filter`]s. Parameters are bound
//! from a definitions document; `like` patterns become anchored regexes and
//! `indexed with` yields an index hint instead of a filter term.

use crate::statement::{Operand, OperandKind, Operator, Predicate};
use docmodel_core::{Document, Error, Filter, Result, Value};

/// Index advice produced by `indexed with`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHint {
    pub path: String,
    pub index: Value,
}

/// A translated query: filter plus optional index hints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub hints: Vec<IndexHint>,
}

/// Translate one predicate.
pub fn translate(predicate: &Predicate, params: &Document) -> Result<Query> {
    translate_all(std::slice::from_ref(predicate), params)
}

/// Translate predicates joined by AND.
pub fn translate_all(predicates: &[Predicate], params: &Document) -> Result<Query> {
    let mut query = Query::default();
    for predicate in predicates {
        let (path, operator, value) = orient(predicate, params)?;
        if operator == Operator::IndexedWith {
            query.hints.push(IndexHint { path, index: value });
            continue;
        }
        let term = term(predicate, operator, value)?;
        merge(&mut query.filter, predicate, path, term)?;
    }
    Ok(query)
}

fn bind(predicate: &Predicate, side: &Operand, params: &Document) -> Result<Value> {
    match side.kind {
        OperandKind::Data => Ok(side.value.clone()),
        OperandKind::Param => {
            let name = side.name().unwrap_or_default();
            params.get(name).cloned().ok_or_else(|| {
                Error::syntax(
                    predicate.statement.as_str(),
                    format!("parameter ':{name}' has no definition"),
                )
            })
        }
        OperandKind::Path => Err(Error::syntax(
            predicate.statement.as_str(),
            "comparing two property paths is not supported by document filters",
        )),
    }
}

/// Put the path on the left, flipping the comparison if needed.
fn orient(predicate: &Predicate, params: &Document) -> Result<(String, Operator, Value)> {
    let (path, other, operator) = match (predicate.left.kind, predicate.right.kind) {
        (OperandKind::Path, _) => (&predicate.left, &predicate.right, predicate.operator),
        (_, OperandKind::Path) => {
            let flipped = match predicate.operator {
                Operator::Lt => Operator::Gt,
                Operator::Le => Operator::Ge,
                Operator::Gt => Operator::Lt,
                Operator::Ge => Operator::Le,
                other => other,
            };
            (&predicate.right, &predicate.left, flipped)
        }
        _ => {
            return Err(Error::syntax(
                predicate.statement.as_str(),
                "statement compares no property path",
            ));
        }
    };
    let value = bind(predicate, other, params)?;
    Ok((path.original.clone(), operator, value))
}

fn op(name: &str, value: Value) -> Value {
    let mut doc = Document::new();
    doc.insert(name.to_string(), value);
    Value::Object(doc)
}

fn term(predicate: &Predicate, operator: Operator, value: Value) -> Result<Value> {
    let statement = predicate.statement.as_str();
    Ok(match operator {
        Operator::Eq => value,
        Operator::Lt => op("$lt", value),
        Operator::Le => op("$lte", value),
        Operator::Gt => op("$gt", value),
        Operator::Ge => op("$gte", value),
        Operator::In => match value {
            Value::Array(_) => op("$in", value),
            _ => return Err(Error::syntax(statement, "'in' needs a list on the right")),
        },
        Operator::Like => match value.as_str() {
            Some(pattern) => op("$regex", Value::String(like_to_regex(pattern))),
            None => return Err(Error::syntax(statement, "'like' needs a string pattern")),
        },
        Operator::Rlike => match value.as_str() {
            Some(pattern) => {
                regex::Regex::new(pattern).map_err(|e| {
                    Error::syntax(statement, format!("invalid regular expression: {e}"))
                })?;
                op("$regex", value)
            }
            None => return Err(Error::syntax(statement, "'rlike' needs a string pattern")),
        },
        Operator::IndexedWith => Value::Null,
    })
}

fn merge(filter: &mut Filter, predicate: &Predicate, path: String, term: Value) -> Result<()> {
    let Some(existing) = filter.get_mut(&path) else {
        filter.insert(path, term);
        return Ok(());
    };
    if let (Value::Object(existing), Value::Object(new)) = (existing, &term) {
        if is_operator_doc(existing) && is_operator_doc(new) {
            existing.extend(new.clone());
            return Ok(());
        }
    }
    Err(Error::syntax(
        predicate.statement.as_str(),
        format!("conflicting conditions on '{path}'"),
    ))
}

fn is_operator_doc(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}

/// Convert a SQL-style `like` pattern (`%`, `_`) to an anchored regex.
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '%' | '_' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '%' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::compile;
    use serde_json::json;

    fn params(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_param_binding() {
        let p = compile("author.name = :name").unwrap();
        let q = translate(&p, &params(json!({"name": "Le Guin"}))).unwrap();
        assert_eq!(Value::Object(q.filter), json!({"author.name": "Le Guin"}));
        assert!(q.hints.is_empty());
    }

    #[test]
    fn test_missing_param_is_syntax_error() {
        let p = compile("author = :who").unwrap();
        let err = translate(&p, &Document::new()).unwrap_err();
        assert_eq!(err.statement(), Some("author = :who"));
    }

    #[test]
    fn test_like_becomes_anchored_regex() {
        assert_eq!(like_to_regex("The %"), "^The .*$");
        assert_eq!(like_to_regex("a_c.d"), "^a.c\\.d$");

        let p = compile(r#"title like "Lathe%""#).unwrap();
        let q = translate(&p, &Document::new()).unwrap();
        assert_eq!(
            Value::Object(q.filter),
            json!({"title": {"$regex": "^Lathe.*$"}})
        );
    }

    #[test]
    fn test_reversed_comparison_is_flipped() {
        let p = compile("1970 < year").unwrap();
        let q = translate(&p, &Document::new()).unwrap();
        assert_eq!(Value::Object(q.filter), json!({"year": {"$gt": 1970}}));
    }

    #[test]
    fn test_range_terms_merge() {
        let a = compile("year >= :from").unwrap();
        let b = compile("year < :to").unwrap();
        let q = translate_all(&[a, b], &params(json!({"from": 1960, "to": 1980}))).unwrap();
        assert_eq!(
            Value::Object(q.filter),
            json!({"year": {"$gte": 1960, "$lt": 1980}})
        );

        let a = compile("year = 1960").unwrap();
        let b = compile("year = 1970").unwrap();
        assert!(translate_all(&[a, b], &Document::new()).is_err());
    }

    #[test]
    fn test_indexed_with_yields_hint() {
        let p = compile(r#"title indexed with "title_idx""#).unwrap();
        let q = translate(&p, &Document::new()).unwrap();
        assert!(q.filter.is_empty());
        assert_eq!(
            q.hints,
            vec![IndexHint {
                path: "title".to_string(),
                index: json!("title_idx")
            }]
        );
    }

    #[test]
    fn test_in_requires_list() {
        let p = compile("title in :titles").unwrap();
        assert!(translate(&p, &params(json!({"titles": "x"}))).is_err());
        let q = translate(&p, &params(json!({"titles": ["x", "y"]}))).unwrap();
        assert_eq!(
            Value::Object(q.filter),
            json!({"title": {"$in": ["x", "y"]}})
        );
    }

    #[test]
    fn test_path_against_path_is_rejected() {
        let p = compile("a.b = c.d").unwrap();
        assert!(translate(&p, &Document::new()).is_err());
        let p = compile(r#"title rlike "(""#).unwrap();
        assert!(translate(&p, &Document::new()).is_err());
    }
}
