//! Filter evaluation against stored documents.

use docmodel_core::store::OPERATORS;
use docmodel_core::value::{lookup_path, value_matches};
use docmodel_core::{Document, Error, Filter, Result, StoreError, StoreErrorKind, Value};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Compiled `$regex` patterns, shared by every store in the process.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn get_or_compile(&self, pattern: &str) -> std::result::Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }
        let regex = Regex::new(pattern)?;
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(|| RegexCache {
        cache: RwLock::new(HashMap::new()),
    })
}

fn invalid(message: String) -> Error {
    Error::Store(StoreError::new(StoreErrorKind::InvalidDocument, message))
}

fn is_operator_doc(value: &Value) -> Option<&Document> {
    match value {
        Value::Object(doc) if !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) => {
            Some(doc)
        }
        _ => None,
    }
}

/// Does `doc` satisfy every term of `filter`?
pub fn matches(doc: &Document, filter: &Filter) -> Result<bool> {
    for (path, condition) in filter {
        let stored = lookup_path(doc, path);
        let ok = match is_operator_doc(condition) {
            Some(ops) => {
                let mut all = true;
                for (op, operand) in ops {
                    if !apply(op, stored, operand)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            None => equals(stored, condition),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn equals(stored: Option<&Value>, expected: &Value) -> bool {
    match stored {
        Some(value) => value_matches(value, expected),
        None => expected.is_null(),
    }
}

fn apply(op: &str, stored: Option<&Value>, operand: &Value) -> Result<bool> {
    match op {
        "$eq" => Ok(equals(stored, operand)),
        "$lt" => Ok(compare_any(stored, operand, Ordering::is_lt)),
        "$lte" => Ok(compare_any(stored, operand, Ordering::is_le)),
        "$gt" => Ok(compare_any(stored, operand, Ordering::is_gt)),
        "$gte" => Ok(compare_any(stored, operand, Ordering::is_ge)),
        "$in" => match operand {
            Value::Array(items) => Ok(items.iter().any(|item| equals(stored, item))),
            other => Err(invalid(format!("$in expects a list, got {other}"))),
        },
        "$regex" => {
            let Some(pattern) = operand.as_str() else {
                return Err(invalid(format!("$regex expects a string, got {operand}")));
            };
            let regex = regex_cache()
                .get_or_compile(pattern)
                .map_err(|e| invalid(format!("invalid $regex '{pattern}': {e}")))?;
            Ok(match stored {
                Some(Value::String(s)) => regex.is_match(s),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|s| regex.is_match(s)),
                _ => false,
            })
        }
        other => Err(invalid(format!(
            "unsupported filter operator '{other}' (expected one of {})",
            OPERATORS.join(", ")
        ))),
    }
}

/// Order two scalars of the same kind; mixed kinds are incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare_any(stored: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    match stored {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare(item, operand).is_some_and(accept)),
        Some(value) => compare(value, operand).is_some_and(accept),
        None => false,
    }
}
