//! Schemaless document values.
//!
//! Attribute values are plain JSON values. A [`Document`] is an ordered
//! attribute map; raw records coming out of a store carry their identity
//! under [`ID_KEY`].

pub use serde_json::Value;

/// An attribute map (attribute name -> value).
pub type Document = serde_json::Map<String, Value>;

/// The reserved identity key in raw records.
pub const ID_KEY: &str = "_id";

/// Render an identity as a stable string (used as identity-map key and in messages).
pub fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Look up a dotted attribute path (`"author.name"`) in a document.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Does `stored` satisfy equality with `expected`?
///
/// A stored array matches when any element equals `expected`, which is how
/// owning one-to-many id lists are searched.
pub fn value_matches(stored: &Value, expected: &Value) -> bool {
    if stored == expected {
        return true;
    }
    match stored {
        Value::Array(items) => items.iter().any(|item| item == expected),
        _ => false,
    }
}
