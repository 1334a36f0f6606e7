//! Query statement compiler.
//!
//! Compiles statements of the form `<left> <operator> <right>` into a
//! [`Predicate`]. Each side is classified as:
//!
//! - a **parameter** (`:name`), bound later from a definitions map
//! - a **path** (`book.author`), a dotted attribute chain
//! - **data** (`["A", "B"]`, `42`, `"text"`), any JSON literal
//!
//! ```ignore
//! let predicate = compile("book.author = :name")?;
//! assert_eq!(predicate.left.kind, OperandKind::Path);
//! assert_eq!(predicate.right.kind, OperandKind::Param);
//! ```

use docmodel_core::{Error, Result, Value};
use serde::Serialize;
use std::fmt;

/// Comparison operator of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "rlike")]
    Rlike,
    #[serde(rename = "indexed with")]
    IndexedWith,
}

/// Symbolic operators, longest first so `<=` wins over `<`.
const SYMBOLS: &[(&str, Operator)] = &[
    ("<=", Operator::Le),
    (">=", Operator::Ge),
    ("<", Operator::Lt),
    (">", Operator::Gt),
    ("=", Operator::Eq),
];

/// Keyword operators; matched only between whitespace.
const KEYWORDS: &[(&str, Operator)] = &[
    ("indexed with", Operator::IndexedWith),
    ("rlike", Operator::Rlike),
    ("like", Operator::Like),
    ("in", Operator::In),
];

impl Operator {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::Like => "like",
            Operator::Rlike => "rlike",
            Operator::IndexedWith => "indexed with",
        }
    }

    /// Operators whose left side must be a path and right side must not.
    pub const fn is_shaped(self) -> bool {
        matches!(
            self,
            Operator::In | Operator::Like | Operator::Rlike | Operator::IndexedWith
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one side of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperandKind {
    Param,
    Path,
    Data,
}

/// One side of a compiled statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operand {
    #[serde(rename = "type")]
    pub kind: OperandKind,
    /// The side as written.
    pub original: String,
    /// Parameter name, path string, or decoded JSON data.
    pub value: Value,
}

impl Operand {
    fn classify(statement: &str, text: &str) -> Result<Self> {
        let (kind, value) = if let Some(name) = text.strip_prefix(':') {
            if !is_identifier(name) {
                return Err(Error::syntax(
                    statement,
                    format!("invalid parameter name '{text}'"),
                ));
            }
            (OperandKind::Param, Value::String(name.to_string()))
        } else if is_path(text) {
            (OperandKind::Path, Value::String(text.to_string()))
        } else {
            let value = serde_json::from_str(text).map_err(|e| {
                Error::syntax(statement, format!("'{text}' is not valid data: {e}"))
            })?;
            (OperandKind::Data, value)
        };
        Ok(Self {
            kind,
            original: text.to_string(),
            value,
        })
    }

    pub fn is_path(&self) -> bool {
        self.kind == OperandKind::Path
    }

    /// Parameter name or path, for param/path operands.
    pub fn name(&self) -> Option<&str> {
        match self.kind {
            OperandKind::Data => None,
            OperandKind::Param | OperandKind::Path => self.value.as_str(),
        }
    }
}

/// A compiled statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Predicate {
    pub left: Operand,
    #[serde(rename = "operand")]
    pub operator: Operator,
    pub right: Operand,
    /// The full statement as written.
    #[serde(skip)]
    pub statement: String,
}

impl Predicate {
    /// The predicate as a JSON document (`{left, operand, right}`).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Dotted identifier chain, excluding the JSON keywords.
fn is_path(s: &str) -> bool {
    !matches!(s, "true" | "false" | "null") && s.split('.').all(is_identifier)
}

/// Locate the first operator outside quoted strings and brackets.
fn find_operator(text: &str) -> Option<(usize, usize, Operator)> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if c == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ if depth == 0 && text.is_char_boundary(i) => {
                let rest = &text[i..];
                if let Some((sym, op)) = SYMBOLS.iter().find(|(sym, _)| rest.starts_with(sym)) {
                    return Some((i, i + sym.len(), *op));
                }
                if c.is_ascii_whitespace() {
                    let word_start = i + 1;
                    let after_ws = &text[word_start..];
                    for (word, op) in KEYWORDS {
                        let end = word_start + word.len();
                        if after_ws.starts_with(word)
                            && bytes.get(end).is_some_and(u8::is_ascii_whitespace)
                        {
                            return Some((i, end, *op));
                        }
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Compile a statement into a predicate.
pub fn compile(statement: &str) -> Result<Predicate> {
    let text = statement.trim();
    let Some((start, end, operator)) = find_operator(text) else {
        return Err(Error::syntax(statement, "no comparison operator found"));
    };
    let left = text[..start].trim();
    let right = text[end..].trim();
    if left.is_empty() || right.is_empty() {
        return Err(Error::syntax(
            statement,
            format!("operator '{operator}' needs a left and a right side"),
        ));
    }

    let left = Operand::classify(statement, left)?;
    let right = Operand::classify(statement, right)?;

    if operator.is_shaped() {
        if !left.is_path() {
            return Err(Error::syntax(
                statement,
                format!("left side of '{operator}' must be a property path"),
            ));
        }
        if right.is_path() {
            return Err(Error::syntax(
                statement,
                format!("right side of '{operator}' cannot be a property path"),
            ));
        }
    }

    tracing::trace!(statement, operator = %operator, "Compiled statement");
    Ok(Predicate {
        left,
        operator,
        right,
        statement: statement.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_equals_param() {
        let p = compile("book.author = :name").unwrap();
        assert_eq!(p.left.kind, OperandKind::Path);
        assert_eq!(p.left.original, "book.author");
        assert_eq!(p.operator, Operator::Eq);
        assert_eq!(p.right.kind, OperandKind::Param);
        assert_eq!(p.right.original, ":name");
        assert_eq!(p.right.name(), Some("name"));

        let doc = p.to_value();
        assert_eq!(doc["left"]["type"], json!("path"));
        assert_eq!(doc["operand"], json!("="));
        assert_eq!(doc["right"]["type"], json!("param"));
    }

    #[test]
    fn test_in_with_data() {
        let p = compile(r#"book.title in ["A","B"]"#).unwrap();
        assert_eq!(p.operator, Operator::In);
        assert_eq!(p.right.kind, OperandKind::Data);
        assert_eq!(p.right.value, json!(["A", "B"]));
    }

    #[test]
    fn test_in_with_path_on_right_is_rejected() {
        let err = compile("x in y").unwrap_err();
        assert!(matches!(err, Error::Syntax { .. }));
        assert_eq!(err.statement(), Some("x in y"));
    }

    #[test]
    fn test_shaped_operator_needs_path_on_left() {
        assert!(compile(r#""x" like "a%""#).is_err());
        assert!(compile(":p rlike \"^a\"").is_err());
        assert!(compile("name indexed with \"name_idx\"").is_ok());
    }

    #[test]
    fn test_symbolic_operators() {
        assert_eq!(compile("year <= 1970").unwrap().operator, Operator::Le);
        assert_eq!(compile("year>=1970").unwrap().operator, Operator::Ge);
        assert_eq!(compile("year < :y").unwrap().operator, Operator::Lt);
        assert_eq!(compile("a.b > c.d").unwrap().right.kind, OperandKind::Path);
    }

    #[test]
    fn test_operators_inside_data_are_ignored() {
        let p = compile(r#"title = "a = b""#).unwrap();
        assert_eq!(p.right.value, json!("a = b"));

        let p = compile(r#"tags in ["x<y", "in"]"#).unwrap();
        assert_eq!(p.right.value, json!(["x<y", "in"]));
    }

    #[test]
    fn test_keywords_need_word_boundaries() {
        let p = compile("index = 3").unwrap();
        assert_eq!(p.left.original, "index");
        assert_eq!(p.operator, Operator::Eq);

        let p = compile("title rlike \"^The\"").unwrap();
        assert_eq!(p.operator, Operator::Rlike);
    }

    #[test]
    fn test_json_keywords_are_data() {
        let p = compile("published = true").unwrap();
        assert_eq!(p.right.kind, OperandKind::Data);
        assert_eq!(p.right.value, json!(true));
    }

    #[test]
    fn test_unparseable_statements() {
        assert!(matches!(compile("just words"), Err(Error::Syntax { .. })));
        assert!(matches!(compile("= 3"), Err(Error::Syntax { .. })));
        assert!(matches!(compile("a = {broken"), Err(Error::Syntax { .. })));
        assert!(matches!(compile("a = :9x"), Err(Error::Syntax { .. })));
    }
}
