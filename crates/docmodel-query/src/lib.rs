//! Query statements for DocModel.
//!
//! `docmodel-query` is the **query construction layer**. It compiles short
//! textual statements into structured predicates and translates predicates
//! into the filter documents understood by `DocumentStore` drivers.
//!
//! # Role In The Architecture
//!
//! - **Statement compiler**: `compile()` parses `<left> <operator> <right>`.
//! - **Filter dialect**: `translate()` binds parameters and builds a `Filter`.
//!
//! Sessions use both through `Collection::query`.

pub mod dialect;
pub mod statement;

pub use dialect::{IndexHint, Query, like_to_regex, translate, translate_all};
pub use statement::{Operand, OperandKind, Operator, Predicate, compile};

use docmodel_core::{Document, Result};

/// Compile and translate statements joined by AND.
pub fn build(statements: &[&str], params: &Document) -> Result<Query> {
    let predicates = statements
        .iter()
        .map(|s| compile(s))
        .collect::<Result<Vec<_>>>()?;
    translate_all(&predicates, params)
}
