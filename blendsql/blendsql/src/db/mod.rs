//! The relational backend consumed by the orchestrator.
//!
//! The core only ever talks to [`Backend`]; [`SqliteBackend`] is the bundled
//! implementation. Everything here is deliberately narrow: execute a query
//! into a [`Table`], materialize a [`Table`] under a name, and answer
//! catalog questions.

mod sqlite;
mod table;

pub use sqlite::SqliteBackend;
pub use table::{value_to_text, Table, Value};

use crate::Result;

pub trait Backend {
    /// Runs `sql` and collects the result. With `silence_errors`, a backend
    /// failure degrades to an empty table with a warning instead of an error.
    fn execute_query(&self, sql: &str, silence_errors: bool) -> Result<Table>;

    /// Writes `table` under `name` with replace semantics, no index column.
    fn materialize(&self, name: &str, table: &Table) -> Result<()>;

    fn has_table(&self, name: &str) -> Result<bool>;

    fn iter_columns(&self, name: &str) -> Result<Vec<String>>;

    fn list_tables(&self) -> Result<Vec<String>>;

    fn drop_table(&self, name: &str) -> Result<()>;

    /// A human-readable identifier (e.g. a path) for result metadata.
    fn identifier(&self) -> String;
}

pub fn double_quote_escape(s: &str) -> String {
    s.replace('"', "\"\"")
}

pub fn single_quote_escape(s: &str) -> String {
    s.replace('\'', "''")
}

/// Escapes and double-quotes an identifier.
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", double_quote_escape(s))
}

/// Escapes and single-quotes a string literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", single_quote_escape(s))
}
