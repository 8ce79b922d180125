//! Naming and substitution helpers shared across the orchestrator.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::db::Backend;
use crate::{Error, Result};

/// Name of the per-query scratch table carrying MAP outputs for base table
/// `tablename`.
pub fn get_temp_session_table(session_id: &str, tablename: &str) -> String {
    format!("{session_id}_{tablename}")
}

/// Name of the per-subquery scratch table holding the abstracted select of
/// `tablename` within subquery `subquery_idx`.
pub fn get_temp_subquery_table(session_id: &str, subquery_idx: usize, tablename: &str) -> String {
    format!("{session_id}_{subquery_idx}_{tablename}")
}

/// Allocates a fresh 4-char session id that no existing table name starts
/// with, so every temp table of this query is recognizable by prefix.
pub fn new_session_id(db: &dyn Backend) -> Result<String> {
    let existing = db.list_tables()?;
    for _ in 0..64 {
        let id: String = uuid::Uuid::new_v4().simple().to_string()[..4].to_string();
        if !existing.iter().any(|t| t.starts_with(&id)) {
            return Ok(id);
        }
    }
    Err(Error::invariant(
        "could not allocate a collision-free session id".to_string(),
    ))
}

/// Splits a `'table::column'` reference.
pub fn get_tablename_colname(reference: &str) -> Result<(String, String)> {
    let mut parts = reference.splitn(2, "::");
    match (parts.next(), parts.next()) {
        (Some(table), Some(column)) if !table.is_empty() && !column.is_empty() => {
            Ok((unquote_ident(table), unquote_ident(column)))
        }
        _ => Err(Error::invalid_query(format!(
            "expected a 'table::column' reference, got {reference:?}"
        ))),
    }
}

fn unquote_ident(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\"\"", "\"")
    } else {
        s.to_string()
    }
}

/// Substitutes every reference to `tablename` (bare or double-quoted) in
/// `query` with `replacement`. `replacement` should arrive already quoted.
pub fn sub_tablename(tablename: &str, replacement: &str, query: &str) -> String {
    let escaped = regex::escape(tablename);
    let pattern = Regex::new(&format!(r#""{escaped}"|\b{escaped}\b"#))
        .expect("escaped tablename is a valid pattern");
    pattern.replace_all(query, replacement).into_owned()
}

static NON_ALPHANUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]").unwrap());

/// Reduces an alias like `{{A()}}` to its bare letters.
pub fn alias_letters(alias: &str) -> String {
    NON_ALPHANUMERIC.replace_all(alias, "").into_owned()
}
