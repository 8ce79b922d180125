//! Rewrites a raw BlendSQL query into plain-SQL-plus-placeholders form.
//!
//! Every unique ingredient invocation is replaced by a short opaque alias of
//! the form `{{A()}}`, and the parsed representation of each invocation is
//! recorded against its alias. Downstream stages only ever see aliases; the
//! raw invocation text is kept on the parsed record for recursive calls.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::grammar::{self, ParsedIngredient};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static OUTER_PARENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^\((.*)\)$").unwrap());

/// Result of preprocessing: the rewritten query and the alias map.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub query: String,
    pub alias_to_parsed: IndexMap<String, ParsedIngredient>,
}

/// Hands out placeholder aliases `{{A()}}`, `{{B()}}`, …, `{{AA()}}`, … in a
/// stable per-query enumeration.
#[derive(Debug, Clone, Default)]
pub struct AliasGenerator {
    next_id: usize,
}

impl AliasGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gen(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("{{{{{}()}}}}", letters(id))
    }
}

/// Bijective base-26 over `A`..`Z`: 0 → A, 25 → Z, 26 → AA.
fn letters(mut n: usize) -> String {
    let mut out = String::new();
    n += 1;
    while n > 0 {
        n -= 1;
        out.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }
    out
}

/// Collapses whitespace and substitutes a placeholder alias for every
/// ingredient invocation, assigning aliases in reverse text order so that
/// offset edits never invalidate matches still to be processed.
pub fn preprocess(query: &str) -> Preprocessed {
    let mut query = WHITESPACE.replace_all(query.trim(), " ").into_owned();
    let mut alias_to_parsed: IndexMap<String, ParsedIngredient> = IndexMap::new();
    let mut raw_to_alias: IndexMap<String, String> = IndexMap::new();
    let mut aliases = AliasGenerator::new();

    let matches = grammar::scan(&query);
    for m in matches.into_iter().rev() {
        let mut start = m.start;
        let mut end = m.end;
        // An invocation sitting alone between parentheses becomes a scalar
        // subquery once prefixed with SELECT, which lets the SQL parser carry
        // it through as a unit.
        if enclosed_in_parens(&query, start, end) {
            let inserted = " SELECT ";
            query.insert_str(start, inserted);
            start += inserted.len();
            end += inserted.len();
        }
        let raw = query[start..end].to_string();
        let alias = match raw_to_alias.get(&raw).cloned() {
            Some(alias) => alias,
            None => {
                let alias = aliases.gen();
                log::debug!("assigning `{alias}` to `{raw}`");
                let mut parsed = m.parsed.clone();
                parsed.raw = raw.clone();
                strip_arg_parens(&mut parsed);
                raw_to_alias.insert(raw, alias.clone());
                alias_to_parsed.insert(alias.clone(), parsed);
                alias
            }
        };
        query.replace_range(start..end, &alias);
    }

    Preprocessed {
        query,
        alias_to_parsed,
    }
}

/// True when the invocation at `start..end` is immediately wrapped in bare
/// parentheses (at most one space of slack on each side, since whitespace has
/// already been collapsed).
fn enclosed_in_parens(query: &str, start: usize, end: usize) -> bool {
    let before = query[..start].trim_end_matches(' ');
    let after = query[end..].trim_start_matches(' ');
    let spaces_before = start - before.len();
    let spaces_after = (query.len() - end) - after.len();
    spaces_before <= 1 && spaces_after <= 1 && before.ends_with('(') && after.starts_with(')')
}

/// Strips a single layer of surrounding parentheses from each arg and kwarg
/// value, so `(SELECT …)` subquery arguments arrive bare.
fn strip_arg_parens(parsed: &mut ParsedIngredient) {
    let strip = |value: &str| -> String {
        OUTER_PARENS
            .captures(value)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_else(|| value.to_string())
    };
    for arg in &mut parsed.args {
        *arg = strip(arg);
    }
    for (_, value) in &mut parsed.kwargs {
        *value = strip(value);
    }
}
