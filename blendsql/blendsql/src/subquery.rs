//! Per-subquery bookkeeping: table and alias enumeration, abstracted
//! (ingredient-free) selects, and output-format inference for map
//! ingredients.
//!
//! The orchestrator owns the driving loop; this type only exposes accessors
//! over one subquery's state and is discarded once the subquery is done.

use core::ops::ControlFlow;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{visit_expressions, Expr, Query, SetExpr, TableFactor};

use crate::db::quote_ident;
use crate::sqlast::{
    self,
    transforms::{self, split_conjuncts},
};

pub struct SubqueryContextManager {
    node: Query,
    prev_subquery_has_ingredient: bool,
    alias_to_subquery: IndexMap<String, String>,
    alias_to_tablename: IndexMap<String, String>,
}

impl SubqueryContextManager {
    /// `cte_binding` carries the (alias, body text) pair when the subquery
    /// itself is the body of a CTE; aliased derived tables inside the node
    /// are picked up here as well.
    pub fn new(
        node: Query,
        prev_subquery_has_ingredient: bool,
        cte_binding: Option<(String, String)>,
    ) -> Self {
        let mut node = node;
        let mut alias_to_subquery = IndexMap::new();
        let mut alias_to_tablename = IndexMap::new();
        transforms::for_each_table_factor_mut(&mut node, &mut |factor| match factor {
            TableFactor::Table { name, alias, .. } => {
                if let (Some(ident), Some(alias)) =
                    (sqlast::object_name_ident(name), alias.as_ref())
                {
                    alias_to_tablename.insert(alias.name.value.clone(), ident);
                }
            }
            TableFactor::Derived {
                subquery,
                alias: Some(alias),
                ..
            } => {
                alias_to_subquery
                    .insert(alias.name.value.clone(), sqlast::print_query(subquery));
            }
            _ => {}
        });
        if let Some((alias, text)) = cte_binding {
            alias_to_subquery.insert(alias, text);
        }
        SubqueryContextManager {
            node,
            prev_subquery_has_ingredient,
            alias_to_subquery,
            alias_to_tablename,
        }
    }

    /// The subquery in its current (placeholder-recovered) text form. The
    /// dispatch loop scans this string, so spans handed back to
    /// [`Self::infer_map_constraints`] index into it.
    pub fn sql(&self) -> String {
        sqlast::print_query(&self.node)
    }

    /// Collapses subqueries that deeper iterations already materialized, so
    /// their ingredient aliases are not dispatched again from this node.
    pub fn collapse_materialized_subqueries(&mut self) {
        transforms::maybe_set_subqueries_to_true(&mut self.node);
    }

    pub fn pop_alias_subquery(&mut self, name: &str) -> Option<String> {
        self.alias_to_subquery.shift_remove(name)
    }

    /// Remaining alias bindings whose work has not been flushed yet.
    pub fn drain_alias_subqueries(&mut self) -> Vec<(String, String)> {
        self.alias_to_subquery.drain(..).collect()
    }

    pub fn alias_to_tablename(&self) -> &IndexMap<String, String> {
        &self.alias_to_tablename
    }

    /// Tables (and table-valued aliases) of this subquery, in source order.
    fn tables(&self) -> Vec<String> {
        let mut node = self.node.clone();
        let mut out: Vec<String> = Vec::new();
        transforms::for_each_table_factor_mut(&mut node, &mut |factor| {
            let name = match factor {
                TableFactor::Table { name, .. } => sqlast::object_name_ident(name),
                TableFactor::Derived {
                    alias: Some(alias), ..
                } => Some(alias.name.value.clone()),
                _ => None,
            };
            if let Some(name) = name {
                if !name.starts_with(sqlast::PLACEHOLDER_PREFIX) && !out.contains(&name) {
                    out.push(name);
                }
            }
        });
        out
    }

    /// Yields `(tablename, abstracted_query)` for every table of the
    /// subquery. The abstracted query keeps only the ingredient-free,
    /// same-table, subquery-free predicates, to shrink the working set
    /// before any ingredient runs; it is `None` when a previous subquery
    /// already evaluated an ingredient (abstraction would no longer be
    /// sound against the partially-materialized state) or when this subquery
    /// has no ingredient at all.
    pub fn abstracted_table_selects(&self) -> Vec<(String, Option<String>)> {
        let tables = self.tables();
        let has_ingredient = sqlast::MANGLED_RE.is_match(&self.node.to_string());
        if self.prev_subquery_has_ingredient || !has_ingredient {
            return tables.into_iter().map(|t| (t, None)).collect();
        }
        let conjuncts: Vec<Expr> = match self.node.body.as_ref() {
            SetExpr::Select(select) => select
                .selection
                .as_ref()
                .map(split_conjuncts)
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let single_table = tables.len() == 1;
        tables
            .into_iter()
            .map(|tablename| {
                let mut allowed: Vec<String> = vec![tablename.clone()];
                allowed.extend(
                    self.alias_to_tablename
                        .iter()
                        .filter(|(_, t)| **t == tablename)
                        .map(|(a, _)| a.clone()),
                );
                let kept: Vec<String> = conjuncts
                    .iter()
                    .filter(|expr| {
                        !sqlast::MANGLED_RE.is_match(&expr.to_string())
                            && !sqlast::contains_query(*expr)
                            && references_only(expr, &allowed, single_table)
                    })
                    .map(|expr| expr.to_string())
                    .collect();
                let sql = if kept.is_empty() {
                    format!("SELECT * FROM {}", quote_ident(&tablename))
                } else {
                    format!(
                        "SELECT * FROM {} WHERE {}",
                        quote_ident(&tablename),
                        kept.join(" AND ")
                    )
                };
                (tablename, Some(sql))
            })
            .collect()
    }

    /// Given the span of a MAP ingredient inside [`Self::sql`], derives
    /// example outputs from an adjacent comparison literal — e.g. the RHS of
    /// `{{A()}} <= '1960-12-31'`.
    pub fn infer_map_constraints(&self, start: usize, end: usize) -> Vec<String> {
        static AFTER: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^\s*(?:<=|>=|!=|<>|=|<|>|LIKE)\s*('(?:[^']|'')*'|[0-9][0-9A-Za-z.\-]*)")
                .unwrap()
        });
        static BEFORE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"('(?:[^']|'')*'|[0-9][0-9A-Za-z.\-]*)\s*(?:<=|>=|!=|<>|=|<|>|LIKE)\s*$")
                .unwrap()
        });
        let text = self.sql();
        let mut out = Vec::new();
        if end <= text.len() {
            if let Some(captures) = AFTER.captures(&text[end..]) {
                out.push(strip_literal_quotes(&captures[1]));
            }
        }
        if start <= text.len() {
            if let Some(captures) = BEFORE.captures(&text[..start]) {
                out.push(strip_literal_quotes(&captures[1]));
            }
        }
        out
    }
}

fn strip_literal_quotes(literal: &str) -> String {
    if literal.len() >= 2 && literal.starts_with('\'') && literal.ends_with('\'') {
        literal[1..literal.len() - 1].replace("''", "'")
    } else {
        literal.to_string()
    }
}

/// True when every column reference in `expr` resolves to one of the
/// `allowed` names; unqualified columns only pass in a single-table context.
fn references_only(expr: &Expr, allowed: &[String], allow_unqualified: bool) -> bool {
    let mut ok = true;
    let _ = visit_expressions(expr, |e: &Expr| {
        match e {
            Expr::CompoundIdentifier(parts) => {
                if let Some(first) = parts.first() {
                    if !allowed.iter().any(|a| a == &first.value) {
                        ok = false;
                    }
                }
            }
            Expr::Identifier(_) => {
                if !allow_unqualified {
                    ok = false;
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    ok
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sqlast::parse_query;

    fn scm(sql: &str, prev: bool) -> SubqueryContextManager {
        SubqueryContextManager::new(parse_query(sql).unwrap(), prev, None)
    }

    #[test]
    fn test_alias_to_tablename() {
        let scm = scm("SELECT * FROM portfolio AS p WHERE p.x = 1", false);
        assert_eq!(
            scm.alias_to_tablename().get("p"),
            Some(&"portfolio".to_string())
        );
    }

    #[test]
    fn test_aliased_derived_table_is_tracked() {
        let mut scm = scm(
            "SELECT s FROM (SELECT DISTINCT s FROM portfolio) AS w WHERE {{A()}} = 1",
            false,
        );
        assert_eq!(
            scm.pop_alias_subquery("w"),
            Some("SELECT DISTINCT s FROM portfolio".to_string())
        );
        assert_eq!(scm.pop_alias_subquery("w"), None);
    }

    #[test]
    fn test_abstraction_keeps_ingredient_free_same_table_predicates() {
        let scm = scm(
            "SELECT item FROM w WHERE {{A()}} = 1 AND item > 5",
            false,
        );
        assert_eq!(
            scm.abstracted_table_selects(),
            vec![(
                "w".to_string(),
                Some("SELECT * FROM \"w\" WHERE item > 5".to_string())
            )]
        );
    }

    #[test]
    fn test_no_abstraction_after_previous_ingredient() {
        let scm = scm("SELECT item FROM w WHERE {{A()}} = 1 AND item > 5", true);
        assert_eq!(
            scm.abstracted_table_selects(),
            vec![("w".to_string(), None)]
        );
    }

    #[test]
    fn test_no_abstraction_without_ingredients() {
        let scm = scm("SELECT item FROM w WHERE item > 5", false);
        assert_eq!(
            scm.abstracted_table_selects(),
            vec![("w".to_string(), None)]
        );
    }

    #[test]
    fn test_abstraction_drops_other_table_predicates() {
        let scm = scm(
            "SELECT * FROM a JOIN b ON a.x = b.x WHERE {{A()}} = 1 AND a.y > 2 AND b.z = 3",
            false,
        );
        let selects = scm.abstracted_table_selects();
        assert_eq!(
            selects[0],
            (
                "a".to_string(),
                Some("SELECT * FROM \"a\" WHERE a.y > 2".to_string())
            )
        );
        assert_eq!(
            selects[1],
            (
                "b".to_string(),
                Some("SELECT * FROM \"b\" WHERE b.z = 3".to_string())
            )
        );
    }

    #[test]
    fn test_infer_map_constraints_from_rhs_literal() {
        let scm = scm(
            "SELECT * FROM w WHERE {{A()}} <= '1960-12-31'",
            false,
        );
        let text = scm.sql();
        let matched = blendsql_parser::scan(&text).pop().unwrap();
        assert_eq!(
            scm.infer_map_constraints(matched.start, matched.end),
            vec!["1960-12-31".to_string()]
        );
    }

    #[test]
    fn test_infer_map_constraints_from_lhs_literal() {
        let scm = scm("SELECT * FROM w WHERE 1979 = {{A()}}", false);
        let text = scm.sql();
        let matched = blendsql_parser::scan(&text).pop().unwrap();
        assert_eq!(
            scm.infer_map_constraints(matched.start, matched.end),
            vec!["1979".to_string()]
        );
    }

    #[test]
    fn test_collapse_materialized_subqueries() {
        let mut scm = scm(
            "SELECT * FROM w WHERE {{A()}} = 1 AND x IN (SELECT x FROM t WHERE {{B()}} = 1)",
            true,
        );
        scm.collapse_materialized_subqueries();
        assert_eq!(scm.sql(), "SELECT * FROM w WHERE {{A()}} = 1");
    }
}
