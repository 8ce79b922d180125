//! Named AST rewrites applied by the orchestrator.
//!
//! Each transform mutates a parsed query in place. New nodes are obtained by
//! parsing small SQL fragments rather than spelling out AST struct literals,
//! so the rewrites stay agnostic to field-level churn in the SQL AST.

use core::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions_mut, BinaryOperator, Expr, Join, Query, Select, SetExpr, TableFactor, Value,
};

use super::{parse_joins, parse_table_factor, top_level_exprs, MANGLED_RE};
use crate::db::quote_ident;
use crate::Result;

/// Applies `f` to this query and every query nested under it through
/// set-expressions, CTEs, and derived tables.
pub(crate) fn walk_queries_mut(query: &mut Query, f: &mut dyn FnMut(&mut Query)) {
    f(query);
    if let Some(with) = query.with.as_mut() {
        for cte in &mut with.cte_tables {
            walk_queries_mut(&mut cte.query, f);
        }
    }
    walk_set_expr_mut(&mut query.body, f);
}

fn walk_set_expr_mut(body: &mut SetExpr, f: &mut dyn FnMut(&mut Query)) {
    match body {
        SetExpr::Select(select) => {
            for table in &mut select.from {
                walk_table_factor_mut(&mut table.relation, f);
                for join in &mut table.joins {
                    walk_table_factor_mut(&mut join.relation, f);
                }
            }
        }
        SetExpr::Query(query) => walk_queries_mut(query, f),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr_mut(left, f);
            walk_set_expr_mut(right, f);
        }
        _ => {}
    }
}

fn walk_table_factor_mut(factor: &mut TableFactor, f: &mut dyn FnMut(&mut Query)) {
    match factor {
        TableFactor::Derived { subquery, .. } => walk_queries_mut(subquery, f),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            walk_table_factor_mut(&mut table_with_joins.relation, f);
            for join in &mut table_with_joins.joins {
                walk_table_factor_mut(&mut join.relation, f);
            }
        }
        _ => {}
    }
}

pub(crate) fn for_each_select_mut(body: &mut SetExpr, f: &mut dyn FnMut(&mut Select)) {
    match body {
        SetExpr::Select(select) => f(select),
        SetExpr::Query(query) => for_each_select_mut(&mut query.body, f),
        SetExpr::SetOperation { left, right, .. } => {
            for_each_select_mut(left, f);
            for_each_select_mut(right, f);
        }
        _ => {}
    }
}

/// Removes WITH clauses from the subtree; their referenced tables become free
/// names.
pub fn remove_ctes(query: &mut Query) {
    walk_queries_mut(query, &mut |q| {
        q.with = None;
    });
}

/// Removes a WITH clause once none of its bindings is referenced.
pub fn prune_with(query: &mut Query) {
    walk_queries_mut(query, &mut |q| {
        let Some(with) = q.with.take() else { return };
        let referenced = super::collect_table_names(&*q);
        if with
            .cte_tables
            .iter()
            .any(|cte| referenced.contains(&cte.alias.name.value))
        {
            q.with = Some(with);
        }
    });
}

fn is_true(expr: &Expr) -> bool {
    match expr {
        Expr::Value(value) => matches!(value.value, Value::Boolean(true)),
        Expr::Nested(inner) => is_true(inner),
        _ => false,
    }
}

fn true_expr() -> Expr {
    Expr::Value(Value::Boolean(true).into())
}

/// Drops TRUE conjuncts; a selection that was entirely TRUE disappears.
fn simplify_conjunction(expr: Expr) -> Option<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => match (simplify_conjunction(*left), simplify_conjunction(*right)) {
            (None, None) => None,
            (Some(side), None) | (None, Some(side)) => Some(side),
            (Some(l), Some(r)) => Some(Expr::BinaryOp {
                left: Box::new(l),
                op: BinaryOperator::And,
                right: Box::new(r),
            }),
        },
        expr if is_true(&expr) => None,
        expr => Some(expr),
    }
}

/// Removes `WHERE TRUE` and simplifies `… AND TRUE`.
pub fn prune_true_where(query: &mut Query) {
    walk_queries_mut(query, &mut |q| {
        for_each_select_mut(&mut q.body, &mut |select| {
            if let Some(selection) = select.selection.take() {
                select.selection = simplify_conjunction(selection);
            }
        });
    });
}

/// Replaces expression-position subqueries with TRUE. Applied to a local
/// subquery node once all deeper subqueries have been materialized, so their
/// ingredient aliases are not dispatched a second time.
pub fn maybe_set_subqueries_to_true(query: &mut Query) {
    let _ = visit_expressions_mut(query, &mut |expr: &mut Expr| {
        if matches!(
            expr,
            Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. }
        ) {
            *expr = true_expr();
        }
        ControlFlow::<()>::Continue(())
    });
    prune_true_where(query);
}

/// Replaces a materialized subquery — a CTE binding or an aliased derived
/// table — with a bare table reference to `aliasname`.
///
/// `SELECT s FROM (SELECT DISTINCT s FROM p) AS w` becomes
/// `SELECT s FROM "w"` once `w` exists as a real table.
pub fn replace_subquery_with_alias(
    query: &mut Query,
    aliasname: &str,
    subquery_text: &str,
) -> Result<bool> {
    let mut replaced = false;
    walk_queries_mut(query, &mut |q| {
        if let Some(with) = q.with.as_mut() {
            let before = with.cte_tables.len();
            with.cte_tables
                .retain(|cte| cte.alias.name.value != aliasname);
            if with.cte_tables.len() != before {
                replaced = true;
            }
            if with.cte_tables.is_empty() {
                q.with = None;
            }
        }
    });
    let replacement = parse_table_factor(&quote_ident(aliasname))?;
    for_each_table_factor_mut(query, &mut |factor| {
        let matches_target = match factor {
            TableFactor::Derived {
                alias: Some(alias), ..
            } => alias.name.value == aliasname,
            TableFactor::Derived {
                subquery,
                alias: None,
                ..
            } => super::print_query(subquery) == subquery_text,
            _ => false,
        };
        if matches_target {
            *factor = replacement.clone();
            replaced = true;
        }
    });
    Ok(replaced)
}

pub(crate) fn for_each_table_factor_mut(query: &mut Query, f: &mut dyn FnMut(&mut TableFactor)) {
    walk_queries_mut(query, &mut |q| {
        for_each_select_mut(&mut q.body, &mut |select| {
            for table in &mut select.from {
                f(&mut table.relation);
                for join in &mut table.joins {
                    f(&mut join.relation);
                }
            }
        });
    });
}

/// Applies `f` to each join list, stopping once it reports a hit.
fn try_on_joins(query: &mut Query, f: &mut dyn FnMut(&mut Vec<Join>) -> bool) -> bool {
    fn in_set_expr(body: &mut SetExpr, f: &mut dyn FnMut(&mut Vec<Join>) -> bool) -> bool {
        match body {
            SetExpr::Select(select) => {
                for table in &mut select.from {
                    if f(&mut table.joins) {
                        return true;
                    }
                }
                for table in &mut select.from {
                    if let TableFactor::Derived { subquery, .. } = &mut table.relation {
                        if try_on_joins(subquery, f) {
                            return true;
                        }
                    }
                    for join in &mut table.joins {
                        if let TableFactor::Derived { subquery, .. } = &mut join.relation {
                            if try_on_joins(subquery, f) {
                                return true;
                            }
                        }
                    }
                }
                false
            }
            SetExpr::Query(query) => try_on_joins(query, f),
            SetExpr::SetOperation { left, right, .. } => {
                in_set_expr(left, f) || in_set_expr(right, f)
            }
            _ => false,
        }
    }
    if let Some(with) = query.with.as_mut() {
        for cte in &mut with.cte_tables {
            if try_on_joins(&mut cte.query, f) {
                return true;
            }
        }
    }
    in_set_expr(&mut query.body, f)
}

fn placeholder_needle(alias_letters: &str) -> String {
    format!("{}{}(", super::PLACEHOLDER_PREFIX, alias_letters)
}

/// Number of ingredient placeholders inside the join clause containing the
/// given placeholder; 0 when no join contains it.
pub fn count_ingredients_in_containing_join(query: &mut Query, alias_letters: &str) -> usize {
    let needle = placeholder_needle(alias_letters);
    let mut count = 0;
    try_on_joins(query, &mut |joins| {
        match joins.iter().find(|j| j.to_string().contains(&needle)) {
            Some(join) => {
                count = MANGLED_RE.find_iter(&join.to_string()).count();
                true
            }
            None => false,
        }
    });
    count
}

/// Replaces the whole `JOIN … ON …` clause containing the single ingredient
/// placeholder with the placeholder in join position, where the join clause
/// produced by the ingredient is later substituted.
pub fn replace_join_with_ingredient_single(
    query: &mut Query,
    alias_letters: &str,
) -> Result<bool> {
    let needle = placeholder_needle(alias_letters);
    // The sentinel relation is a bare table name, which parses in any
    // dialect; recover() turns the whole cross join back into `{{X()}}`.
    let sentinel = parse_joins(&format!(
        "CROSS JOIN {}{}",
        super::PLACEHOLDER_PREFIX,
        alias_letters
    ))?;
    let mut done = false;
    try_on_joins(query, &mut |joins| {
        match joins.iter().position(|j| j.to_string().contains(&needle)) {
            Some(idx) => {
                joins.splice(idx..idx + 1, sentinel.iter().cloned());
                done = true;
                true
            }
            None => false,
        }
    });
    Ok(done)
}

/// As [`replace_join_with_ingredient_single`], but the ON clause still holds
/// other, not-yet-executed ingredients. Those survive inside a sentinel
/// projection `SELECT "<uuid>", …` that the orchestrator strips from the
/// printed SQL; each surviving ingredient is dispatched (and rewritten) in a
/// later iteration.
pub fn replace_join_with_ingredient_multiple(
    query: &mut Query,
    alias_letters: &str,
    sentinel_uuid: &str,
) -> Result<bool> {
    let needle = placeholder_needle(alias_letters);
    let mut surviving: Vec<String> = Vec::new();
    let mut found = false;
    try_on_joins(query, &mut |joins| {
        match joins.iter().find(|j| j.to_string().contains(&needle)) {
            Some(join) => {
                if let Some(on_root) = top_level_exprs(join).into_iter().next() {
                    surviving = split_conjuncts(&on_root)
                        .iter()
                        .map(|e| e.to_string())
                        .filter(|t| !t.contains(&needle) && MANGLED_RE.is_match(t))
                        .collect();
                }
                found = true;
                true
            }
            None => false,
        }
    });
    if !found {
        return Ok(false);
    }
    let mut projection = vec![format!("\"{sentinel_uuid}\"")];
    projection.extend(surviving);
    let replacement = parse_joins(&format!(
        "CROSS JOIN {}{} CROSS JOIN (SELECT {})",
        super::PLACEHOLDER_PREFIX,
        alias_letters,
        projection.join(", ")
    ))?;
    try_on_joins(query, &mut |joins| {
        match joins.iter().position(|j| j.to_string().contains(&needle)) {
            Some(idx) => {
                joins.splice(idx..idx + 1, replacement.iter().cloned());
                true
            }
            None => false,
        }
    });
    Ok(true)
}

pub(crate) fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        Expr::Nested(inner) => split_conjuncts(inner),
        other => vec![other.clone()],
    }
}
