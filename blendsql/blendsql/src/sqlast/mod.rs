//! Dialect-aware SQL parse/print layer.
//!
//! Wraps the `sqlparser` AST with an SQLite dialect. Ingredient placeholders
//! like `{{A()}}` cannot survive a SQL tokenizer, so before parsing they are
//! *mangled* into internal function calls (`_blend_A()`), which ride through
//! the parser as opaque expressions; printing goes through [`recover`], which
//! restores the placeholder text — including placeholders the join transforms
//! left in join position. Round-tripping therefore preserves placeholders
//! verbatim.

pub mod transforms;

use core::ops::ControlFlow;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    visit_relations, Expr, ObjectName, ObjectNamePart, Query, Select, SetExpr, Statement,
    TableFactor, Visit, Visitor,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::{Error, Result};

/// Internal spelling of a placeholder alias inside the parsed AST.
pub(crate) const PLACEHOLDER_PREFIX: &str = "_blend_";

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([A-Z]+)\(\)\}\}").unwrap());
pub(crate) static MANGLED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_blend_([A-Z]+)\(\)").unwrap());
static MANGLED_JOIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CROSS JOIN _blend_([A-Z]+)").unwrap());

/// `{{A()}}` → `_blend_A()`, so the SQL parser sees a plain function call.
pub fn mangle(text: &str) -> String {
    PLACEHOLDER_RE.replace_all(text, "_blend_${1}()").into_owned()
}

/// Undoes [`mangle`] on printed SQL. Join-position placeholders — left
/// behind by the join transforms as sentinel cross joins against a bare
/// `_blend_X` table — recover too, so the `CROSS JOIN` spelling never
/// leaks into query text.
pub fn recover(text: &str) -> String {
    let text = MANGLED_RE.replace_all(text, "{{${1}()}}");
    MANGLED_JOIN_RE.replace_all(&text, "{{${1}()}}").into_owned()
}

pub fn parse_statement(text: &str) -> Result<Statement> {
    let sql = mangle(text);
    let mut statements = Parser::parse_sql(&SQLiteDialect {}, &sql)
        .map_err(|e| Error::invalid_query(format!("{e}")))?;
    if statements.len() != 1 {
        return Err(Error::invalid_query(format!(
            "expected a single statement, found {}",
            statements.len()
        )));
    }
    Ok(statements.pop().expect("length checked"))
}

/// Accepts only SELECT-family statements; everything else would mutate
/// database state and is rejected up front.
pub fn require_query(statement: Statement) -> Result<Query> {
    match statement {
        Statement::Query(query) => Ok(*query),
        other => Err(Error::invalid_query(format!(
            "{} statements are not allowed",
            statement_kind(&other)
        ))),
    }
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert(_) => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::AlterTable { .. } => "ALTER",
        Statement::CreateTable(_) | Statement::CreateView { .. } => "CREATE",
        _ => "non-query",
    }
}

pub fn parse_query(text: &str) -> Result<Query> {
    require_query(parse_statement(text)?)
}

pub fn print_statement(statement: &Statement) -> String {
    recover(&statement.to_string())
}

pub fn print_query(query: &Query) -> String {
    recover(&query.to_string())
}

pub fn print_expr(expr: &Expr) -> String {
    recover(&expr.to_string())
}

/// The unquoted name of a (possibly qualified) object reference.
pub(crate) fn object_name_ident(name: &ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.clone()),
        _ => None,
    })
}

/// All base-table names under `node`, first occurrence order, placeholders
/// excluded.
pub(crate) fn collect_table_names<V: Visit>(node: &V) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let _ = visit_relations(node, |name: &ObjectName| {
        if let Some(ident) = object_name_ident(name) {
            if !ident.starts_with(PLACEHOLDER_PREFIX) && !names.contains(&ident) {
                names.push(ident);
            }
        }
        ControlFlow::<()>::Continue(())
    });
    names
}

/// Collects the queries sitting directly under a node, without descending
/// into them.
struct ChildQueryCollector {
    depth: usize,
    queries: Vec<Query>,
}

impl Visitor for ChildQueryCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if self.depth == 0 {
            self.queries.push(query.clone());
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<()> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }
}

pub(crate) fn child_queries<V: Visit>(node: &V) -> Vec<Query> {
    let mut collector = ChildQueryCollector {
        depth: 0,
        queries: Vec::new(),
    };
    let _ = node.visit(&mut collector);
    collector.queries
}

/// Collects the outermost expressions of a node (e.g. the ON condition of a
/// join), without descending into them.
struct TopExprCollector {
    depth: usize,
    exprs: Vec<Expr>,
}

impl Visitor for TopExprCollector {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if self.depth == 0 {
            self.exprs.push(expr.clone());
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, _expr: &Expr) -> ControlFlow<()> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }
}

pub(crate) fn top_level_exprs<V: Visit>(node: &V) -> Vec<Expr> {
    let mut collector = TopExprCollector {
        depth: 0,
        exprs: Vec::new(),
    };
    let _ = node.visit(&mut collector);
    collector.exprs
}

/// True when any subquery sits somewhere under `node`.
struct QueryProbe;

impl Visitor for QueryProbe {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<()> {
        ControlFlow::Break(())
    }
}

pub(crate) fn contains_query<V: Visit>(node: &V) -> bool {
    node.visit(&mut QueryProbe).is_break()
}

pub(crate) fn query_contains_select(query: &Query) -> bool {
    fn in_set_expr(body: &SetExpr) -> bool {
        match body {
            SetExpr::Select(_) => true,
            SetExpr::Query(query) => in_set_expr(&query.body),
            SetExpr::SetOperation { left, right, .. } => in_set_expr(left) || in_set_expr(right),
            _ => false,
        }
    }
    in_set_expr(&query.body)
        || query
            .with
            .as_ref()
            .is_some_and(|with| with.cte_tables.iter().any(|cte| query_contains_select(&cte.query)))
}

/// Builds a table factor by parsing, so no versioned struct literals are
/// spelled out here. `name` must arrive already quoted/escaped.
pub(crate) fn parse_table_factor(name: &str) -> Result<TableFactor> {
    let query = parse_query(&format!("SELECT * FROM {name}"))?;
    match *query.body {
        SetExpr::Select(select) => select
            .from
            .into_iter()
            .next()
            .map(|t| t.relation)
            .ok_or_else(|| Error::invariant("synthesized select has no FROM".to_string())),
        _ => Err(Error::invariant(
            "synthesized select did not parse to a SELECT".to_string(),
        )),
    }
}

/// Parses a join fragment (`CROSS JOIN …`, `JOIN … ON …`) into join nodes.
pub(crate) fn parse_joins(fragment: &str) -> Result<Vec<sqlparser::ast::Join>> {
    let query = parse_query(&format!("SELECT * FROM _t {fragment}"))?;
    match *query.body {
        SetExpr::Select(select) => Ok(select
            .from
            .into_iter()
            .next()
            .map(|t| t.joins)
            .unwrap_or_default()),
        _ => Err(Error::invariant(
            "synthesized join fragment did not parse to a SELECT".to_string(),
        )),
    }
}

/// One subquery discovered in a parsed query, snapshot as text. Collected
/// pre-order; the orchestrator walks the reverse, so the deepest work
/// happens first and the root comes last.
#[derive(Debug, Clone)]
pub struct SubqueryInfo {
    /// Printed (placeholder-recovered) SQL of this subquery.
    pub text: String,
    /// Set when this subquery is the body of a CTE binding.
    pub cte_alias: Option<String>,
    /// Base tables of the nearest enclosing SELECT; empty at the root.
    pub parent_tables: Vec<String>,
    /// Whether the subquery body is a plain SELECT.
    pub is_select: bool,
}

pub fn collect_subqueries(root: &Query) -> Vec<SubqueryInfo> {
    let mut out = Vec::new();
    collect_query(root, &[], None, &mut out);
    out
}

fn collect_query(
    query: &Query,
    parent_tables: &[String],
    cte_alias: Option<String>,
    out: &mut Vec<SubqueryInfo>,
) {
    out.push(SubqueryInfo {
        text: print_query(query),
        cte_alias,
        parent_tables: parent_tables.to_vec(),
        is_select: matches!(query.body.as_ref(), SetExpr::Select(_)),
    });
    let own_tables = collect_table_names(query);
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(
                &cte.query,
                &own_tables,
                Some(cte.alias.name.value.clone()),
                out,
            );
        }
    }
    collect_set_expr(&query.body, &own_tables, out);
}

fn collect_set_expr(body: &SetExpr, enclosing_tables: &[String], out: &mut Vec<SubqueryInfo>) {
    match body {
        SetExpr::Select(select) => collect_select(select, out),
        SetExpr::Query(query) => collect_query(query, enclosing_tables, None, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, enclosing_tables, out);
            collect_set_expr(right, enclosing_tables, out);
        }
        _ => {}
    }
}

fn collect_select(select: &Select, out: &mut Vec<SubqueryInfo>) {
    let own_tables = collect_table_names(select);
    for table in &select.from {
        collect_table_factor(&table.relation, &own_tables, out);
        for join in &table.joins {
            collect_table_factor(&join.relation, &own_tables, out);
        }
    }
    let mut exprs: Vec<&Expr> = Vec::new();
    for item in &select.projection {
        match item {
            sqlparser::ast::SelectItem::UnnamedExpr(expr)
            | sqlparser::ast::SelectItem::ExprWithAlias { expr, .. } => exprs.push(expr),
            _ => {}
        }
    }
    exprs.extend(select.selection.iter());
    exprs.extend(select.having.iter());
    for expr in exprs {
        for child in child_queries(expr) {
            collect_query(&child, &own_tables, None, out);
        }
    }
}

fn collect_table_factor(factor: &TableFactor, enclosing: &[String], out: &mut Vec<SubqueryInfo>) {
    match factor {
        TableFactor::Derived { subquery, .. } => collect_query(subquery, enclosing, None, out),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_table_factor(&table_with_joins.relation, enclosing, out);
            for join in &table_with_joins.joins {
                collect_table_factor(&join.relation, enclosing, out);
            }
        }
        _ => {}
    }
}
