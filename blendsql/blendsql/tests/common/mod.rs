//! Shared fixtures: in-memory databases and deterministic ingredients that
//! stand in for model-backed implementations.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use blendsql::db::{quote_ident, quote_literal, value_to_text};
use blendsql::utils::get_tablename_colname;
use blendsql::{
    Error, Ingredient, IngredientCall, IngredientOutput, IngredientType, Result, SqliteBackend,
    Table, Value,
};

pub fn fruit_db() -> SqliteBackend {
    let db = SqliteBackend::in_memory().unwrap();
    db.connection()
        .execute_batch(
            "CREATE TABLE w (item TEXT);
             INSERT INTO w VALUES ('apple'), ('steel'), ('plum');",
        )
        .unwrap();
    db
}

pub fn numbers_db() -> SqliteBackend {
    let db = SqliteBackend::in_memory().unwrap();
    db.connection()
        .execute_batch(
            "CREATE TABLE t (x INTEGER);
             INSERT INTO t VALUES (1), (2), (3);",
        )
        .unwrap();
    db
}

pub fn names_db() -> SqliteBackend {
    let db = SqliteBackend::in_memory().unwrap();
    db.connection()
        .execute_batch(
            "CREATE TABLE L (name TEXT);
             INSERT INTO L VALUES ('jf'), ('bb');
             CREATE TABLE R (name TEXT);
             INSERT INTO R VALUES ('josh fields'), ('bob brown');",
        )
        .unwrap();
    db
}

/// Records the order ingredients fire in, shared across a blend call.
pub type RunLog = Rc<RefCell<Vec<String>>>;

pub fn run_log() -> RunLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// MAP ingredient mapping string values through a fixed table. Reads its
/// working set from the subquery temp table when one was materialized, and
/// aligns its output with the current base table, leaving unmapped rows
/// null.
pub struct ValueMap {
    pub name: String,
    pub mapping: HashMap<String, Value>,
    pub runs: Cell<usize>,
    pub values_passed: Cell<usize>,
    pub log: Option<RunLog>,
}

impl ValueMap {
    pub fn is_fruit() -> Self {
        ValueMap::new(
            "IsFruit",
            [
                ("apple", Value::Integer(1)),
                ("steel", Value::Integer(0)),
                ("plum", Value::Integer(1)),
            ],
        )
    }

    pub fn new<const N: usize>(name: &str, pairs: [(&str, Value); N]) -> Self {
        ValueMap {
            name: name.to_uppercase(),
            mapping: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            runs: Cell::new(0),
            values_passed: Cell::new(0),
            log: None,
        }
    }

    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl Ingredient for ValueMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn ingredient_type(&self) -> IngredientType {
        IngredientType::Map
    }

    fn num_values_passed(&self) -> usize {
        self.values_passed.get()
    }

    fn run(&self, call: &IngredientCall) -> Result<IngredientOutput> {
        self.runs.set(self.runs.get() + 1);
        if let Some(log) = &self.log {
            log.borrow_mut().push(self.name.clone());
        }
        let question = call
            .args
            .first()
            .cloned()
            .ok_or_else(|| Error::ingredient(&self.name, "missing question argument"))?;
        let reference = call
            .args
            .get(1)
            .ok_or_else(|| Error::ingredient(&self.name, "missing 'table::column' argument"))?;
        let (tablename, colname) = get_tablename_colname(reference)?;
        let tablename = call.resolve_tablename(&tablename).to_string();

        let subquery_table = call.temp_subquery_table(&tablename);
        let universe_from = if call.db.has_table(&subquery_table)? {
            subquery_table
        } else {
            tablename.clone()
        };
        let universe = call
            .db
            .execute_query(
                &format!(
                    "SELECT DISTINCT {} FROM {}",
                    quote_ident(&colname),
                    quote_ident(&universe_from)
                ),
                false,
            )?
            .column(&colname)
            .map(|values| values.into_iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        self.values_passed
            .set(self.values_passed.get() + universe.len());

        let session_table = call.temp_session_table(&tablename);
        let base_from = if call.db.has_table(&session_table)? {
            session_table
        } else {
            tablename.clone()
        };
        let base = call
            .db
            .execute_query(&format!("SELECT * FROM {}", quote_ident(&base_from)), false)?;
        let source = base
            .column(&colname)
            .ok_or_else(|| Error::ingredient(&self.name, format!("no column `{colname}`")))?;
        let mapped: Vec<Value> = source
            .iter()
            .map(|value| {
                if universe.iter().any(|u| u == *value) {
                    self.mapping
                        .get(&value_to_text(value))
                        .cloned()
                        .unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            })
            .collect();
        let mut table = Table::new(
            vec![colname.clone()],
            source.into_iter().map(|v| vec![v.clone()]).collect(),
        )?;
        table.push_column(&question, mapped)?;
        Ok(IngredientOutput::Map {
            new_col: question,
            tablename,
            source_col: colname,
            table,
        })
    }
}

/// QA ingredient: sums an integer column, counts a context table, or echoes
/// a constant, always as a quoted SQL literal.
pub enum QaBehavior {
    SumColumn,
    CountContext,
    Constant(String),
}

pub struct SimpleQa {
    pub name: String,
    pub behavior: QaBehavior,
    pub log: Option<RunLog>,
}

impl SimpleQa {
    pub fn sum(name: &str) -> Self {
        SimpleQa {
            name: name.to_uppercase(),
            behavior: QaBehavior::SumColumn,
            log: None,
        }
    }

    pub fn count(name: &str) -> Self {
        SimpleQa {
            name: name.to_uppercase(),
            behavior: QaBehavior::CountContext,
            log: None,
        }
    }

    pub fn constant(name: &str, answer: &str) -> Self {
        SimpleQa {
            name: name.to_uppercase(),
            behavior: QaBehavior::Constant(answer.to_string()),
            log: None,
        }
    }

    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl Ingredient for SimpleQa {
    fn name(&self) -> &str {
        &self.name
    }

    fn ingredient_type(&self) -> IngredientType {
        IngredientType::Qa
    }

    fn run(&self, call: &IngredientCall) -> Result<IngredientOutput> {
        if let Some(log) = &self.log {
            log.borrow_mut().push(self.name.clone());
        }
        let answer = match &self.behavior {
            QaBehavior::Constant(answer) => answer.clone(),
            QaBehavior::CountContext => {
                let context = call
                    .context
                    .as_ref()
                    .ok_or_else(|| Error::ingredient(&self.name, "expected a context table"))?;
                context.len().to_string()
            }
            QaBehavior::SumColumn => {
                let reference = call
                    .args
                    .get(1)
                    .ok_or_else(|| Error::ingredient(&self.name, "missing 'table::column'"))?;
                let (tablename, colname) = get_tablename_colname(reference)?;
                let tablename = call.resolve_tablename(&tablename).to_string();
                let table = call.db.execute_query(
                    &format!("SELECT * FROM {}", quote_ident(&tablename)),
                    false,
                )?;
                let total: i64 = table
                    .column(&colname)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| match v {
                                Value::Integer(i) => Some(*i),
                                _ => None,
                            })
                            .sum()
                    })
                    .unwrap_or(0);
                total.to_string()
            }
        };
        Ok(IngredientOutput::Scalar(quote_literal(&answer)))
    }
}

/// JOIN ingredient aligning left values to right values through a fixed
/// mapping, materialized as a session-scoped mapping table.
pub struct AlignJoin {
    pub name: String,
    pub mapping: HashMap<String, String>,
    pub values_passed: Cell<usize>,
    pub log: Option<RunLog>,
}

impl AlignJoin {
    pub fn names(name: &str) -> Self {
        AlignJoin::new(
            name,
            [("jf", "josh fields"), ("bb", "bob brown")],
        )
    }

    pub fn new<const N: usize>(name: &str, pairs: [(&str, &str); N]) -> Self {
        AlignJoin {
            name: name.to_uppercase(),
            mapping: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            values_passed: Cell::new(0),
            log: None,
        }
    }

    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl Ingredient for AlignJoin {
    fn name(&self) -> &str {
        &self.name
    }

    fn ingredient_type(&self) -> IngredientType {
        IngredientType::Join
    }

    fn num_values_passed(&self) -> usize {
        self.values_passed.get()
    }

    fn run(&self, call: &IngredientCall) -> Result<IngredientOutput> {
        if let Some(log) = &self.log {
            log.borrow_mut().push(self.name.clone());
        }
        let left_on = call
            .kwargs
            .get("left_on")
            .ok_or_else(|| Error::ingredient(&self.name, "missing left_on"))?;
        let right_on = call
            .kwargs
            .get("right_on")
            .ok_or_else(|| Error::ingredient(&self.name, "missing right_on"))?;
        let (left_table, left_col) = get_tablename_colname(left_on)?;
        let (right_table, right_col) = get_tablename_colname(right_on)?;
        let left_table = call.resolve_tablename(&left_table).to_string();
        let right_table = call.resolve_tablename(&right_table).to_string();

        let left_values = call
            .db
            .execute_query(
                &format!(
                    "SELECT {} FROM {}",
                    quote_ident(&left_col),
                    quote_ident(&left_table)
                ),
                false,
            )?
            .column(&left_col)
            .map(|values| values.iter().map(|v| value_to_text(v)).collect::<Vec<_>>())
            .unwrap_or_default();
        self.values_passed
            .set(self.values_passed.get() + left_values.len());

        let temp_join_table = format!("{}_jointable_{}", call.session_id, right_table);
        let rows: Vec<Vec<Value>> = left_values
            .iter()
            .filter_map(|left| {
                self.mapping.get(left).map(|right| {
                    vec![
                        Value::Text(left.clone()),
                        Value::Text(right.clone()),
                    ]
                })
            })
            .collect();
        let mapping_table = Table::new(
            vec!["left_value".to_string(), "right_value".to_string()],
            rows,
        )?;
        call.db.materialize(&temp_join_table, &mapping_table)?;

        let jt = quote_ident(&temp_join_table);
        let join_clause = format!(
            "JOIN {jt} ON {jt}.\"left_value\" = {}.{} JOIN {} ON {}.{} = {jt}.\"right_value\"",
            quote_ident(&left_table),
            quote_ident(&left_col),
            quote_ident(&right_table),
            quote_ident(&right_table),
            quote_ident(&right_col),
        );
        Ok(IngredientOutput::Join {
            left_table,
            right_table,
            join_clause,
            temp_join_table,
        })
    }
}

/// STRING-typed ingredient; the dispatch tiers never reach it.
pub struct RawString {
    pub name: String,
    pub runs: Cell<usize>,
}

impl RawString {
    pub fn new(name: &str) -> Self {
        RawString {
            name: name.to_uppercase(),
            runs: Cell::new(0),
        }
    }
}

impl Ingredient for RawString {
    fn name(&self) -> &str {
        &self.name
    }

    fn ingredient_type(&self) -> IngredientType {
        IngredientType::String
    }

    fn run(&self, _call: &IngredientCall) -> Result<IngredientOutput> {
        self.runs.set(self.runs.get() + 1);
        Ok(IngredientOutput::Scalar("'raw'".to_string()))
    }
}

/// Always fails; for verifying cleanup on error paths.
pub struct FailingMap {
    pub name: String,
}

impl FailingMap {
    pub fn new(name: &str) -> Self {
        FailingMap {
            name: name.to_uppercase(),
        }
    }
}

impl Ingredient for FailingMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn ingredient_type(&self) -> IngredientType {
        IngredientType::Map
    }

    fn run(&self, _call: &IngredientCall) -> Result<IngredientOutput> {
        Err(Error::ingredient(&self.name, "deliberate failure"))
    }
}

/// MAP that records the inferred example outputs it was handed.
pub struct RecordingMap {
    pub inner: ValueMap,
    pub seen_examples: RefCell<Option<Vec<String>>>,
    pub seen_map_columns: RefCell<Vec<String>>,
}

impl RecordingMap {
    pub fn new(inner: ValueMap) -> Self {
        RecordingMap {
            inner,
            seen_examples: RefCell::new(None),
            seen_map_columns: RefCell::new(Vec::new()),
        }
    }
}

impl Ingredient for RecordingMap {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn ingredient_type(&self) -> IngredientType {
        IngredientType::Map
    }

    fn run(&self, call: &IngredientCall) -> Result<IngredientOutput> {
        *self.seen_examples.borrow_mut() = call.example_outputs.clone();
        *self.seen_map_columns.borrow_mut() =
            call.prev_subquery_map_columns.iter().cloned().collect();
        self.inner.run(call)
    }
}

/// JOIN that records the map columns visible when it fired.
pub struct RecordingJoin {
    pub inner: AlignJoin,
    pub seen_map_columns: RefCell<Vec<String>>,
}

impl RecordingJoin {
    pub fn new(inner: AlignJoin) -> Self {
        RecordingJoin {
            inner,
            seen_map_columns: RefCell::new(Vec::new()),
        }
    }
}

impl Ingredient for RecordingJoin {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn ingredient_type(&self) -> IngredientType {
        IngredientType::Join
    }

    fn run(&self, call: &IngredientCall) -> Result<IngredientOutput> {
        *self.seen_map_columns.borrow_mut() =
            call.prev_subquery_map_columns.iter().cloned().collect();
        self.inner.run(call)
    }
}

/// Convenience: text contents of a single-column result.
pub fn text_column(table: &Table, column: &str) -> Vec<String> {
    table
        .column(column)
        .map(|values| values.iter().map(|v| value_to_text(v)).collect())
        .unwrap_or_default()
}

pub fn ingredients(list: Vec<Arc<dyn Ingredient>>) -> Vec<Arc<dyn Ingredient>> {
    list
}
