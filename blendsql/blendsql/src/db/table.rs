//! A small in-memory relational table, the interchange type between the
//! backend, the orchestrator, and ingredient implementations.

use itertools::Itertools;

pub use rusqlite::types::Value;

use crate::{Error, Result};

/// Column-named, row-major table of SQLite values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        if let Some(row) = rows.iter().find(|r| r.len() != columns.len()) {
            return Err(Error::invariant(format!(
                "row arity {} does not match {} columns",
                row.len(),
                columns.len()
            )));
        }
        Ok(Table { columns, rows })
    }

    pub fn empty() -> Self {
        Table::default()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// The single cell of a one-row, one-column result.
    pub fn single_value(&self) -> Option<&Value> {
        match (self.rows.len(), self.columns.len()) {
            (1, 1) => Some(&self.rows[0][0]),
            _ => None,
        }
    }

    pub fn remove_column(&mut self, name: &str) {
        if let Some(idx) = self.column_index(name) {
            self.columns.remove(idx);
            for row in &mut self.rows {
                row.remove(idx);
            }
        }
    }

    pub fn retain_columns(&mut self, mut keep: impl FnMut(&str) -> bool) {
        let kept: Vec<usize> = (0..self.columns.len())
            .filter(|&i| keep(&self.columns[i]))
            .collect();
        self.columns = kept.iter().map(|&i| self.columns[i].clone()).collect();
        self.rows = self
            .rows
            .iter()
            .map(|row| kept.iter().map(|&i| row[i].clone()).collect())
            .collect();
    }

    /// Appends a column; the value count must match the row count (on an
    /// empty table the column defines it).
    pub fn push_column(&mut self, name: &str, values: Vec<Value>) -> Result<()> {
        if self.columns.is_empty() && self.rows.is_empty() {
            self.columns.push(name.to_string());
            self.rows = values.into_iter().map(|v| vec![v]).collect();
            return Ok(());
        }
        if values.len() != self.rows.len() {
            return Err(Error::invariant(format!(
                "column `{name}` has {} values for {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Column-wise concatenation; all tables must have the same row count and
    /// a repeated column name keeps its first occurrence.
    pub fn concat_columns(tables: &[Table]) -> Result<Table> {
        let Some(first) = tables.first() else {
            return Ok(Table::empty());
        };
        if !tables.iter().map(|t| t.len()).all_equal() {
            return Err(Error::invariant(
                "map outputs disagree on row count".to_string(),
            ));
        }
        let mut out = Table {
            columns: Vec::new(),
            rows: vec![Vec::new(); first.len()],
        };
        for table in tables {
            for (idx, column) in table.columns.iter().enumerate() {
                if out.has_column(column) {
                    continue;
                }
                out.columns.push(column.clone());
                for (row, source) in out.rows.iter_mut().zip(&table.rows) {
                    row.push(source[idx].clone());
                }
            }
        }
        Ok(out)
    }

    /// Fills nulls of `column` with the same column of `other`, row by row.
    pub fn fill_nulls_from(&mut self, column: &str, other: &Table) -> Result<()> {
        let (Some(own), Some(theirs)) = (self.column_index(column), other.column_index(column))
        else {
            return Ok(());
        };
        if self.len() != other.len() {
            return Err(Error::invariant(format!(
                "cannot coalesce `{column}` across tables of {} and {} rows",
                self.len(),
                other.len()
            )));
        }
        for (row, source) in self.rows.iter_mut().zip(&other.rows) {
            if row[own] == Value::Null {
                row[own] = source[theirs].clone();
            }
        }
        Ok(())
    }

    /// Row-index-aligned column merge: every row of `self` is extended with
    /// the corresponding row of `other`.
    pub fn hstack(&self, other: &Table) -> Result<Table> {
        if self.len() != other.len() {
            return Err(Error::invariant(format!(
                "row index mismatch merging tables of {} and {} rows",
                self.len(),
                other.len()
            )));
        }
        let mut out = self.clone();
        for (idx, column) in other.columns.iter().enumerate() {
            out.columns.push(column.clone());
            for (row, source) in out.rows.iter_mut().zip(&other.rows) {
                row.push(source[idx].clone());
            }
        }
        Ok(out)
    }
}

/// Renders a value the way SQLite would when selected as text.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table(columns: &[&str], rows: &[&[i64]]) -> Table {
        Table::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|&v| Value::Integer(v)).collect())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_arity_checked() {
        let err = Table::new(
            vec!["a".to_string()],
            vec![vec![Value::Integer(1), Value::Integer(2)]],
        );
        assert!(matches!(err, Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn test_concat_drops_duplicate_columns() {
        let a = table(&["x", "y"], &[&[1, 2], &[3, 4]]);
        let b = table(&["y", "z"], &[&[9, 5], &[9, 6]]);
        let out = Table::concat_columns(&[a, b]).unwrap();
        assert_eq!(out.columns(), ["x", "y", "z"]);
        assert_eq!(out.column("y").unwrap(), [&Value::Integer(2), &Value::Integer(4)]);
    }

    #[test]
    fn test_concat_rejects_ragged_inputs() {
        let a = table(&["x"], &[&[1]]);
        let b = table(&["y"], &[&[1], &[2]]);
        assert!(Table::concat_columns(&[a, b]).is_err());
    }

    #[test]
    fn test_fill_nulls_from() {
        let mut a = Table::new(
            vec!["x".to_string()],
            vec![vec![Value::Null], vec![Value::Integer(2)]],
        )
        .unwrap();
        let b = table(&["x"], &[&[7], &[8]]);
        a.fill_nulls_from("x", &b).unwrap();
        assert_eq!(a.column("x").unwrap(), [&Value::Integer(7), &Value::Integer(2)]);
    }

    #[test]
    fn test_hstack_requires_aligned_indices() {
        let a = table(&["x"], &[&[1], &[2]]);
        let b = table(&["y"], &[&[3]]);
        assert!(a.hstack(&b).is_err());
        let c = table(&["y"], &[&[3], &[4]]);
        let merged = a.hstack(&c).unwrap();
        assert_eq!(merged.columns(), ["x", "y"]);
        assert_eq!(merged.rows()[1], [Value::Integer(2), Value::Integer(4)]);
    }
}
