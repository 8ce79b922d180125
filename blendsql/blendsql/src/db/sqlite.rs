//! SQLite implementation of the [`Backend`] trait over rusqlite.

use std::path::Path;

use rusqlite::{params_from_iter, Connection};

use super::{quote_ident, Backend, Table, Value};
use crate::{Error, Result};

pub struct SqliteBackend {
    conn: Connection,
    identifier: String,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let identifier = path.as_ref().display().to_string();
        Ok(SqliteBackend {
            conn: Connection::open(path)?,
            identifier,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(SqliteBackend {
            conn: Connection::open_in_memory()?,
            identifier: ":memory:".to_string(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn query(&self, sql: &str) -> Result<Table> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let column_count = columns.len();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                values.push(row.get::<_, Value>(idx)?);
            }
            out.push(values);
        }
        Table::new(columns, out)
    }
}

impl Backend for SqliteBackend {
    fn execute_query(&self, sql: &str, silence_errors: bool) -> Result<Table> {
        match self.query(sql) {
            Ok(table) => Ok(table),
            Err(error) if silence_errors => {
                log::warn!("silenced backend error for `{sql}`: {error}");
                Ok(Table::empty())
            }
            Err(error) => Err(error),
        }
    }

    fn materialize(&self, name: &str, table: &Table) -> Result<()> {
        let quoted = quote_ident(name);
        self.conn
            .execute(&format!("DROP TABLE IF EXISTS {quoted}"), [])?;
        let column_defs = table
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        if column_defs.is_empty() {
            return Err(Error::invariant(format!(
                "cannot materialize `{name}` without columns"
            )));
        }
        self.conn
            .execute(&format!("CREATE TABLE {quoted} ({column_defs})"), [])?;
        let placeholders = (1..=table.columns().len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut insert = self
            .conn
            .prepare(&format!("INSERT INTO {quoted} VALUES ({placeholders})"))?;
        for row in table.rows() {
            insert.execute(params_from_iter(row.iter()))?;
        }
        Ok(())
    }

    fn has_table(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn iter_columns(&self, name: &str) -> Result<Vec<String>> {
        let stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} LIMIT 0", quote_ident(name)))?;
        Ok(stmt.column_names().iter().map(|c| c.to_string()).collect())
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.conn
            .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])?;
        Ok(())
    }

    fn identifier(&self) -> String {
        self.identifier.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> SqliteBackend {
        let db = SqliteBackend::in_memory().unwrap();
        db.connection()
            .execute_batch(
                "CREATE TABLE w (item TEXT);
                 INSERT INTO w VALUES ('apple'), ('steel'), ('plum');",
            )
            .unwrap();
        db
    }

    #[test]
    fn test_execute_query_roundtrip() {
        let db = fixture();
        let table = db.execute_query("SELECT item FROM w ORDER BY item", false).unwrap();
        assert_eq!(table.columns(), ["item"]);
        assert_eq!(
            table.column("item").unwrap(),
            [
                &Value::Text("apple".to_string()),
                &Value::Text("plum".to_string()),
                &Value::Text("steel".to_string())
            ]
        );
    }

    #[test]
    fn test_silenced_errors_degrade_to_empty() {
        let db = fixture();
        assert!(db.execute_query("SELECT * FROM missing", false).is_err());
        let table = db.execute_query("SELECT * FROM missing", true).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_materialize_replaces() {
        let db = fixture();
        let table = db.execute_query("SELECT item FROM w", false).unwrap();
        db.materialize("scratch", &table).unwrap();
        db.materialize("scratch", &table).unwrap();
        assert!(db.has_table("scratch").unwrap());
        assert_eq!(db.iter_columns("scratch").unwrap(), ["item"]);
        assert_eq!(
            db.execute_query("SELECT COUNT(*) FROM scratch", false)
                .unwrap()
                .single_value(),
            Some(&Value::Integer(3))
        );
        db.drop_table("scratch").unwrap();
        assert!(!db.has_table("scratch").unwrap());
    }

    #[test]
    fn test_list_tables() {
        let db = fixture();
        assert_eq!(db.list_tables().unwrap(), ["w"]);
    }
}
