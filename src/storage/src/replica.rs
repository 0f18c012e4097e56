// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The local replica store.
//!
//! A SQLite mirror of the replicated upstream tables, written only by the
//! change streamer's apply path and read by view syncers. Every applied
//! transaction runs inside one SQLite transaction, stamps the rows it
//! writes with the commit watermark in `_0_version`, and records the
//! watermark in `_lens.replication_state`, so a crash can never leave the
//! replica between commits.
//!
//! Bookkeeping lives in the `_lens` namespace: the table registry
//! (`_lens.tables`), the replication state (`_lens.replication_state`), and
//! the storage schema version (`_lens.storage_schema_meta`).

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use lens_repr::{ColumnName, Datum, LexiVersion, RelationDesc, Row, ScalarType, VERSION_COLUMN};
use lens_storage_types::{Change, TableRef, Transaction};

const TABLES: &str = r#""_lens.tables""#;
const STATE: &str = r#""_lens.replication_state""#;
const SCHEMA_META: &str = r#""_lens.storage_schema_meta""#;

/// The version of the replica's own storage layout.
const STORAGE_SCHEMA_VERSION: i64 = 1;

/// The local embedded row store.
#[derive(Debug)]
pub struct Replica {
    conn: Connection,
    tables: BTreeMap<TableRef, RelationDesc>,
}

/// A replica store failure. Failures on the apply path are fatal to the
/// streamer.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// The underlying store failed.
    #[error("replica store error")]
    Sqlite(#[from] rusqlite::Error),
    /// A registered table description failed to encode or decode.
    #[error("replica schema encoding error")]
    Encoding(#[from] serde_json::Error),
    /// A change referenced a table the replica does not know.
    #[error("unknown table {0}")]
    UnknownTable(TableRef),
}

impl Replica {
    /// Opens (creating if necessary) the replica at `path`.
    pub fn open(path: &Path) -> Result<Replica, ReplicaError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        Self::init(conn)
    }

    /// Opens the replica read-only. View syncers use this; only the change
    /// streamer's apply path writes.
    pub fn open_read_only(path: &Path) -> Result<Replica, ReplicaError> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut tables = BTreeMap::new();
        {
            let mut stmt = conn.prepare(&format!("SELECT desc FROM {TABLES}"))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for desc in rows {
                let desc: RelationDesc = serde_json::from_str(&desc?)?;
                tables.insert(TableRef::from(&desc), desc);
            }
        }
        Ok(Replica { conn, tables })
    }

    /// Re-reads the table registry; view syncers call this after observing
    /// a schema change.
    pub fn reload_tables(&mut self) -> Result<(), ReplicaError> {
        let mut tables = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare(&format!("SELECT desc FROM {TABLES}"))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for desc in rows {
                let desc: RelationDesc = serde_json::from_str(&desc?)?;
                tables.insert(TableRef::from(&desc), desc);
            }
        }
        self.tables = tables;
        Ok(())
    }

    /// Opens an in-memory replica, for tests.
    pub fn open_in_memory() -> Result<Replica, ReplicaError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Replica, ReplicaError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLES} (
                name TEXT PRIMARY KEY,
                desc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {STATE} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {SCHEMA_META} (
                version INTEGER NOT NULL,
                max_version INTEGER NOT NULL,
                min_safe_rollback_version INTEGER NOT NULL
            );",
        ))?;
        let initialized: Option<i64> = conn
            .query_row(&format!("SELECT version FROM {SCHEMA_META}"), [], |row| {
                row.get(0)
            })
            .optional()?;
        if initialized.is_none() {
            conn.execute(
                &format!(
                    "INSERT INTO {SCHEMA_META} (version, max_version, min_safe_rollback_version)
                     VALUES (?, ?, ?)"
                ),
                params![STORAGE_SCHEMA_VERSION, STORAGE_SCHEMA_VERSION, 1],
            )?;
        }
        let mut tables = BTreeMap::new();
        {
            let mut stmt = conn.prepare(&format!("SELECT desc FROM {TABLES}"))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for desc in rows {
                let desc: RelationDesc = serde_json::from_str(&desc?)?;
                tables.insert(TableRef::from(&desc), desc);
            }
        }
        Ok(Replica { conn, tables })
    }

    /// The watermark of the initial snapshot this replica was seeded from.
    pub fn replica_version(&self) -> Result<Option<LexiVersion>, ReplicaError> {
        self.state("replica_version")
    }

    /// Records the snapshot watermark; called once at seeding time.
    pub fn set_replica_version(&mut self, version: &LexiVersion) -> Result<(), ReplicaError> {
        self.set_state("replica_version", version)
    }

    /// The watermark of the last applied transaction, if any.
    pub fn version(&self) -> Result<Option<LexiVersion>, ReplicaError> {
        self.state("version")
    }

    fn state(&self, key: &str) -> Result<Option<LexiVersion>, ReplicaError> {
        let value: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT value FROM {STATE} WHERE key = ?"),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value
            .map(|v| LexiVersion::parse(&v))
            .transpose()
            .map_err(|_| rusqlite::Error::InvalidQuery)?)
    }

    fn set_state(&mut self, key: &str, version: &LexiVersion) -> Result<(), ReplicaError> {
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO {STATE} (key, value) VALUES (?, ?)"),
            params![key, version.as_str()],
        )?;
        Ok(())
    }

    /// The registered tables.
    pub fn tables(&self) -> &BTreeMap<TableRef, RelationDesc> {
        &self.tables
    }

    /// Creates a table and registers its description. Used at snapshot
    /// seeding time and by DDL application.
    pub fn create_table(&mut self, desc: &RelationDesc) -> Result<(), ReplicaError> {
        let columns: Vec<String> = desc
            .columns()
            .iter()
            .map(|(name, ty)| {
                format!(
                    "{} {}{}",
                    quote_ident(name.as_str()),
                    sqlite_type(ty.scalar_type),
                    if ty.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();
        let key: Vec<String> = desc
            .key()
            .iter()
            .map(|c| quote_ident(c.as_str()))
            .collect();
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}",
            quote_table(&TableRef::from(desc)),
            columns.join(", "),
        );
        if !key.is_empty() {
            sql.push_str(&format!(", PRIMARY KEY ({})", key.join(", ")));
        }
        sql.push(')');
        self.conn.execute(&sql, [])?;
        self.register(desc)?;
        Ok(())
    }

    fn register(&mut self, desc: &RelationDesc) -> Result<(), ReplicaError> {
        let table = TableRef::from(desc);
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO {TABLES} (name, desc) VALUES (?, ?)"),
            params![table.to_string(), serde_json::to_string(desc)?],
        )?;
        self.tables.insert(table, desc.clone());
        Ok(())
    }

    /// Seeds one row outside of any replicated transaction, stamping it
    /// with the given version. Used by the initial snapshot copy.
    pub fn seed_row(
        &mut self,
        table: &TableRef,
        mut row: Row,
        version: &LexiVersion,
    ) -> Result<(), ReplicaError> {
        let desc = self
            .tables
            .get(table)
            .ok_or_else(|| ReplicaError::UnknownTable(table.clone()))?
            .clone();
        row.set_version(version);
        upsert(&self.conn, &desc, &row)?;
        Ok(())
    }

    /// Applies one committed transaction: all of its row changes and DDL,
    /// the `_0_version` stamps, and the replication state advance, in a
    /// single SQLite transaction.
    pub fn apply(&mut self, transaction: &Transaction) -> Result<(), ReplicaError> {
        self.conn.execute_batch("BEGIN")?;
        match self.apply_inner(transaction) {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn apply_inner(&mut self, transaction: &Transaction) -> Result<(), ReplicaError> {
        for change in &transaction.changes {
            self.apply_change(change, &transaction.watermark)?;
        }
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO {STATE} (key, value) VALUES ('version', ?)"),
            params![transaction.watermark.as_str()],
        )?;
        Ok(())
    }

    fn apply_change(
        &mut self,
        change: &Change,
        watermark: &LexiVersion,
    ) -> Result<(), ReplicaError> {
        match change {
            Change::Begin { .. } | Change::Commit { .. } => {}
            Change::Insert { table, row } => {
                let desc = self.desc(table)?.clone();
                let mut row = row.clone();
                row.set_version(watermark);
                upsert(&self.conn, &desc, &row)?;
            }
            Change::Update { table, old_key, row } => {
                let desc = self.desc(table)?.clone();
                let new_key = row.key(desc.key());
                let old_key = old_key.clone().unwrap_or_else(|| new_key.clone());
                // Merge over the stored row: with REPLICA IDENTITY DEFAULT
                // an update may omit unchanged TOAST columns.
                let mut merged = self
                    .get_row_inner(&desc, &old_key)?
                    .unwrap_or_else(Row::new);
                if old_key != new_key {
                    delete(&self.conn, &desc, &old_key)?;
                }
                for (name, datum) in row.iter() {
                    merged.set(name.clone(), datum.clone());
                }
                merged.set_version(watermark);
                upsert(&self.conn, &desc, &merged)?;
            }
            Change::Delete { table, key } => {
                let desc = self.desc(table)?.clone();
                delete(&self.conn, &desc, key)?;
            }
            Change::Truncate { tables } => {
                for table in tables {
                    let desc = self.desc(table)?.clone();
                    self.conn
                        .execute(&format!("DELETE FROM {}", quote_table(&TableRef::from(&desc))), [])?;
                }
            }
            Change::Relation { desc } => {
                self.apply_relation(desc)?;
            }
            Change::CreateTable { desc } => {
                self.create_table(desc)?;
            }
            Change::DropTable { table } => {
                self.conn
                    .execute(&format!("DROP TABLE IF EXISTS {}", quote_table(table)), [])?;
                self.conn.execute(
                    &format!("DELETE FROM {TABLES} WHERE name = ?"),
                    params![table.to_string()],
                )?;
                self.tables.remove(table);
            }
            Change::AddColumn { table, column, ty } => {
                self.conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        quote_table(table),
                        quote_ident(column.as_str()),
                        sqlite_type(ty.scalar_type),
                    ),
                    [],
                )?;
                let mut desc = self.desc(table)?.clone();
                desc.columns_mut()
                    .push((column.clone(), ty.clone()));
                self.register(&desc)?;
            }
            Change::DropColumn { table, column } => {
                self.conn.execute(
                    &format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        quote_table(table),
                        quote_ident(column.as_str()),
                    ),
                    [],
                )?;
                let mut desc = self.desc(table)?.clone();
                desc.columns_mut().retain(|(name, _)| name != column);
                self.register(&desc)?;
            }
            Change::UpdateColumn {
                table,
                old,
                column,
                ty,
            } => {
                if old != column {
                    self.conn.execute(
                        &format!(
                            "ALTER TABLE {} RENAME COLUMN {} TO {}",
                            quote_table(table),
                            quote_ident(old.as_str()),
                            quote_ident(column.as_str()),
                        ),
                        [],
                    )?;
                }
                let mut desc = self.desc(table)?.clone();
                for (name, existing) in desc.columns_mut() {
                    if name == old {
                        *name = column.clone();
                        *existing = ty.clone();
                    }
                }
                self.register(&desc)?;
            }
            Change::CreateIndex { table, index } => {
                let columns: Vec<String> = index
                    .columns
                    .iter()
                    .map(|(c, order)| {
                        format!(
                            "{} {}",
                            quote_ident(c.as_str()),
                            match order {
                                lens_repr::SortOrder::Asc => "ASC",
                                lens_repr::SortOrder::Desc => "DESC",
                            }
                        )
                    })
                    .collect();
                self.conn.execute(
                    &format!(
                        "CREATE {} INDEX IF NOT EXISTS {} ON {} ({})",
                        if index.unique { "UNIQUE" } else { "" },
                        quote_ident(&format!("{}.{}", table.schema, index.name)),
                        quote_table(table),
                        columns.join(", "),
                    ),
                    [],
                )?;
                let mut desc = self.desc(table)?.clone();
                desc.indexes.retain(|i| i.name != index.name);
                desc.indexes.push(index.clone());
                self.register(&desc)?;
            }
            Change::DropIndex { schema, name } => {
                self.conn.execute(
                    &format!(
                        "DROP INDEX IF EXISTS {}",
                        quote_ident(&format!("{schema}.{name}"))
                    ),
                    [],
                )?;
                let tables = self.tables.clone();
                for desc in tables.values() {
                    if desc.schema == *schema && desc.indexes.iter().any(|i| i.name == *name) {
                        let mut desc = desc.clone();
                        desc.indexes.retain(|i| i.name != *name);
                        self.register(&desc)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconciles an upstream `Relation` message against the registered
    /// description: unknown tables are created, added and removed columns
    /// are applied as ALTERs.
    fn apply_relation(&mut self, desc: &RelationDesc) -> Result<(), ReplicaError> {
        let table = TableRef::from(desc);
        let Some(existing) = self.tables.get(&table).cloned() else {
            debug!(%table, "registering newly published table");
            return self.create_table(desc);
        };
        for (name, ty) in desc.columns() {
            if !existing.has_column(name.as_str()) {
                self.apply_change(
                    &Change::AddColumn {
                        table: table.clone(),
                        column: name.clone(),
                        ty: ty.clone(),
                    },
                    &LexiVersion::min(),
                )?;
            }
        }
        for (name, _) in existing.columns() {
            if !desc.has_column(name.as_str()) {
                self.apply_change(
                    &Change::DropColumn {
                        table: table.clone(),
                        column: name.clone(),
                    },
                    &LexiVersion::min(),
                )?;
            }
        }
        // Adopt the upstream ordering and key wholesale.
        self.register(desc)?;
        Ok(())
    }

    fn desc(&self, table: &TableRef) -> Result<&RelationDesc, ReplicaError> {
        self.tables
            .get(table)
            .ok_or_else(|| ReplicaError::UnknownTable(table.clone()))
    }

    /// Reads one row by primary key.
    pub fn get_row(&self, table: &TableRef, key: &[Datum]) -> Result<Option<Row>, ReplicaError> {
        let desc = self.desc(table)?;
        self.get_row_inner(desc, key)
    }

    fn get_row_inner(
        &self,
        desc: &RelationDesc,
        key: &[Datum],
    ) -> Result<Option<Row>, ReplicaError> {
        let predicate: Vec<String> = desc
            .key()
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c.as_str())))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            select_list(desc),
            quote_table(&TableRef::from(desc)),
            predicate.join(" AND "),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(key.iter().map(datum_to_sql));
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => Ok(Some(row_from_sqlite(desc, row)?)),
            None => Ok(None),
        }
    }

    /// Reads a full table in primary key order, for query hydration.
    pub fn scan_table(&self, table: &TableRef) -> Result<Vec<Row>, ReplicaError> {
        let desc = self.desc(table)?;
        let key: Vec<String> = desc
            .key()
            .iter()
            .map(|c| quote_ident(c.as_str()))
            .collect();
        let mut sql = format!("SELECT {} FROM {}", select_list(desc), quote_table(table));
        if !key.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", key.join(", ")));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_from_sqlite(desc, row)?);
        }
        Ok(out)
    }
}

fn upsert(conn: &Connection, desc: &RelationDesc, row: &Row) -> Result<(), ReplicaError> {
    let columns: Vec<&ColumnName> = row.iter().map(|(name, _)| name).collect();
    let names: Vec<String> = columns
        .iter()
        .map(|c| quote_ident(c.as_str()))
        .collect();
    let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        quote_table(&TableRef::from(desc)),
        names.join(", "),
        placeholders.join(", "),
    );
    let params = rusqlite::params_from_iter(row.iter().map(|(_, d)| datum_to_sql(d)));
    conn.execute(&sql, params)?;
    Ok(())
}

fn delete(conn: &Connection, desc: &RelationDesc, key: &[Datum]) -> Result<(), ReplicaError> {
    let predicate: Vec<String> = desc
        .key()
        .iter()
        .map(|c| format!("{} = ?", quote_ident(c.as_str())))
        .collect();
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_table(&TableRef::from(desc)),
        predicate.join(" AND "),
    );
    conn.execute(&sql, rusqlite::params_from_iter(key.iter().map(datum_to_sql)))?;
    Ok(())
}

/// Columns in registry order; an upstream `Relation` may register an order
/// that differs from the physical SQLite order, so `SELECT *` is never
/// used.
fn select_list(desc: &RelationDesc) -> String {
    desc.columns()
        .iter()
        .map(|(name, _)| quote_ident(name.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quote_table(table: &TableRef) -> String {
    quote_ident(&format!("{}.{}", table.schema, table.name))
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sqlite_type(ty: ScalarType) -> &'static str {
    match ty {
        ScalarType::Bool | ScalarType::Int8 => "INTEGER",
        ScalarType::Float8 => "REAL",
        ScalarType::Text => "TEXT",
        ScalarType::Bytea => "BLOB",
    }
}

fn datum_to_sql(datum: &Datum) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match datum {
        Datum::Null => Value::Null,
        Datum::Bool(b) => Value::Integer(i64::from(*b)),
        Datum::Int(i) => Value::Integer(*i),
        Datum::Double(d) => Value::Real(*d),
        Datum::String(s) => Value::Text(s.clone()),
        Datum::Bytes(b) => Value::Blob(b.clone()),
        // Arrays never reach the replica; encode defensively as JSON text.
        Datum::Array(_) => Value::Text(
            serde_json::to_string(datum).unwrap_or_default(),
        ),
    }
}

fn row_from_sqlite(desc: &RelationDesc, row: &rusqlite::Row<'_>) -> Result<Row, ReplicaError> {
    let mut out = Row::new();
    for (i, (name, ty)) in desc.columns().iter().enumerate() {
        let value = row.get_ref(i)?;
        let datum = match (value, ty.scalar_type) {
            (ValueRef::Null, _) => Datum::Null,
            (ValueRef::Integer(v), ScalarType::Bool) => Datum::Bool(v != 0),
            (ValueRef::Integer(v), _) => Datum::Int(v),
            (ValueRef::Real(v), _) => Datum::Double(v),
            (ValueRef::Text(v), _) => {
                Datum::String(String::from_utf8_lossy(v).into_owned())
            }
            (ValueRef::Blob(v), _) => Datum::Bytes(v.to_vec()),
        };
        out.set(name.clone(), datum);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issues_desc() -> RelationDesc {
        RelationDesc::new("public", "issues")
            .with_column("id", ScalarType::Text, false)
            .with_column("title", ScalarType::Text, true)
            .with_column("big", ScalarType::Int8, true)
            .with_column(VERSION_COLUMN, ScalarType::Text, false)
            .with_key(vec!["id".into()])
    }

    fn issue(id: &str, title: &str) -> Row {
        let mut r = Row::new();
        r.set("id", id);
        r.set("title", title);
        r.set("big", 1i64);
        r
    }

    fn replica() -> Replica {
        let mut r = Replica::open_in_memory().unwrap();
        r.create_table(&issues_desc()).unwrap();
        r.set_replica_version(&LexiVersion::from_lsn(1)).unwrap();
        r
    }

    fn table() -> TableRef {
        TableRef::new("public", "issues")
    }

    #[test]
    fn apply_stamps_versions() {
        let mut r = replica();
        let w = LexiVersion::from_lsn(7);
        r.apply(&Transaction {
            watermark: w.clone(),
            changes: vec![Change::Insert {
                table: table(),
                row: issue("1", "hello"),
            }],
        })
        .unwrap();
        let row = r.get_row(&table(), &[Datum::String("1".into())]).unwrap().unwrap();
        assert_eq!(row.version(), Some(w.clone()));
        assert_eq!(r.version().unwrap(), Some(w));
    }

    #[test]
    fn update_merges_partial_rows() {
        let mut r = replica();
        r.apply(&Transaction {
            watermark: LexiVersion::from_lsn(7),
            changes: vec![Change::Insert {
                table: table(),
                row: issue("1", "hello"),
            }],
        })
        .unwrap();
        // An update carrying only the changed column keeps the others.
        let mut partial = Row::new();
        partial.set("id", "1");
        partial.set("title", "world");
        r.apply(&Transaction {
            watermark: LexiVersion::from_lsn(8),
            changes: vec![Change::Update {
                table: table(),
                old_key: None,
                row: partial,
            }],
        })
        .unwrap();
        let row = r.get_row(&table(), &[Datum::String("1".into())]).unwrap().unwrap();
        assert_eq!(row.datum("title"), Datum::String("world".into()));
        assert_eq!(row.datum("big"), Datum::Int(1));
        assert_eq!(row.version(), Some(LexiVersion::from_lsn(8)));
    }

    #[test]
    fn key_change_moves_the_row() {
        let mut r = replica();
        r.apply(&Transaction {
            watermark: LexiVersion::from_lsn(7),
            changes: vec![Change::Insert {
                table: table(),
                row: issue("1", "hello"),
            }],
        })
        .unwrap();
        r.apply(&Transaction {
            watermark: LexiVersion::from_lsn(8),
            changes: vec![Change::Update {
                table: table(),
                old_key: Some(vec![Datum::String("1".into())]),
                row: issue("99", "hello"),
            }],
        })
        .unwrap();
        assert!(r.get_row(&table(), &[Datum::String("1".into())]).unwrap().is_none());
        assert!(r.get_row(&table(), &[Datum::String("99".into())]).unwrap().is_some());
    }

    #[test]
    fn relation_diff_applies_ddl() {
        let mut r = replica();
        let altered = RelationDesc::new("public", "issues")
            .with_column("id", ScalarType::Text, false)
            .with_column("big", ScalarType::Int8, true)
            .with_column("assignee", ScalarType::Text, true)
            .with_column(VERSION_COLUMN, ScalarType::Text, false)
            .with_key(vec!["id".into()]);
        r.apply(&Transaction {
            watermark: LexiVersion::from_lsn(9),
            changes: vec![Change::Relation { desc: altered }],
        })
        .unwrap();
        let desc = r.tables().get(&table()).unwrap();
        assert!(desc.has_column("assignee"));
        assert!(!desc.has_column("title"));
    }

    #[test]
    fn truncate_empties_the_table() {
        let mut r = replica();
        r.apply(&Transaction {
            watermark: LexiVersion::from_lsn(7),
            changes: vec![
                Change::Insert { table: table(), row: issue("1", "a") },
                Change::Insert { table: table(), row: issue("2", "b") },
            ],
        })
        .unwrap();
        assert_eq!(r.scan_table(&table()).unwrap().len(), 2);
        r.apply(&Transaction {
            watermark: LexiVersion::from_lsn(8),
            changes: vec![Change::Truncate { tables: vec![table()] }],
        })
        .unwrap();
        assert!(r.scan_table(&table()).unwrap().is_empty());
    }

    #[test]
    fn scan_returns_key_order() {
        let mut r = replica();
        r.apply(&Transaction {
            watermark: LexiVersion::from_lsn(7),
            changes: vec![
                Change::Insert { table: table(), row: issue("2", "b") },
                Change::Insert { table: table(), row: issue("1", "a") },
            ],
        })
        .unwrap();
        let rows = r.scan_table(&table()).unwrap();
        assert_eq!(rows[0].datum("id"), Datum::String("1".into()));
        assert_eq!(rows[1].datum("id"), Datum::String("2".into()));
    }
}
