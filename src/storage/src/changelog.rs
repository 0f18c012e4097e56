// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The durable change log.
//!
//! An append-only SQLite table of [`ChangeEntry`]s keyed by
//! `(watermark, pos)`. Appends are atomic per transaction, which makes
//! retries idempotent: a primary-key collision on a transaction's entries
//! means the transaction was already durably persisted, and the caller must
//! treat the append as success (re-acknowledge upstream, skip the
//! broadcast).

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use lens_repr::LexiVersion;
use lens_storage_types::{ChangeEntry, Transaction};

const TABLE: &str = r#""_lens.change_log""#;

/// The durable, replayable log of committed transactions.
#[derive(Debug)]
pub struct ChangeLog {
    conn: Connection,
}

/// The result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The transaction was durably appended.
    Appended,
    /// The transaction was already in the log; the caller should
    /// re-acknowledge upstream and skip the broadcast.
    AlreadyPersisted,
}

/// A change log failure. Persistence failures are fatal to the streamer:
/// no acknowledgement may be sent for a transaction that did not reach the
/// log.
#[derive(Debug, thiserror::Error)]
pub enum ChangeLogError {
    /// The underlying store failed.
    #[error("change log store error")]
    Sqlite(#[from] rusqlite::Error),
    /// A persisted entry failed to encode or decode.
    #[error("change log encoding error")]
    Encoding(#[from] serde_json::Error),
}

impl ChangeLog {
    /// Opens (creating if necessary) the change log at `path`.
    pub fn open(path: &Path) -> Result<ChangeLog, ChangeLogError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "full")?;
        Self::init(conn)
    }

    /// Opens an in-memory change log, for tests.
    pub fn open_in_memory() -> Result<ChangeLog, ChangeLogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<ChangeLog, ChangeLogError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                watermark TEXT NOT NULL,
                pos INTEGER NOT NULL,
                change TEXT NOT NULL,
                PRIMARY KEY (watermark, pos)
            )",
        ))?;
        Ok(ChangeLog { conn })
    }

    /// Atomically appends one committed transaction's entries.
    pub fn append(&mut self, transaction: &Transaction) -> Result<AppendOutcome, ChangeLogError> {
        let entries = transaction.to_entries();
        let tx = self.conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                &format!("SELECT 1 FROM {TABLE} WHERE watermark = ? LIMIT 1"),
                params![transaction.watermark.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(AppendOutcome::AlreadyPersisted);
        }
        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {TABLE} (watermark, pos, change) VALUES (?, ?, ?)"
            ))?;
            for entry in &entries {
                match insert.execute(params![
                    entry.watermark.as_str(),
                    entry.pos as i64,
                    serde_json::to_string(&entry.change)?,
                ]) {
                    Ok(_) => {}
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        // Lost a race with an earlier incarnation of this
                        // same transaction.
                        return Ok(AppendOutcome::AlreadyPersisted);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tx.commit()?;
        Ok(AppendOutcome::Appended)
    }

    /// Streams back the transactions with watermark strictly beyond `from`,
    /// in watermark order.
    pub fn scan(&self, from: &LexiVersion) -> Result<Vec<Transaction>, ChangeLogError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT watermark, pos, change FROM {TABLE}
             WHERE watermark > ? ORDER BY watermark, pos"
        ))?;
        let rows = stmt.query_map(params![from.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (watermark, pos, change) = row?;
            entries.push(ChangeEntry {
                watermark: LexiVersion::parse(&watermark)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                pos: pos as u64,
                change: serde_json::from_str(&change)?,
            });
        }
        Ok(Transaction::from_entries(entries))
    }

    /// The watermark of the most recently appended transaction, if any.
    pub fn latest_watermark(&self) -> Result<Option<LexiVersion>, ChangeLogError> {
        let watermark: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT watermark FROM {TABLE} ORDER BY watermark DESC LIMIT 1"),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(watermark
            .map(|w| LexiVersion::parse(&w))
            .transpose()
            .map_err(|_| rusqlite::Error::InvalidQuery)?)
    }

    /// Deletes every entry with watermark strictly below `before`, once all
    /// subscribers have advanced past it. Returns the number of entries
    /// removed.
    pub fn purge_before(&mut self, before: &LexiVersion) -> Result<usize, ChangeLogError> {
        let n = self.conn.execute(
            &format!("DELETE FROM {TABLE} WHERE watermark < ?"),
            params![before.as_str()],
        )?;
        Ok(n)
    }
}
