// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The typed change stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use lens_repr::{ColumnName, ColumnType, Datum, IndexDesc, LexiVersion, RelationDesc, Row};

/// A reference to an upstream relation: `(schema_name, table_name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// The schema containing the relation.
    pub schema: String,
    /// The relation name.
    pub name: String,
}

impl TableRef {
    /// Creates a table reference.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableRef {
        TableRef {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl From<&RelationDesc> for TableRef {
    fn from(desc: &RelationDesc) -> TableRef {
        TableRef::new(desc.schema.clone(), desc.name.clone())
    }
}

/// A single decoded change from the upstream replication stream.
///
/// Data changes between a `Begin` and its `Commit` belong to one upstream
/// transaction; every row they touch is stamped with the transaction's
/// commit watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum Change {
    /// Opens a transaction.
    Begin {
        /// The watermark the transaction will commit at.
        commit_watermark: LexiVersion,
    },
    /// A row insertion.
    Insert {
        /// The relation written.
        table: TableRef,
        /// The full new row.
        row: Row,
    },
    /// A row update.
    Update {
        /// The relation written.
        table: TableRef,
        /// The row's previous primary key, present only when the key
        /// changed (REPLICA IDENTITY DEFAULT sends key columns only).
        old_key: Option<Vec<Datum>>,
        /// The full new row.
        row: Row,
    },
    /// A row deletion.
    Delete {
        /// The relation written.
        table: TableRef,
        /// The deleted row's primary key.
        key: Vec<Datum>,
    },
    /// Removal of every row in the named relations.
    Truncate {
        /// The truncated relations.
        tables: Vec<TableRef>,
    },
    /// An upstream description of a relation's current shape. Sent before
    /// the first data change for the relation on a stream, and again
    /// whenever its schema changes.
    Relation {
        /// The relation description.
        desc: RelationDesc,
    },
    /// DDL: a relation was created.
    CreateTable {
        /// The new relation.
        desc: RelationDesc,
    },
    /// DDL: a relation was dropped.
    DropTable {
        /// The dropped relation.
        table: TableRef,
    },
    /// DDL: a column was added.
    AddColumn {
        /// The altered relation.
        table: TableRef,
        /// The new column's name.
        column: ColumnName,
        /// The new column's type.
        ty: ColumnType,
    },
    /// DDL: a column was dropped.
    DropColumn {
        /// The altered relation.
        table: TableRef,
        /// The dropped column.
        column: ColumnName,
    },
    /// DDL: a column was renamed and/or retyped.
    UpdateColumn {
        /// The altered relation.
        table: TableRef,
        /// The column's previous name.
        old: ColumnName,
        /// The column's new name.
        column: ColumnName,
        /// The column's new type.
        ty: ColumnType,
    },
    /// DDL: an index was created.
    CreateIndex {
        /// The indexed relation.
        table: TableRef,
        /// The new index.
        index: IndexDesc,
    },
    /// DDL: an index was dropped.
    DropIndex {
        /// The schema containing the index.
        schema: String,
        /// The index name.
        name: String,
    },
    /// Closes a transaction.
    Commit {
        /// The commit watermark.
        watermark: LexiVersion,
    },
}

impl Change {
    /// The change's tag, as persisted in the change log.
    pub fn tag(&self) -> &'static str {
        match self {
            Change::Begin { .. } => "begin",
            Change::Insert { .. } => "insert",
            Change::Update { .. } => "update",
            Change::Delete { .. } => "delete",
            Change::Truncate { .. } => "truncate",
            Change::Relation { .. } => "relation",
            Change::CreateTable { .. } => "create-table",
            Change::DropTable { .. } => "drop-table",
            Change::AddColumn { .. } => "add-column",
            Change::DropColumn { .. } => "drop-column",
            Change::UpdateColumn { .. } => "update-column",
            Change::CreateIndex { .. } => "create-index",
            Change::DropIndex { .. } => "drop-index",
            Change::Commit { .. } => "commit",
        }
    }

    /// Reports whether this change closes a transaction.
    pub fn is_commit(&self) -> bool {
        matches!(self, Change::Commit { .. })
    }

    /// Reports whether this change alters a relation's schema rather than
    /// its rows.
    pub fn is_schema_change(&self) -> bool {
        matches!(
            self,
            Change::Relation { .. }
                | Change::CreateTable { .. }
                | Change::DropTable { .. }
                | Change::AddColumn { .. }
                | Change::DropColumn { .. }
                | Change::UpdateColumn { .. }
                | Change::CreateIndex { .. }
                | Change::DropIndex { .. }
        )
    }
}

/// One durable change log record: a change at a watermark, disambiguated
/// within its transaction by `pos`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// The commit watermark of the containing transaction.
    pub watermark: LexiVersion,
    /// The change's index within its transaction. The `Commit` entry always
    /// carries the largest `pos` of its transaction.
    pub pos: u64,
    /// The change itself.
    pub change: Change,
}

/// A committed upstream transaction, the unit broadcast to change stream
/// subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// The commit watermark.
    pub watermark: LexiVersion,
    /// The data and DDL changes, in upstream order, excluding the
    /// `Begin`/`Commit` framing.
    pub changes: Vec<Change>,
}

impl Transaction {
    /// Expands the transaction into its durable change log entries,
    /// including the `Begin` and `Commit` framing.
    pub fn to_entries(&self) -> Vec<ChangeEntry> {
        let mut entries = Vec::with_capacity(self.changes.len() + 2);
        entries.push(ChangeEntry {
            watermark: self.watermark.clone(),
            pos: 0,
            change: Change::Begin {
                commit_watermark: self.watermark.clone(),
            },
        });
        for (i, change) in self.changes.iter().enumerate() {
            entries.push(ChangeEntry {
                watermark: self.watermark.clone(),
                pos: (i + 1) as u64,
                change: change.clone(),
            });
        }
        entries.push(ChangeEntry {
            watermark: self.watermark.clone(),
            pos: (self.changes.len() + 1) as u64,
            change: Change::Commit {
                watermark: self.watermark.clone(),
            },
        });
        entries
    }

    /// Reassembles transactions from a contiguous run of change log
    /// entries, as produced by a catch-up scan.
    pub fn from_entries(
        entries: impl IntoIterator<Item = ChangeEntry>,
    ) -> Vec<Transaction> {
        let mut out = Vec::new();
        let mut current: Option<Transaction> = None;
        for entry in entries {
            match entry.change {
                Change::Begin { commit_watermark } => {
                    current = Some(Transaction {
                        watermark: commit_watermark,
                        changes: Vec::new(),
                    });
                }
                Change::Commit { .. } => {
                    if let Some(tx) = current.take() {
                        out.push(tx);
                    }
                }
                change => {
                    if let Some(tx) = current.as_mut() {
                        tx.changes.push(change);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(lsn: u64) -> Transaction {
        Transaction {
            watermark: LexiVersion::from_lsn(lsn),
            changes: vec![Change::Delete {
                table: TableRef::new("public", "issues"),
                key: vec![Datum::Int(1)],
            }],
        }
    }

    #[test]
    fn entries_round_trip() {
        let txs = vec![tx(10), tx(11)];
        let entries: Vec<_> = txs.iter().flat_map(|t| t.to_entries()).collect();
        assert_eq!(entries[0].pos, 0);
        assert_eq!(entries[2].pos, 2);
        assert!(entries[2].change.is_commit());
        assert_eq!(Transaction::from_entries(entries), txs);
    }

    #[test]
    fn tags_are_stable() {
        let change = Change::DropTable {
            table: TableRef::new("public", "t"),
        };
        assert_eq!(change.tag(), "drop-table");
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["tag"], "drop-table");
    }

    #[test]
    fn incomplete_transactions_are_dropped_on_reassembly() {
        let mut entries = tx(10).to_entries();
        entries.pop();
        assert!(Transaction::from_entries(entries).is_empty());
    }
}
