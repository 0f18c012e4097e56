// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use lens_repr::{ColumnName, Datum, RelationDesc, Row};
use lens_storage_types::TableRef;

use crate::node::{Delta, Update};
use crate::pipeline::SourceChange;

/// A table scan: the in-memory mirror of one replicated table, ordered by
/// the table's primary key.
///
/// The source keeps a single sorted index; each downstream edge reads it in
/// the key order, and any other declared order is realized by the view at
/// the pipeline root.
#[derive(Debug)]
pub struct MemorySource {
    desc: RelationDesc,
    key: Vec<ColumnName>,
    rows: BTreeMap<Vec<Datum>, Row>,
    staged: Vec<SourceChange>,
}

impl MemorySource {
    /// Creates an empty source for the described table.
    pub fn new(desc: RelationDesc) -> MemorySource {
        let key = desc.key().to_vec();
        MemorySource {
            desc,
            key,
            rows: BTreeMap::new(),
            staged: Vec::new(),
        }
    }

    /// The table this source mirrors.
    pub fn table(&self) -> TableRef {
        TableRef::new(self.desc.schema.clone(), self.desc.name.clone())
    }

    /// The table description.
    pub fn desc(&self) -> &RelationDesc {
        &self.desc
    }

    /// Seeds the source with a row outside of any commit, for hydration
    /// from the replica snapshot.
    pub fn seed(&mut self, row: Row) {
        let key = row.key(&self.key);
        self.rows.insert(key, row);
    }

    /// Queues a change for the next commit.
    pub fn stage(&mut self, change: SourceChange) {
        self.staged.push(change);
    }

    /// Emits the source's full contents as an all-additions delta.
    pub fn hydrate(&mut self) -> Delta {
        // Changes staged before hydration are part of the initial contents.
        let staged = std::mem::take(&mut self.staged);
        for change in staged {
            self.apply(change, &mut Vec::new());
        }
        self.rows
            .values()
            .map(|row| Update::add(row.clone()))
            .collect()
    }

    /// Applies the staged changes, emitting their multiset delta.
    pub fn process(&mut self) -> Delta {
        let staged = std::mem::take(&mut self.staged);
        let mut delta = Vec::new();
        for change in staged {
            self.apply(change, &mut delta);
        }
        delta
    }

    fn apply(&mut self, change: SourceChange, delta: &mut Delta) {
        match change {
            SourceChange::Insert { row } => {
                let key = row.key(&self.key);
                if let Some(old) = self.rows.insert(key, row.clone()) {
                    // An insert over an existing key is an edit.
                    delta.push(Update::remove(old));
                }
                delta.push(Update::add(row));
            }
            SourceChange::Edit { old_key, row } => {
                let new_key = row.key(&self.key);
                let old_key = old_key.unwrap_or_else(|| new_key.clone());
                if let Some(old) = self.rows.remove(&old_key) {
                    delta.push(Update::remove(old));
                }
                self.rows.insert(new_key, row.clone());
                delta.push(Update::add(row));
            }
            SourceChange::Delete { key } => {
                if let Some(old) = self.rows.remove(&key) {
                    delta.push(Update::remove(old));
                }
            }
            SourceChange::Truncate => {
                let rows = std::mem::take(&mut self.rows);
                delta.extend(rows.into_values().map(Update::remove));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lens_repr::ScalarType;

    use super::*;

    fn source() -> MemorySource {
        MemorySource::new(
            RelationDesc::new("public", "users")
                .with_column("id", ScalarType::Int8, false)
                .with_column("name", ScalarType::Text, true)
                .with_key(vec!["id".into()]),
        )
    }

    fn user(id: i64, name: &str) -> Row {
        let mut r = Row::new();
        r.set("id", id);
        r.set("name", name);
        r
    }

    #[test]
    fn hydrate_serves_key_order() {
        let mut s = source();
        s.seed(user(3, "c"));
        s.seed(user(1, "a"));
        s.seed(user(2, "b"));
        let delta = s.hydrate();
        let ids: Vec<_> = delta.iter().map(|u| u.node.row.datum("id")).collect();
        assert_eq!(ids, vec![Datum::Int(1), Datum::Int(2), Datum::Int(3)]);
    }

    #[test]
    fn edit_with_key_change_retracts_old_key() {
        let mut s = source();
        s.seed(user(1, "a"));
        s.hydrate();
        s.stage(SourceChange::Edit {
            old_key: Some(vec![Datum::Int(1)]),
            row: user(99, "a"),
        });
        let delta = s.process();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0].diff, -1);
        assert_eq!(delta[0].node.row.datum("id"), Datum::Int(1));
        assert_eq!(delta[1].diff, 1);
        assert_eq!(delta[1].node.row.datum("id"), Datum::Int(99));
    }

    #[test]
    fn delete_of_absent_row_is_a_noop() {
        let mut s = source();
        s.hydrate();
        s.stage(SourceChange::Delete {
            key: vec![Datum::Int(5)],
        });
        assert!(s.process().is_empty());
    }

    #[test]
    fn truncate_retracts_everything() {
        let mut s = source();
        s.seed(user(1, "a"));
        s.seed(user(2, "b"));
        s.hydrate();
        s.stage(SourceChange::Truncate);
        let delta = s.process();
        assert_eq!(delta.len(), 2);
        assert!(delta.iter().all(|u| u.diff == -1));
    }
}
