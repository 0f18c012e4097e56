// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lexi::LexiVersion;
use crate::scalar::{Datum, UnrepresentableError};
use crate::ColumnName;

/// The reserved column holding the version of the transaction that last
/// wrote a row. NOT NULL on every replicated table.
pub const VERSION_COLUMN: &str = "_0_version";

/// A record: an ordered map from column name to [`Datum`].
///
/// Rows are identified within their table by the datums of the table's
/// primary key columns, extracted with [`Row::key`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Row {
    columns: BTreeMap<ColumnName, Datum>,
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Row {
        Row::default()
    }

    /// Returns the datum stored under `column`, or `None` if the column is
    /// absent from this row.
    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.columns.get(&ColumnName::from(column))
    }

    /// Returns the datum stored under `column`, treating absence as null.
    pub fn datum(&self, column: &str) -> Datum {
        self.get(column).cloned().unwrap_or(Datum::Null)
    }

    /// Stores `datum` under `column`, replacing any existing value.
    pub fn set(&mut self, column: impl Into<ColumnName>, datum: impl Into<Datum>) {
        self.columns.insert(column.into(), datum.into());
    }

    /// Removes `column` from the row.
    pub fn remove(&mut self, column: &str) -> Option<Datum> {
        self.columns.remove(&ColumnName::from(column))
    }

    /// Iterates over `(column, datum)` pairs in column-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&ColumnName, &Datum)> {
        self.columns.iter()
    }

    /// The number of columns in the row.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Reports whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Extracts the datums of the given key columns, in key order.
    ///
    /// Missing key columns extract as null; callers that require a total key
    /// must validate the schema beforehand.
    pub fn key(&self, key_columns: &[ColumnName]) -> Vec<Datum> {
        key_columns
            .iter()
            .map(|c| self.datum(c.as_str()))
            .collect()
    }

    /// The row's `_0_version`, if present and well formed.
    pub fn version(&self) -> Option<LexiVersion> {
        match self.get(VERSION_COLUMN) {
            Some(Datum::String(s)) => LexiVersion::parse(s).ok(),
            _ => None,
        }
    }

    /// Stamps the row's `_0_version`.
    pub fn set_version(&mut self, version: &LexiVersion) {
        self.set(VERSION_COLUMN, version.as_str());
    }

    /// Restricts the row to the named columns, dropping the rest.
    pub fn project(&self, columns: &[ColumnName]) -> Row {
        let mut out = Row::new();
        for c in columns {
            if let Some(d) = self.get(c.as_str()) {
                out.columns.insert(c.clone(), d.clone());
            }
        }
        out
    }

    /// Converts the row to its client wire representation: a JSON object
    /// mapping column names to wire values.
    pub fn to_wire(&self) -> Result<serde_json::Map<String, serde_json::Value>, UnrepresentableError>
    {
        let mut out = serde_json::Map::with_capacity(self.columns.len());
        for (name, datum) in &self.columns {
            out.insert(name.as_str().to_owned(), datum.to_wire()?);
        }
        Ok(out)
    }
}

impl FromIterator<(ColumnName, Datum)> for Row {
    fn from_iter<I: IntoIterator<Item = (ColumnName, Datum)>>(iter: I) -> Row {
        Row {
            columns: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, datum)) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {datum}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_extraction() {
        let mut row = Row::new();
        row.set("id", 7i64);
        row.set("name", "alice");
        let key = row.key(&["id".into()]);
        assert_eq!(key, vec![Datum::Int(7)]);
        // Absent key columns extract as null.
        let key = row.key(&["missing".into()]);
        assert_eq!(key, vec![Datum::Null]);
    }

    #[test]
    fn version_round_trip() {
        let mut row = Row::new();
        assert_eq!(row.version(), None);
        let v = LexiVersion::from_lsn(1234);
        row.set_version(&v);
        assert_eq!(row.version(), Some(v));
    }

    #[test]
    fn project_drops_unlisted_columns() {
        let mut row = Row::new();
        row.set("id", 1i64);
        row.set("title", "x");
        row.set("secret", "s");
        let p = row.project(&["id".into(), "title".into()]);
        assert_eq!(p.len(), 2);
        assert!(p.get("secret").is_none());
    }

    #[test]
    fn wire_object_propagates_representability_errors() {
        let mut row = Row::new();
        row.set("ok", 1i64);
        assert!(row.to_wire().is_ok());
        row.set("big", i64::MAX);
        assert!(row.to_wire().is_err());
    }
}
