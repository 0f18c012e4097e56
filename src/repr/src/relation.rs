// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scalar::ScalarType;

/// The name of a column in a relation.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ColumnName(String);

impl ColumnName {
    /// Returns this column name as a `str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ColumnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColumnName {
    fn from(s: &str) -> ColumnName {
        ColumnName(s.to_owned())
    }
}

impl From<String> for ColumnName {
    fn from(s: String) -> ColumnName {
        ColumnName(s)
    }
}

/// The type and attributes of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnType {
    /// The scalar type of the column.
    pub scalar_type: ScalarType,
    /// Whether the column may hold nulls.
    pub nullable: bool,
    /// The column default expression, verbatim from upstream, if any.
    pub default: Option<String>,
    /// The ordinal position of the column in the upstream table, starting
    /// at 1.
    pub pos: usize,
}

/// The sort direction of an index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A secondary index on a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDesc {
    /// The index name, unique within the relation's schema.
    pub name: String,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// The indexed columns, in index order.
    pub columns: Vec<(ColumnName, SortOrder)>,
}

/// A description of a replicated relation: its qualified name, columns,
/// primary key, and indexes.
///
/// Primary key order is significant: it defines the natural row order served
/// by dataflow sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDesc {
    /// The upstream schema containing the relation.
    pub schema: String,
    /// The relation name.
    pub name: String,
    columns: Vec<(ColumnName, ColumnType)>,
    key: Vec<ColumnName>,
    /// Secondary indexes.
    pub indexes: Vec<IndexDesc>,
}

impl RelationDesc {
    /// Creates a description with no columns; used with
    /// [`RelationDesc::with_column`] and [`RelationDesc::with_key`].
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> RelationDesc {
        RelationDesc {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Appends a column.
    pub fn with_column(
        mut self,
        name: impl Into<ColumnName>,
        scalar_type: ScalarType,
        nullable: bool,
    ) -> RelationDesc {
        let pos = self.columns.len() + 1;
        self.columns.push((
            name.into(),
            ColumnType {
                scalar_type,
                nullable,
                default: None,
                pos,
            },
        ));
        self
    }

    /// Declares the primary key, in key order.
    pub fn with_key(mut self, key: Vec<ColumnName>) -> RelationDesc {
        self.key = key;
        self
    }

    /// Appends an index.
    pub fn with_index(mut self, index: IndexDesc) -> RelationDesc {
        self.indexes.push(index);
        self
    }

    /// The columns, in declaration order.
    pub fn columns(&self) -> &[(ColumnName, ColumnType)] {
        &self.columns
    }

    /// Mutable access to the columns, for applying schema changes.
    pub fn columns_mut(&mut self) -> &mut Vec<(ColumnName, ColumnType)> {
        &mut self.columns
    }

    /// The primary key columns, in key order.
    pub fn key(&self) -> &[ColumnName] {
        &self.key
    }

    /// Looks up a column's type by name.
    pub fn column(&self, name: &str) -> Option<&ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, ty)| ty)
    }

    /// Reports whether the relation has a column with the given name.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// The schema-qualified relation name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for RelationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> RelationDesc {
        RelationDesc::new("public", "issues")
            .with_column("id", ScalarType::Text, false)
            .with_column("title", ScalarType::Text, true)
            .with_column("big", ScalarType::Int8, true)
            .with_key(vec!["id".into()])
    }

    #[test]
    fn columns_are_positional() {
        let d = desc();
        assert_eq!(d.column("id").unwrap().pos, 1);
        assert_eq!(d.column("big").unwrap().pos, 3);
        assert!(d.column("nope").is_none());
    }

    #[test]
    fn key_and_name() {
        let d = desc();
        assert_eq!(d.key(), &["id".into()]);
        assert_eq!(d.qualified_name(), "public.issues");
    }
}
