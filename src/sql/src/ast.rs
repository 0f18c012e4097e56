// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client-facing query AST, as decoded from the wire.

use serde::{Deserialize, Serialize};

/// A query over one table, possibly joined, filtered, grouped, ordered, and
/// limited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Ast {
    /// The schema containing the queried table; defaults to `public`.
    #[serde(default)]
    pub schema: Option<String>,
    /// The queried table.
    pub table: String,
    /// An alias under which results are reported.
    #[serde(default)]
    pub alias: Option<String>,
    /// The selected columns; `None` selects every column.
    #[serde(default)]
    pub select: Option<Vec<String>>,
    /// The filter condition.
    #[serde(rename = "where", default)]
    pub where_clause: Option<Condition>,
    /// Joined child queries, applied in order.
    #[serde(default)]
    pub joins: Vec<Join>,
    /// Grouping columns.
    #[serde(default)]
    pub group_by: Option<Vec<String>>,
    /// Aggregate functions computed over each group (or, without
    /// `group_by`, over the whole table).
    #[serde(default)]
    pub aggregates: Vec<AggregateCall>,
    /// A filter over the grouped output.
    #[serde(default)]
    pub having: Option<Condition>,
    /// The result ordering.
    #[serde(default)]
    pub order_by: Vec<Ordering>,
    /// The maximum number of result rows; must be a non-negative integer.
    #[serde(default)]
    pub limit: Option<serde_json::Number>,
    /// Deduplication: over the whole row identity or a single column.
    #[serde(default)]
    pub distinct: Option<DistinctSpec>,
    /// Marks the query singular: the client receives the first result row
    /// or nothing.
    #[serde(default)]
    pub one: bool,
}

/// A join clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Join {
    /// Inner or left.
    pub kind: JoinKind,
    /// `[parent_column, child_column]`.
    pub on: (String, String),
    /// The child query.
    pub other: Box<Ast>,
    /// The relationship name under which child rows appear.
    #[serde(rename = "as")]
    pub alias: String,
    /// Hidden relationships support the query shape (junction hops) but
    /// are not surfaced to clients.
    #[serde(default)]
    pub hidden: bool,
    /// System relationships are added by the server, not the client.
    #[serde(default)]
    pub system: bool,
}

/// The flavor of a [`Join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    /// Drop parents without matching children.
    Inner,
    /// Keep parents without matching children.
    Left,
}

/// An aggregate function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AggregateCall {
    /// The function.
    pub aggregate: AggregateFunc,
    /// The aggregated column; `count` takes none.
    #[serde(default)]
    pub field: Option<String>,
    /// The output column name.
    pub alias: String,
}

/// The supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunc {
    /// Row count.
    Count,
    /// Sum of a column.
    Sum,
    /// Mean of a column.
    Avg,
    /// Minimum of a column.
    Min,
    /// Maximum of a column.
    Max,
    /// The column's values, collected.
    Array,
}

/// One ordering term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Ordering {
    /// The ordered column.
    pub field: String,
    /// The direction.
    #[serde(default)]
    pub direction: Direction,
}

/// A sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// A `distinct` clause: `true` dedupes on the row identity, a string
/// dedupes on that column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DistinctSpec {
    /// Dedupe on the row identity.
    Row(bool),
    /// Dedupe on one column.
    Column(String),
}

/// A filter condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", deny_unknown_fields)]
pub enum Condition {
    /// Every branch must hold.
    And {
        /// The branches.
        conditions: Vec<Condition>,
    },
    /// At least one branch must hold.
    Or {
        /// The branches.
        conditions: Vec<Condition>,
    },
    /// A single comparison.
    Simple {
        /// The comparison operator.
        op: CompareOp,
        /// The compared column.
        field: String,
        /// The literal right-hand side.
        value: serde_json::Value,
    },
}

/// The comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equality.
    #[serde(rename = "=")]
    Eq,
    /// Inequality.
    #[serde(rename = "!=")]
    NotEq,
    /// Strictly less.
    #[serde(rename = "<")]
    Lt,
    /// Strictly greater.
    #[serde(rename = ">")]
    Gt,
    /// At most.
    #[serde(rename = "<=")]
    Le,
    /// At least.
    #[serde(rename = ">=")]
    Ge,
    /// Membership in a literal list.
    #[serde(rename = "IN")]
    In,
    /// Absence from a literal list.
    #[serde(rename = "NOT IN")]
    NotIn,
    /// SQL `LIKE`.
    #[serde(rename = "LIKE")]
    Like,
    /// Negated SQL `LIKE`.
    #[serde(rename = "NOT LIKE")]
    NotLike,
    /// Case-insensitive `LIKE`.
    #[serde(rename = "ILIKE")]
    ILike,
    /// Negated case-insensitive `LIKE`.
    #[serde(rename = "NOT ILIKE")]
    NotILike,
    /// Set intersection is non-empty.
    #[serde(rename = "INTERSECTS")]
    Intersects,
    /// Set intersection is empty.
    #[serde(rename = "DISJOINT")]
    Disjoint,
    /// Left side contains every element of the right.
    #[serde(rename = "SUPERSET")]
    Superset,
    /// Right side contains every element of the left.
    #[serde(rename = "SUBSET")]
    Subset,
    /// Set equality.
    #[serde(rename = "CONGRUENT")]
    Congruent,
    /// Set inequality.
    #[serde(rename = "INCONGRUENT")]
    Incongruent,
}

impl CompareOp {
    /// Reports whether this operator requires an ordered comparison.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            CompareOp::Lt | CompareOp::Gt | CompareOp::Le | CompareOp::Ge
        )
    }

    /// Reports whether this operator compares sets.
    pub fn is_set_op(&self) -> bool {
        matches!(
            self,
            CompareOp::Intersects
                | CompareOp::Disjoint
                | CompareOp::Superset
                | CompareOp::Subset
                | CompareOp::Congruent
                | CompareOp::Incongruent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_typical_query() {
        let json = serde_json::json!({
            "table": "issues",
            "select": ["id", "title", "big"],
            "where": {
                "type": "simple",
                "op": "IN",
                "field": "id",
                "value": ["1", "2", "3", "4"],
            },
            "orderBy": [{"field": "id"}],
        });
        let ast: Ast = serde_json::from_value(json).unwrap();
        assert_eq!(ast.table, "issues");
        assert_eq!(ast.select.as_ref().unwrap().len(), 3);
        match ast.where_clause.unwrap() {
            Condition::Simple { op, field, .. } => {
                assert_eq!(op, CompareOp::In);
                assert_eq!(field, "id");
            }
            other => panic!("unexpected condition {other:?}"),
        }
        assert_eq!(ast.order_by[0].direction, Direction::Asc);
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = serde_json::json!({"table": "t", "sel": []});
        assert!(serde_json::from_value::<Ast>(json).is_err());
    }

    #[test]
    fn distinct_spec_shapes() {
        let ast: Ast =
            serde_json::from_value(serde_json::json!({"table": "t", "distinct": true})).unwrap();
        assert_eq!(ast.distinct, Some(DistinctSpec::Row(true)));
        let ast: Ast =
            serde_json::from_value(serde_json::json!({"table": "t", "distinct": "c"})).unwrap();
        assert_eq!(ast.distinct, Some(DistinctSpec::Column("c".into())));
    }

    #[test]
    fn join_round_trips() {
        let json = serde_json::json!({
            "table": "issues",
            "joins": [{
                "kind": "left",
                "on": ["owner_id", "id"],
                "other": {"table": "users"},
                "as": "owner",
            }],
        });
        let ast: Ast = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(ast.joins[0].kind, JoinKind::Left);
        assert_eq!(serde_json::to_value(&ast).unwrap()["joins"][0]["as"], "owner");
    }
}
