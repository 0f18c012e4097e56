// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Condition compilation and evaluation.
//!
//! Null never matches: a comparison whose left-hand side is null is false,
//! for the negated operators too. The set-valued comparators require the
//! left-hand side to be an array value; anything else (including null) is
//! no match.

use std::collections::BTreeSet;
use std::fmt;

use lens_compute::Predicate;
use lens_repr::{Datum, Row, ScalarType};

use crate::ast::{CompareOp, Condition};
use crate::compile::CompileError;
use crate::like::LikePattern;

/// Resolves column names during condition compilation.
///
/// Returns `None` for an unknown column, and `Some(ty)` for a known one;
/// `ty` is `None` where no scalar type is declared (grouped-output columns).
pub trait ColumnResolver {
    /// Looks up a column.
    fn resolve(&self, column: &str) -> Option<Option<ScalarType>>;
}

impl ColumnResolver for lens_repr::RelationDesc {
    fn resolve(&self, column: &str) -> Option<Option<ScalarType>> {
        self.column(column).map(|ty| Some(ty.scalar_type))
    }
}

impl ColumnResolver for BTreeSet<String> {
    fn resolve(&self, column: &str) -> Option<Option<ScalarType>> {
        self.contains(column).then_some(None)
    }
}

/// A compiled, evaluable condition tree.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    node: Node,
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Compare {
        field: String,
        op: CompareOp,
        value: Datum,
    },
    InList {
        field: String,
        values: BTreeSet<Datum>,
        negated: bool,
    },
    Like {
        field: String,
        pattern: LikePattern,
        negated: bool,
    },
    SetOp {
        field: String,
        op: CompareOp,
        values: BTreeSet<Datum>,
    },
}

impl CompiledCondition {
    /// Compiles a condition against the given column namespace.
    pub fn compile(
        condition: &Condition,
        columns: &dyn ColumnResolver,
    ) -> Result<CompiledCondition, CompileError> {
        Ok(CompiledCondition {
            node: compile_node(condition, columns)?,
        })
    }

    /// Evaluates the condition against a row.
    pub fn eval(&self, row: &Row) -> bool {
        eval_node(&self.node, row)
    }

    /// The columns this condition reads.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_columns(&self.node, &mut out);
        out
    }
}

impl Predicate for CompiledCondition {
    fn eval(&self, row: &Row) -> bool {
        CompiledCondition::eval(self, row)
    }

    fn describe(&self) -> String {
        format!("{:?}", self.node)
    }
}

fn compile_node(condition: &Condition, columns: &dyn ColumnResolver) -> Result<Node, CompileError> {
    match condition {
        Condition::And { conditions } => Ok(Node::And(
            conditions
                .iter()
                .map(|c| compile_node(c, columns))
                .collect::<Result<_, _>>()?,
        )),
        Condition::Or { conditions } => Ok(Node::Or(
            conditions
                .iter()
                .map(|c| compile_node(c, columns))
                .collect::<Result<_, _>>()?,
        )),
        Condition::Simple { op, field, value } => {
            let column_type = columns
                .resolve(field)
                .ok_or_else(|| CompileError::UnknownColumn {
                    column: field.clone(),
                })?;
            compile_simple(*op, field, value, column_type)
        }
    }
}

fn compile_simple(
    op: CompareOp,
    field: &str,
    value: &serde_json::Value,
    column_type: Option<ScalarType>,
) -> Result<Node, CompileError> {
    let bad_literal = || CompileError::BadLiteral {
        op: op_name(op),
        value: value.clone(),
    };
    match op {
        CompareOp::In | CompareOp::NotIn => {
            let values = literal_set(value).ok_or_else(bad_literal)?;
            Ok(Node::InList {
                field: field.to_owned(),
                values,
                negated: matches!(op, CompareOp::NotIn),
            })
        }
        CompareOp::Like | CompareOp::NotLike | CompareOp::ILike | CompareOp::NotILike => {
            let pattern = value.as_str().ok_or_else(bad_literal)?;
            let case_insensitive = matches!(op, CompareOp::ILike | CompareOp::NotILike);
            let pattern = LikePattern::compile(pattern, case_insensitive)?;
            Ok(Node::Like {
                field: field.to_owned(),
                pattern,
                negated: matches!(op, CompareOp::NotLike | CompareOp::NotILike),
            })
        }
        op if op.is_set_op() => {
            let values = literal_set(value).ok_or_else(bad_literal)?;
            Ok(Node::SetOp {
                field: field.to_owned(),
                op,
                values,
            })
        }
        op => {
            let literal = Datum::from_wire(value).map_err(|_| bad_literal())?;
            if op.is_ordered() {
                check_comparable(field, column_type, &literal)?;
            }
            Ok(Node::Compare {
                field: field.to_owned(),
                op,
                value: literal,
            })
        }
    }
}

/// Rejects ordered comparisons whose literal cannot inhabit the column's
/// declared type. Equality across types is allowed (and simply never
/// matches); ordered comparisons across types have no defensible answer.
fn check_comparable(
    field: &str,
    column_type: Option<ScalarType>,
    literal: &Datum,
) -> Result<(), CompileError> {
    let (column_type, literal_type) = match (column_type, literal.scalar_type()) {
        (Some(c), Some(l)) => (c, l),
        // Untyped columns and null literals are checked at runtime only.
        _ => return Ok(()),
    };
    let numeric = |ty: ScalarType| matches!(ty, ScalarType::Int8 | ScalarType::Float8);
    let compatible = column_type == literal_type || (numeric(column_type) && numeric(literal_type));
    if compatible {
        Ok(())
    } else {
        Err(CompileError::CrossTypeComparison {
            column: field.to_owned(),
            column_type,
            literal: literal.to_string(),
        })
    }
}

fn literal_set(value: &serde_json::Value) -> Option<BTreeSet<Datum>> {
    let items = value.as_array()?;
    items.iter().map(|v| Datum::from_wire(v).ok()).collect()
}

fn op_name(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::NotEq => "!=",
        CompareOp::Lt => "<",
        CompareOp::Gt => ">",
        CompareOp::Le => "<=",
        CompareOp::Ge => ">=",
        CompareOp::In => "IN",
        CompareOp::NotIn => "NOT IN",
        CompareOp::Like => "LIKE",
        CompareOp::NotLike => "NOT LIKE",
        CompareOp::ILike => "ILIKE",
        CompareOp::NotILike => "NOT ILIKE",
        CompareOp::Intersects => "INTERSECTS",
        CompareOp::Disjoint => "DISJOINT",
        CompareOp::Superset => "SUPERSET",
        CompareOp::Subset => "SUBSET",
        CompareOp::Congruent => "CONGRUENT",
        CompareOp::Incongruent => "INCONGRUENT",
    }
}

fn eval_node(node: &Node, row: &Row) -> bool {
    match node {
        Node::And(children) => children.iter().all(|c| eval_node(c, row)),
        Node::Or(children) => children.iter().any(|c| eval_node(c, row)),
        Node::Compare { field, op, value } => {
            let lhs = row.datum(field);
            if lhs.is_null() || value.is_null() {
                return false;
            }
            match op {
                CompareOp::Eq => lhs == *value,
                CompareOp::NotEq => lhs != *value,
                CompareOp::Lt => lhs < *value,
                CompareOp::Gt => lhs > *value,
                CompareOp::Le => lhs <= *value,
                CompareOp::Ge => lhs >= *value,
                _ => unreachable!("non-scalar op in Compare node"),
            }
        }
        Node::InList {
            field,
            values,
            negated,
        } => {
            let lhs = row.datum(field);
            if lhs.is_null() {
                return false;
            }
            values.contains(&lhs) != *negated
        }
        Node::Like {
            field,
            pattern,
            negated,
        } => match row.datum(field) {
            Datum::String(s) => pattern.matches(&s) != *negated,
            _ => false,
        },
        Node::SetOp { field, op, values } => {
            let lhs: BTreeSet<Datum> = match row.datum(field) {
                Datum::Array(items) => items.into_iter().collect(),
                // Null (or any non-array) never matches a set comparator.
                _ => return false,
            };
            match op {
                CompareOp::Intersects => lhs.intersection(values).next().is_some(),
                CompareOp::Disjoint => lhs.intersection(values).next().is_none(),
                CompareOp::Superset => values.is_subset(&lhs),
                CompareOp::Subset => lhs.is_subset(values),
                CompareOp::Congruent => lhs == *values,
                CompareOp::Incongruent => lhs != *values,
                _ => unreachable!("scalar op in SetOp node"),
            }
        }
    }
}

fn collect_columns(node: &Node, out: &mut BTreeSet<String>) {
    match node {
        Node::And(children) | Node::Or(children) => {
            for c in children {
                collect_columns(c, out);
            }
        }
        Node::Compare { field, .. }
        | Node::InList { field, .. }
        | Node::Like { field, .. }
        | Node::SetOp { field, .. } => {
            out.insert(field.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use lens_repr::RelationDesc;

    use super::*;

    fn desc() -> RelationDesc {
        RelationDesc::new("public", "issues")
            .with_column("id", ScalarType::Text, false)
            .with_column("points", ScalarType::Int8, true)
            .with_column("title", ScalarType::Text, true)
            .with_key(vec!["id".into()])
    }

    fn compile(json: serde_json::Value) -> Result<CompiledCondition, CompileError> {
        let cond: Condition = serde_json::from_value(json).unwrap();
        CompiledCondition::compile(&cond, &desc())
    }

    fn row(id: &str, points: Option<i64>, title: &str) -> Row {
        let mut r = Row::new();
        r.set("id", id);
        r.set("points", points.map(Datum::Int).unwrap_or(Datum::Null));
        r.set("title", title);
        r
    }

    #[test]
    fn simple_comparisons() {
        let c = compile(serde_json::json!({
            "type": "simple", "op": ">=", "field": "points", "value": 5,
        }))
        .unwrap();
        assert!(c.eval(&row("1", Some(5), "t")));
        assert!(!c.eval(&row("1", Some(4), "t")));
        // Null never matches.
        assert!(!c.eval(&row("1", None, "t")));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let err = compile(serde_json::json!({
            "type": "simple", "op": "=", "field": "nope", "value": 1,
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::UnknownColumn { .. }));
    }

    #[test]
    fn cross_type_ordered_comparison_is_rejected() {
        let err = compile(serde_json::json!({
            "type": "simple", "op": "<", "field": "title", "value": 5,
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::CrossTypeComparison { .. }));
        // Equality across types is allowed and simply never matches.
        let c = compile(serde_json::json!({
            "type": "simple", "op": "=", "field": "title", "value": 5,
        }))
        .unwrap();
        assert!(!c.eval(&row("1", None, "t")));
    }

    #[test]
    fn empty_in_list_is_always_false() {
        let c = compile(serde_json::json!({
            "type": "simple", "op": "IN", "field": "id", "value": [],
        }))
        .unwrap();
        assert!(!c.eval(&row("1", None, "t")));
        let c = compile(serde_json::json!({
            "type": "simple", "op": "NOT IN", "field": "id", "value": [],
        }))
        .unwrap();
        assert!(c.eval(&row("1", None, "t")));
    }

    #[test]
    fn and_or_compose() {
        let c = compile(serde_json::json!({
            "type": "and",
            "conditions": [
                {"type": "simple", "op": ">", "field": "points", "value": 1},
                {"type": "or", "conditions": [
                    {"type": "simple", "op": "=", "field": "title", "value": "a"},
                    {"type": "simple", "op": "=", "field": "title", "value": "b"},
                ]},
            ],
        }))
        .unwrap();
        assert!(c.eval(&row("1", Some(2), "a")));
        assert!(c.eval(&row("1", Some(2), "b")));
        assert!(!c.eval(&row("1", Some(2), "c")));
        assert!(!c.eval(&row("1", Some(0), "a")));
        assert_eq!(
            c.columns(),
            ["points", "title"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn like_family() {
        let c = compile(serde_json::json!({
            "type": "simple", "op": "ILIKE", "field": "title", "value": "a%",
        }))
        .unwrap();
        assert!(c.eval(&row("1", None, "Alpha")));
        assert!(!c.eval(&row("1", None, "beta")));
        let err = compile(serde_json::json!({
            "type": "simple", "op": "LIKE", "field": "title", "value": "a\\",
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::BadLikePattern(_)));
    }

    #[test]
    fn set_comparators() {
        let mut r = Row::new();
        r.set("id", "1");
        r.set(
            "points",
            Datum::Array(vec![Datum::Int(1), Datum::Int(2), Datum::Int(3)]),
        );
        let eval = |op: &str, value: serde_json::Value| {
            compile(serde_json::json!({
                "type": "simple", "op": op, "field": "points", "value": value,
            }))
            .unwrap()
            .eval(&r)
        };
        assert!(eval("INTERSECTS", serde_json::json!([3, 9])));
        assert!(!eval("INTERSECTS", serde_json::json!([9])));
        assert!(eval("DISJOINT", serde_json::json!([9])));
        assert!(eval("SUPERSET", serde_json::json!([1, 2])));
        // The empty set is a subset of everything.
        assert!(eval("SUPERSET", serde_json::json!([])));
        assert!(eval("SUBSET", serde_json::json!([1, 2, 3, 4])));
        assert!(!eval("SUBSET", serde_json::json!([1])));
        assert!(eval("CONGRUENT", serde_json::json!([3, 2, 1])));
        assert!(eval("INCONGRUENT", serde_json::json!([1])));

        // A null or scalar left-hand side never matches, negated forms
        // included.
        let null_row = row("1", None, "t");
        assert!(!eval_on(&null_row, "INTERSECTS", serde_json::json!([1])));
        assert!(!eval_on(&null_row, "DISJOINT", serde_json::json!([1])));
        assert!(!eval_on(&null_row, "INCONGRUENT", serde_json::json!([1])));
    }

    fn eval_on(r: &Row, op: &str, value: serde_json::Value) -> bool {
        compile(serde_json::json!({
            "type": "simple", "op": op, "field": "points", "value": value,
        }))
        .unwrap()
        .eval(r)
    }
}
