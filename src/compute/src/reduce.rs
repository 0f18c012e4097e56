// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use lens_repr::{ColumnName, Datum, Row};

use crate::node::{Delta, Update, ViewNode};

/// A strategy for collapsing a group of rows into a single datum.
///
/// Combiners must be pure functions of the group's membership: the operator
/// materializes each group into an immutable slice before calling, may call
/// zero or more times per commit, and expects identical output across calls
/// for identical membership.
pub trait Aggregate: Send {
    /// The aggregate's name, for diagnostics.
    fn name(&self) -> &'static str;

    /// The output column this aggregate populates.
    fn output_column(&self) -> &ColumnName;

    /// Folds the group into a single datum.
    fn fold(&self, group: &[Row]) -> Datum;
}

impl fmt::Debug for dyn Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.output_column())
    }
}

/// `count(*)`: the number of rows in the group.
#[derive(Debug)]
pub struct Count {
    /// The output column.
    pub alias: ColumnName,
}

impl Aggregate for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn output_column(&self) -> &ColumnName {
        &self.alias
    }

    fn fold(&self, group: &[Row]) -> Datum {
        Datum::Int(group.len() as i64)
    }
}

/// `sum(field)`: nulls ignored; null when no non-null input exists.
#[derive(Debug)]
pub struct Sum {
    /// The aggregated column.
    pub field: ColumnName,
    /// The output column.
    pub alias: ColumnName,
}

impl Aggregate for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn output_column(&self) -> &ColumnName {
        &self.alias
    }

    fn fold(&self, group: &[Row]) -> Datum {
        sum_datums(group, &self.field).unwrap_or(Datum::Null)
    }
}

/// `avg(field)`: nulls ignored; null when no non-null input exists.
#[derive(Debug)]
pub struct Avg {
    /// The aggregated column.
    pub field: ColumnName,
    /// The output column.
    pub alias: ColumnName,
}

impl Aggregate for Avg {
    fn name(&self) -> &'static str {
        "avg"
    }

    fn output_column(&self) -> &ColumnName {
        &self.alias
    }

    fn fold(&self, group: &[Row]) -> Datum {
        let count = group
            .iter()
            .filter(|row| !row.datum(self.field.as_str()).is_null())
            .count();
        match sum_datums(group, &self.field) {
            Some(sum) if count > 0 => {
                let total = match sum {
                    Datum::Int(i) => i as f64,
                    Datum::Double(d) => d,
                    _ => return Datum::Null,
                };
                Datum::Double(total / count as f64)
            }
            _ => Datum::Null,
        }
    }
}

/// `min(field)`: nulls ignored; null for an all-null group.
#[derive(Debug)]
pub struct Min {
    /// The aggregated column.
    pub field: ColumnName,
    /// The output column.
    pub alias: ColumnName,
}

impl Aggregate for Min {
    fn name(&self) -> &'static str {
        "min"
    }

    fn output_column(&self) -> &ColumnName {
        &self.alias
    }

    fn fold(&self, group: &[Row]) -> Datum {
        extremum(group, &self.field, |a, b| a < b)
    }
}

/// `max(field)`: nulls ignored; null for an all-null group.
#[derive(Debug)]
pub struct Max {
    /// The aggregated column.
    pub field: ColumnName,
    /// The output column.
    pub alias: ColumnName,
}

impl Aggregate for Max {
    fn name(&self) -> &'static str {
        "max"
    }

    fn output_column(&self) -> &ColumnName {
        &self.alias
    }

    fn fold(&self, group: &[Row]) -> Datum {
        extremum(group, &self.field, |a, b| a > b)
    }
}

/// `array(field)`: the group's non-null values in group order.
#[derive(Debug)]
pub struct ArrayAgg {
    /// The aggregated column.
    pub field: ColumnName,
    /// The output column.
    pub alias: ColumnName,
}

impl Aggregate for ArrayAgg {
    fn name(&self) -> &'static str {
        "array"
    }

    fn output_column(&self) -> &ColumnName {
        &self.alias
    }

    fn fold(&self, group: &[Row]) -> Datum {
        Datum::Array(
            group
                .iter()
                .map(|row| row.datum(self.field.as_str()))
                .filter(|d| !d.is_null())
                .collect(),
        )
    }
}

fn sum_datums(group: &[Row], field: &ColumnName) -> Option<Datum> {
    let mut acc: Option<Datum> = None;
    for row in group {
        let datum = row.datum(field.as_str());
        acc = match (acc, datum) {
            (acc, Datum::Null) => acc,
            (None, d @ (Datum::Int(_) | Datum::Double(_))) => Some(d),
            (Some(Datum::Int(a)), Datum::Int(b)) => Some(Datum::Int(a.wrapping_add(b))),
            (Some(Datum::Int(a)), Datum::Double(b)) => Some(Datum::Double(a as f64 + b)),
            (Some(Datum::Double(a)), Datum::Int(b)) => Some(Datum::Double(a + b as f64)),
            (Some(Datum::Double(a)), Datum::Double(b)) => Some(Datum::Double(a + b)),
            // Non-numeric input poisons the sum to null.
            _ => return Some(Datum::Null),
        };
    }
    acc
}

fn extremum(group: &[Row], field: &ColumnName, better: impl Fn(&Datum, &Datum) -> bool) -> Datum {
    let mut best: Option<Datum> = None;
    for row in group {
        let datum = row.datum(field.as_str());
        if datum.is_null() {
            continue;
        }
        best = match best {
            Some(b) if !better(&datum, &b) => Some(b),
            _ => Some(datum),
        };
    }
    best.unwrap_or(Datum::Null)
}

/// Groups incoming rows and reduces each group with a set of [`Aggregate`]s.
///
/// Each contributing row is identified by its `identity` columns so that a
/// delete-and-add of the same identity within one commit nets out to an
/// update of the group. A group becoming empty emits a retraction. Output
/// rows consist of the group-by columns plus one column per aggregate.
pub struct Reduce {
    group_by: Vec<ColumnName>,
    identity: Vec<ColumnName>,
    aggregates: Vec<Box<dyn Aggregate>>,
    groups: BTreeMap<Vec<Datum>, BTreeMap<Vec<Datum>, Row>>,
    emitted: BTreeMap<Vec<Datum>, Row>,
}

impl Reduce {
    /// Creates a reduction. An empty `group_by` folds the whole input into
    /// one group.
    pub fn new(
        group_by: Vec<ColumnName>,
        identity: Vec<ColumnName>,
        aggregates: Vec<Box<dyn Aggregate>>,
    ) -> Reduce {
        Reduce {
            group_by,
            identity,
            aggregates,
            groups: BTreeMap::new(),
            emitted: BTreeMap::new(),
        }
    }

    /// Processes one commit's delta.
    pub fn process(&mut self, delta: Delta) -> Delta {
        let mut dirty: BTreeSet<Vec<Datum>> = BTreeSet::new();
        for update in delta {
            let group_key = update.node.row.key(&self.group_by);
            let id = update.node.key(&self.identity);
            let members = self.groups.entry(group_key.clone()).or_default();
            if update.diff > 0 {
                members.insert(id, update.node.row);
            } else {
                members.remove(&id);
                if members.is_empty() {
                    self.groups.remove(&group_key);
                }
            }
            dirty.insert(group_key);
        }

        let mut out = Vec::new();
        for group_key in dirty {
            // Materialize the group into an immutable slice; the combiner
            // may iterate it any number of times and must see identical
            // membership on every pass.
            let members: Vec<Row> = self
                .groups
                .get(&group_key)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default();
            let desired = if members.is_empty() {
                None
            } else {
                let mut row = Row::new();
                for (col, datum) in self.group_by.iter().zip(group_key.iter()) {
                    row.set(col.clone(), datum.clone());
                }
                for agg in &self.aggregates {
                    row.set(agg.output_column().clone(), agg.fold(&members));
                }
                Some(row)
            };
            let previous = self.emitted.get(&group_key);
            if previous == desired.as_ref() {
                continue;
            }
            if let Some(old) = self.emitted.remove(&group_key) {
                out.push(Update::remove(ViewNode::leaf(old)));
            }
            if let Some(new) = desired {
                self.emitted.insert(group_key, new.clone());
                out.push(Update::add(ViewNode::leaf(new)));
            }
        }
        out
    }
}

impl fmt::Debug for Reduce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reduce")
            .field("group_by", &self.group_by)
            .field("aggregates", &self.aggregates)
            .field("groups", &self.groups.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: i64, owner: &str, points: i64) -> ViewNode {
        let mut r = Row::new();
        r.set("id", id);
        r.set("owner", owner);
        r.set("points", points);
        ViewNode::leaf(r)
    }

    fn reduce() -> Reduce {
        Reduce::new(
            vec!["owner".into()],
            vec!["id".into()],
            vec![
                Box::new(Count { alias: "n".into() }),
                Box::new(Sum {
                    field: "points".into(),
                    alias: "total".into(),
                }),
            ],
        )
    }

    #[test]
    fn groups_and_aggregates() {
        let mut r = reduce();
        let out = r.process(vec![
            Update::add(issue(1, "ann", 3)),
            Update::add(issue(2, "ann", 4)),
            Update::add(issue(3, "bob", 5)),
        ]);
        assert_eq!(out.len(), 2);
        let ann = &out[0].node.row;
        assert_eq!(ann.datum("owner"), Datum::String("ann".into()));
        assert_eq!(ann.datum("n"), Datum::Int(2));
        assert_eq!(ann.datum("total"), Datum::Int(7));
    }

    #[test]
    fn empty_group_retracts() {
        let mut r = reduce();
        r.process(vec![Update::add(issue(1, "ann", 3))]);
        let out = r.process(vec![Update::remove(issue(1, "ann", 3))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, -1);
        assert_eq!(out[0].node.row.datum("n"), Datum::Int(1));
    }

    #[test]
    fn replace_within_commit_updates_group_once() {
        let mut r = reduce();
        r.process(vec![Update::add(issue(1, "ann", 3))]);
        // Same identity removed and re-added with a new value in one
        // commit: one retraction of the old group row, one addition.
        let out = r.process(vec![
            Update::remove(issue(1, "ann", 3)),
            Update::add(issue(1, "ann", 9)),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].diff, -1);
        assert_eq!(out[1].node.row.datum("total"), Datum::Int(9));
    }

    #[test]
    fn unchanged_group_emits_nothing() {
        let mut r = reduce();
        r.process(vec![Update::add(issue(1, "ann", 3))]);
        let out = r.process(vec![
            Update::remove(issue(1, "ann", 3)),
            Update::add(issue(1, "ann", 3)),
        ]);
        assert!(out.is_empty());
    }

    #[test]
    fn combiner_is_pure_over_slices() {
        let agg = Sum {
            field: "points".into(),
            alias: "total".into(),
        };
        let rows: Vec<Row> = vec![
            issue(1, "ann", 3).row,
            issue(2, "ann", 4).row,
        ];
        // Multiple passes over the same immutable slice agree.
        assert_eq!(agg.fold(&rows), agg.fold(&rows));
        assert_eq!(agg.fold(&rows), Datum::Int(7));
    }

    #[test]
    fn whole_table_fold_with_empty_group_by() {
        let mut r = Reduce::new(
            vec![],
            vec!["id".into()],
            vec![Box::new(Max {
                field: "points".into(),
                alias: "most".into(),
            })],
        );
        let out = r.process(vec![
            Update::add(issue(1, "ann", 3)),
            Update::add(issue(2, "bob", 8)),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].node.row.datum("most"), Datum::Int(8));
    }

    #[test]
    fn null_handling_in_aggregates() {
        let mut row = Row::new();
        row.set("id", 1i64);
        row.set("points", Datum::Null);
        let rows = vec![row];
        assert_eq!(
            Sum { field: "points".into(), alias: "s".into() }.fold(&rows),
            Datum::Null
        );
        assert_eq!(
            Min { field: "points".into(), alias: "m".into() }.fold(&rows),
            Datum::Null
        );
        assert_eq!(
            Count { alias: "c".into() }.fold(&rows),
            Datum::Int(1)
        );
        assert_eq!(
            ArrayAgg { field: "points".into(), alias: "a".into() }.fold(&rows),
            Datum::Array(vec![])
        );
    }
}
