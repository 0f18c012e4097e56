// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use lens_repr::Row;

use crate::node::Delta;

/// A compiled row predicate.
///
/// Implemented by the query layer's condition evaluator; kept as a trait so
/// the operator set does not depend on the query language.
pub trait Predicate: Send {
    /// Evaluates the predicate against a row.
    fn eval(&self, row: &Row) -> bool;

    /// A short human-readable description, for diagnostics.
    fn describe(&self) -> String;
}

impl<F> Predicate for F
where
    F: Fn(&Row) -> bool + Send,
{
    fn eval(&self, row: &Row) -> bool {
        self(row)
    }

    fn describe(&self) -> String {
        "<closure>".into()
    }
}

/// Filters incoming nodes according to some predicate. Pure; no state.
pub struct Filter {
    predicate: Box<dyn Predicate>,
}

impl Filter {
    /// Creates a filter over the given predicate.
    pub fn new(predicate: Box<dyn Predicate>) -> Filter {
        Filter { predicate }
    }

    /// Passes through the updates whose rows satisfy the predicate.
    pub fn process(&mut self, delta: Delta) -> Delta {
        delta
            .into_iter()
            .filter(|update| self.predicate.eval(&update.node.row))
            .collect()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("predicate", &self.predicate.describe())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use lens_repr::Datum;

    use super::*;
    use crate::node::Update;

    fn row(id: i64) -> Row {
        let mut r = Row::new();
        r.set("id", id);
        r
    }

    #[test]
    fn passes_matching_rows_in_both_directions() {
        let mut f = Filter::new(Box::new(|row: &Row| row.datum("id") > Datum::Int(5)));
        let delta = vec![
            Update::add(row(3)),
            Update::add(row(7)),
            Update::remove(row(9)),
        ];
        let out = f.process(delta);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].node.row.datum("id"), Datum::Int(7));
        assert_eq!(out[1].diff, -1);
    }

    #[test]
    fn retraction_of_filtered_row_is_dropped() {
        let mut f = Filter::new(Box::new(|row: &Row| row.datum("id") > Datum::Int(5)));
        assert!(f.process(vec![Update::remove(row(1))]).is_empty());
    }
}
