// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use lens_repr::{ColumnName, Datum, SortOrder};

use crate::node::{consolidate, Delta, Update, ViewNode};

/// The ordered, materialized result of a pipeline.
///
/// The tree is keyed by the declared ordering columns with the node identity
/// as tiebreaker. A retraction immediately followed by an addition of the
/// same identity within one commit is treated as an in-place replace: one
/// seek instead of two rebalances, and downstream consumers see an edit
/// rather than a remove/add pair.
#[derive(Debug)]
pub struct TreeView {
    order_by: Vec<(ColumnName, SortOrder)>,
    key: Vec<ColumnName>,
    limit: Option<usize>,
    tree: BTreeMap<SortKey, ViewNode>,
    by_identity: BTreeMap<Vec<Datum>, SortKey>,
}

impl TreeView {
    /// Creates an empty view ordered by `order_by` (with the identity
    /// columns as tiebreaker) and truncated at `limit` rows on fetch.
    pub fn new(
        order_by: Vec<(ColumnName, SortOrder)>,
        key: Vec<ColumnName>,
        limit: Option<usize>,
    ) -> TreeView {
        TreeView {
            order_by,
            key,
            limit,
            tree: BTreeMap::new(),
            by_identity: BTreeMap::new(),
        }
    }

    fn sort_key(&self, node: &ViewNode) -> SortKey {
        let mut datums = Vec::with_capacity(self.order_by.len());
        for (col, order) in &self.order_by {
            datums.push(OrderedDatum {
                datum: node.row.datum(col.as_str()),
                desc: matches!(order, SortOrder::Desc),
            });
        }
        SortKey {
            datums,
            identity: node.key(&self.key),
        }
    }

    /// Applies one commit's delta to the tree and passes the net delta on.
    ///
    /// Removals apply before additions so that a retraction and an addition
    /// of the same identity within one commit act as an in-place replace
    /// rather than deleting the fresh entry.
    pub fn process(&mut self, delta: Delta) -> Delta {
        let delta = consolidate(delta);
        for update in delta.iter().filter(|u| u.diff < 0) {
            let identity = update.node.key(&self.key);
            if let Some(key) = self.by_identity.remove(&identity) {
                self.tree.remove(&key);
            }
        }
        for update in delta.iter().filter(|u| u.diff > 0) {
            let identity = update.node.key(&self.key);
            if let Some(old_key) = self.by_identity.remove(&identity) {
                self.tree.remove(&old_key);
            }
            let key = self.sort_key(&update.node);
            self.by_identity.insert(identity, key.clone());
            self.tree.insert(key, update.node.clone());
        }
        delta
    }

    /// The view contents in declared order, truncated to the limit.
    pub fn fetch(&self) -> Vec<&ViewNode> {
        let limit = self.limit.unwrap_or(usize::MAX);
        self.tree.values().take(limit).collect()
    }

    /// The number of rows materialized (ignoring the limit).
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Reports whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// A datum ordered according to its column's declared direction.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OrderedDatum {
    datum: Datum,
    desc: bool,
}

impl PartialOrd for OrderedDatum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedDatum {
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = self.datum.cmp(&other.datum);
        if self.desc {
            ord.reverse()
        } else {
            ord
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    datums: Vec<OrderedDatum>,
    identity: Vec<Datum>,
}
