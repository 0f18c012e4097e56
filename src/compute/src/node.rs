// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use lens_repr::{ColumnName, Datum, Diff, Row};

/// A row annotated with the child rows joined beneath it.
///
/// Plain scans and reductions produce leaf nodes; each [`crate::Join`] in a
/// query adds one named relationship layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewNode {
    /// The node's own row.
    pub row: Row,
    /// Child rows, keyed by relationship name, in child order.
    pub relationships: BTreeMap<String, Vec<ViewNode>>,
}

impl ViewNode {
    /// Creates a node with no relationships.
    pub fn leaf(row: Row) -> ViewNode {
        ViewNode {
            row,
            relationships: BTreeMap::new(),
        }
    }

    /// The node's identity: the datums of its key columns.
    pub fn key(&self, key_columns: &[ColumnName]) -> Vec<Datum> {
        self.row.key(key_columns)
    }
}

impl From<Row> for ViewNode {
    fn from(row: Row) -> ViewNode {
        ViewNode::leaf(row)
    }
}

/// One element of a multiset delta: a node and its multiplicity change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// The affected node.
    pub node: ViewNode,
    /// The multiplicity change; never zero.
    pub diff: Diff,
}

impl Update {
    /// An insertion.
    pub fn add(node: impl Into<ViewNode>) -> Update {
        Update {
            node: node.into(),
            diff: 1,
        }
    }

    /// A removal.
    pub fn remove(node: impl Into<ViewNode>) -> Update {
        Update {
            node: node.into(),
            diff: -1,
        }
    }
}

/// A multiset delta: the unit of data exchanged between operators at each
/// commit boundary.
pub type Delta = Vec<Update>;

/// Collapses a delta to its net effect: equal nodes have their diffs summed
/// and zero-diff entries are dropped. Output order follows the node order.
pub fn consolidate(delta: Delta) -> Delta {
    let mut net: BTreeMap<ViewNode, Diff> = BTreeMap::new();
    for update in delta {
        *net.entry(update.node).or_insert(0) += update.diff;
    }
    net.into_iter()
        .filter(|(_, diff)| *diff != 0)
        .map(|(node, diff)| Update { node, diff })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> Row {
        let mut r = Row::new();
        r.set("id", id);
        r
    }

    #[test]
    fn consolidate_cancels_inverses() {
        let delta = vec![
            Update::add(row(1)),
            Update::add(row(2)),
            Update::remove(row(1)),
        ];
        let out = consolidate(delta);
        assert_eq!(out, vec![Update::add(row(2))]);
    }

    #[test]
    fn consolidate_sums_multiplicities() {
        let delta = vec![Update::add(row(1)), Update::add(row(1))];
        let out = consolidate(delta);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, 2);
    }

    #[test]
    fn node_key_uses_key_columns() {
        let node = ViewNode::leaf(row(9));
        assert_eq!(node.key(&["id".into()]), vec![Datum::Int(9)]);
    }
}
