// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use lens_repr::{ColumnName, Datum};

use crate::node::{consolidate, Delta, Update, ViewNode};

/// Collapses a multiset to a set.
///
/// Each key's first appearance emits an addition; its multiplicity dropping
/// back to zero emits a retraction. Used to deduplicate the branches of an
/// `OR` and to implement `distinct(column)`.
#[derive(Debug)]
pub struct Distinct {
    key: Vec<ColumnName>,
    counts: BTreeMap<Vec<Datum>, (i64, ViewNode)>,
}

impl Distinct {
    /// Creates a distinct keyed by the given columns (the row identity for
    /// branch deduplication, or the single distinct-on column).
    pub fn new(key: Vec<ColumnName>) -> Distinct {
        Distinct {
            key,
            counts: BTreeMap::new(),
        }
    }

    /// Processes one commit's delta.
    pub fn process(&mut self, delta: Delta) -> Delta {
        // Group the commit's net updates by key so that each key emits at
        // most one add/remove/replace regardless of how many branches
        // touched it.
        let mut by_key: BTreeMap<Vec<Datum>, Vec<Update>> = BTreeMap::new();
        for update in consolidate(delta) {
            by_key
                .entry(update.node.key(&self.key))
                .or_default()
                .push(update);
        }

        let mut out = Vec::new();
        for (key, updates) in by_key {
            let net: i64 = updates.iter().map(|u| u.diff).sum();
            let latest_added = updates
                .iter()
                .filter(|u| u.diff > 0)
                .map(|u| u.node.clone())
                .next_back();
            let before = self.counts.get(&key).map(|(n, _)| *n).unwrap_or(0);
            let after = before + net;
            let emitted = self.counts.get(&key).map(|(_, node)| node.clone());
            if before <= 0 && after > 0 {
                let node = latest_added.expect("positive count requires an addition");
                self.counts.insert(key, (after, node.clone()));
                out.push(Update::add(node));
            } else if before > 0 && after <= 0 {
                self.counts.remove(&key);
                out.push(Update::remove(emitted.expect("entry exists")));
            } else if after > 0 {
                // Still present; surface a content change as a replace.
                let node = latest_added.unwrap_or_else(|| emitted.clone().expect("entry exists"));
                if emitted.as_ref() != Some(&node) {
                    out.push(Update::remove(emitted.expect("entry exists")));
                    out.push(Update::add(node.clone()));
                }
                self.counts.insert(key, (after, node));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use lens_repr::Row;

    use super::*;

    fn node(id: i64) -> ViewNode {
        let mut r = Row::new();
        r.set("id", id);
        ViewNode::leaf(r)
    }

    fn distinct() -> Distinct {
        Distinct::new(vec!["id".into()])
    }

    #[test]
    fn duplicate_additions_emit_once() {
        let mut d = distinct();
        let out = d.process(vec![Update::add(node(1)), Update::add(node(1))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, 1);
        // The duplicate going away changes nothing.
        let out = d.process(vec![Update::remove(node(1))]);
        assert!(out.is_empty());
        // The last copy going away retracts.
        let out = d.process(vec![Update::remove(node(1))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, -1);
    }

    #[test]
    fn surviving_key_with_new_content_emits_replace() {
        let mut d = Distinct::new(vec!["id".into()]);
        let mut old = Row::new();
        old.set("id", 1i64);
        old.set("title", "draft");
        let mut new = Row::new();
        new.set("id", 1i64);
        new.set("title", "final");
        d.process(vec![Update::add(ViewNode::leaf(old.clone()))]);
        let out = d.process(vec![
            Update::remove(ViewNode::leaf(old)),
            Update::add(ViewNode::leaf(new.clone())),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].diff, -1);
        assert_eq!(out[1].node.row, new);
    }

    #[test]
    fn within_commit_noise_collapses() {
        let mut d = distinct();
        let out = d.process(vec![
            Update::add(node(1)),
            Update::remove(node(1)),
        ]);
        assert!(out.is_empty());
    }
}
