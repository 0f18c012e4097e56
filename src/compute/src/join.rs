// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};

use lens_repr::{ColumnName, Datum};

use crate::node::{Delta, Update, ViewNode};

/// The flavor of a [`Join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Parents without matching children are dropped.
    Inner,
    /// Parents without matching children are emitted with an empty
    /// relationship list.
    Left,
}

/// The child-side index of a join: child nodes keyed by their join-column
/// datum, then by child identity.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    by_key: BTreeMap<Datum, BTreeMap<Vec<Datum>, ViewNode>>,
}

impl MemoryStorage {
    fn insert(&mut self, key: Datum, id: Vec<Datum>, node: ViewNode) {
        self.by_key.entry(key).or_default().insert(id, node);
    }

    fn remove(&mut self, key: &Datum, id: &[Datum]) {
        if let Some(children) = self.by_key.get_mut(key) {
            children.remove(id);
            if children.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    fn children(&self, key: &Datum) -> Vec<ViewNode> {
        match self.by_key.get(key) {
            Some(children) => children.values().cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// An equijoin that annotates each parent node with the child nodes whose
/// join column matches, under a named relationship.
///
/// The operator diffs its output against the nodes it last emitted, so a
/// commit that touches both sides, or touches one child several times,
/// collapses to the net add/remove/edit per parent.
#[derive(Debug)]
pub struct Join {
    kind: JoinKind,
    relationship: String,
    parent_key: ColumnName,
    child_key: ColumnName,
    parent_id: Vec<ColumnName>,
    child_id: Vec<ColumnName>,
    hidden: bool,

    storage: MemoryStorage,
    parents: BTreeMap<Vec<Datum>, ViewNode>,
    parents_by_key: BTreeMap<Datum, BTreeSet<Vec<Datum>>>,
    emitted: BTreeMap<Vec<Datum>, ViewNode>,
}

impl Join {
    /// Creates a join.
    ///
    /// `parent_id` and `child_id` are the identity (primary key) columns of
    /// the respective inputs; `hidden` marks relationships that exist only
    /// to support the query (junction hops) and should not be surfaced to
    /// clients.
    pub fn new(
        kind: JoinKind,
        relationship: impl Into<String>,
        parent_key: ColumnName,
        child_key: ColumnName,
        parent_id: Vec<ColumnName>,
        child_id: Vec<ColumnName>,
        storage: MemoryStorage,
        hidden: bool,
    ) -> Join {
        Join {
            kind,
            relationship: relationship.into(),
            parent_key,
            child_key,
            parent_id,
            child_id,
            hidden,
            storage,
            parents: BTreeMap::new(),
            parents_by_key: BTreeMap::new(),
            emitted: BTreeMap::new(),
        }
    }

    /// The relationship name this join populates.
    pub fn relationship(&self) -> &str {
        &self.relationship
    }

    /// Whether this relationship is hidden from clients.
    pub fn hidden(&self) -> bool {
        self.hidden
    }

    /// Processes one commit's parent- and child-side deltas.
    pub fn process(&mut self, parent_delta: Delta, child_delta: Delta) -> Delta {
        let mut affected: BTreeSet<Vec<Datum>> = BTreeSet::new();

        // Apply the child side first and remember which join keys moved.
        for update in child_delta {
            let key = update.node.row.datum(self.child_key.as_str());
            let id = update.node.key(&self.child_id);
            if update.diff > 0 {
                self.storage.insert(key.clone(), id, update.node);
            } else {
                self.storage.remove(&key, &id);
            }
            if let Some(parents) = self.parents_by_key.get(&key) {
                affected.extend(parents.iter().cloned());
            }
        }

        // Then the parent side.
        for update in parent_delta {
            let key = update.node.row.datum(self.parent_key.as_str());
            let id = update.node.key(&self.parent_id);
            if update.diff > 0 {
                self.parents.insert(id.clone(), update.node);
                self.parents_by_key.entry(key).or_default().insert(id.clone());
            } else {
                if let Some(old) = self.parents.remove(&id) {
                    let old_key = old.row.datum(self.parent_key.as_str());
                    if let Some(ids) = self.parents_by_key.get_mut(&old_key) {
                        ids.remove(&id);
                        if ids.is_empty() {
                            self.parents_by_key.remove(&old_key);
                        }
                    }
                }
            }
            affected.insert(id);
        }

        // Re-derive the output for every affected parent and emit the diff
        // against what was last emitted.
        let mut out = Vec::new();
        for id in affected {
            let desired = self.parents.get(&id).and_then(|parent| {
                let key = parent.row.datum(self.parent_key.as_str());
                // A null join key matches nothing.
                let children = if key.is_null() {
                    Vec::new()
                } else {
                    self.storage.children(&key)
                };
                match self.kind {
                    JoinKind::Inner if children.is_empty() => None,
                    _ => {
                        let mut node = parent.clone();
                        node.relationships
                            .insert(self.relationship.clone(), children);
                        Some(node)
                    }
                }
            });
            let previous = self.emitted.get(&id);
            if previous == desired.as_ref() {
                continue;
            }
            if let Some(old) = self.emitted.remove(&id) {
                out.push(Update::remove(old));
            }
            if let Some(new) = desired {
                self.emitted.insert(id, new.clone());
                out.push(Update::add(new));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use lens_repr::Row;

    use super::*;

    fn issue(id: i64, owner: i64) -> ViewNode {
        let mut r = Row::new();
        r.set("id", id);
        r.set("owner_id", owner);
        ViewNode::leaf(r)
    }

    fn user(id: i64, name: &str) -> ViewNode {
        let mut r = Row::new();
        r.set("id", id);
        r.set("name", name);
        ViewNode::leaf(r)
    }

    fn join(kind: JoinKind) -> Join {
        Join::new(
            kind,
            "owner",
            "owner_id".into(),
            "id".into(),
            vec!["id".into()],
            vec!["id".into()],
            MemoryStorage::default(),
            false,
        )
    }

    #[test]
    fn inner_join_matches_and_annotates() {
        let mut j = join(JoinKind::Inner);
        let out = j.process(
            vec![Update::add(issue(1, 100)), Update::add(issue(2, 999))],
            vec![Update::add(user(100, "alice"))],
        );
        // Only issue 1 has a matching owner.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].node.row.datum("id"), Datum::Int(1));
        assert_eq!(out[0].node.relationships["owner"].len(), 1);
    }

    #[test]
    fn left_join_emits_empty_relationships() {
        let mut j = join(JoinKind::Left);
        let out = j.process(vec![Update::add(issue(2, 999))], vec![]);
        assert_eq!(out.len(), 1);
        assert!(out[0].node.relationships["owner"].is_empty());
    }

    #[test]
    fn child_arrival_upgrades_parent() {
        let mut j = join(JoinKind::Inner);
        assert!(j
            .process(vec![Update::add(issue(1, 100))], vec![])
            .is_empty());
        let out = j.process(vec![], vec![Update::add(user(100, "alice"))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, 1);

        // And the child leaving retracts it again.
        let out = j.process(vec![], vec![Update::remove(user(100, "alice"))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, -1);
    }

    #[test]
    fn child_edit_replaces_annotated_parent() {
        let mut j = join(JoinKind::Left);
        j.process(
            vec![Update::add(issue(1, 100))],
            vec![Update::add(user(100, "alice"))],
        );
        let out = j.process(
            vec![],
            vec![
                Update::remove(user(100, "alice")),
                Update::add(user(100, "alicia")),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].diff, -1);
        assert_eq!(
            out[0].node.relationships["owner"][0].row.datum("name"),
            Datum::String("alice".into())
        );
        assert_eq!(
            out[1].node.relationships["owner"][0].row.datum("name"),
            Datum::String("alicia".into())
        );
    }

    #[test]
    fn add_then_remove_is_idempotent() {
        let mut j = join(JoinKind::Inner);
        j.process(
            vec![Update::add(issue(1, 100))],
            vec![Update::add(user(100, "alice"))],
        );
        let before = format!("{j:?}");
        let out = j.process(vec![Update::add(issue(3, 100))], vec![]);
        assert_eq!(out.len(), 1);
        let out = j.process(vec![Update::remove(issue(3, 100))], vec![]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, -1);
        assert_eq!(before, format!("{j:?}"));
    }

    #[test]
    fn null_join_key_matches_nothing() {
        let mut j = join(JoinKind::Inner);
        let mut r = Row::new();
        r.set("id", 1i64);
        r.set("owner_id", Datum::Null);
        let out = j.process(
            vec![Update::add(ViewNode::leaf(r))],
            vec![Update::add(user(100, "alice"))],
        );
        assert!(out.is_empty());
    }

    #[test]
    fn same_commit_changes_collapse() {
        let mut j = join(JoinKind::Left);
        j.process(
            vec![Update::add(issue(1, 100))],
            vec![Update::add(user(100, "alice"))],
        );
        // Parent edit and child edit in one commit produce a single
        // replace pair, not intermediate states.
        let out = j.process(
            vec![
                Update::remove(issue(1, 100)),
                Update::add(issue(1, 100)),
            ],
            vec![
                Update::remove(user(100, "alice")),
                Update::add(user(100, "alya")),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].diff, -1);
        assert_eq!(out[1].diff, 1);
        assert_eq!(
            out[1].node.relationships["owner"][0].row.datum("name"),
            Datum::String("alya".into())
        );
    }
}
