// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The operator arena.
//!
//! A [`Pipeline`] owns its operators outright and addresses them by index;
//! edges refer to upstream operators by [`OperatorId`] only, so the graph
//! has no ownership cycles. Builders append operators upstream-first, which
//! makes the arena order a topological order and lets one forward pass per
//! commit carry every delta to the root.

use std::collections::BTreeMap;

use lens_repr::{Datum, Row};
use lens_storage_types::TableRef;

use crate::catch::Catch;
use crate::concat::Concat;
use crate::distinct::Distinct;
use crate::filter::Filter;
use crate::join::Join;
use crate::node::Delta;
use crate::reduce::Reduce;
use crate::source::MemorySource;
use crate::view::TreeView;
use crate::ViewNode;

/// Identifies an operator within its [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OperatorId(usize);

/// A change pushed into a [`MemorySource`] at a commit boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChange {
    /// A new row.
    Insert {
        /// The full row.
        row: Row,
    },
    /// A changed row.
    Edit {
        /// The row's previous key, when the key itself changed.
        old_key: Option<Vec<Datum>>,
        /// The full new row.
        row: Row,
    },
    /// A removed row.
    Delete {
        /// The removed row's key.
        key: Vec<Datum>,
    },
    /// Removal of every row.
    Truncate,
}

/// One of the closed set of dataflow operators.
#[derive(Debug)]
pub enum Operator {
    /// A table scan fed by the replication stream.
    Source(MemorySource),
    /// A predicate filter.
    Filter(Filter),
    /// An equijoin attaching child rows to parent rows.
    Join(Join),
    /// A grouped reduction.
    Reduce(Reduce),
    /// A union of branches.
    Concat(Concat),
    /// Multiset-to-set deduplication.
    Distinct(Distinct),
    /// The ordered, materialized result tree.
    View(TreeView),
    /// A test sink that records every delta it sees.
    Catch(Catch),
}

impl Operator {
    fn input_arity_ok(&self, n: usize) -> bool {
        match self {
            Operator::Source(_) => n == 0,
            Operator::Filter(_)
            | Operator::Reduce(_)
            | Operator::Distinct(_)
            | Operator::View(_)
            | Operator::Catch(_) => n == 1,
            Operator::Join(_) => n == 2,
            Operator::Concat(_) => n >= 1,
        }
    }

    fn process(&mut self, mut inputs: Vec<Delta>) -> Delta {
        match self {
            Operator::Source(op) => op.process(),
            Operator::Filter(op) => op.process(inputs.remove(0)),
            Operator::Join(op) => {
                let child = inputs.remove(1);
                let parent = inputs.remove(0);
                op.process(parent, child)
            }
            Operator::Reduce(op) => op.process(inputs.remove(0)),
            Operator::Concat(op) => op.process(inputs),
            Operator::Distinct(op) => op.process(inputs.remove(0)),
            Operator::View(op) => op.process(inputs.remove(0)),
            Operator::Catch(op) => op.process(inputs.remove(0)),
        }
    }

    fn hydrate(&mut self, inputs: Vec<Delta>) -> Delta {
        match self {
            // A source's initial contents are everything it holds.
            Operator::Source(op) => op.hydrate(),
            // Every other operator hydrates by processing its inputs' full
            // contents as an all-additions delta against empty state.
            _ => self.process(inputs),
        }
    }
}

/// Builds a [`Pipeline`] by appending operators upstream-first.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    ops: Vec<(Operator, Vec<OperatorId>)>,
    sources: BTreeMap<TableRef, OperatorId>,
}

impl PipelineBuilder {
    /// Creates an empty builder.
    pub fn new() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Adds a source operator and registers it under its table name.
    pub fn add_source(&mut self, source: MemorySource) -> OperatorId {
        let table = source.table();
        let id = OperatorId(self.ops.len());
        self.ops.push((Operator::Source(source), Vec::new()));
        self.sources.insert(table, id);
        id
    }

    /// Adds an operator reading from `inputs`, which must already be part
    /// of the graph.
    pub fn add(
        &mut self,
        op: Operator,
        inputs: Vec<OperatorId>,
    ) -> Result<OperatorId, PipelineError> {
        let id = OperatorId(self.ops.len());
        if !op.input_arity_ok(inputs.len()) {
            return Err(PipelineError::BadArity {
                operator: format!("{op:?}"),
                inputs: inputs.len(),
            });
        }
        if inputs.iter().any(|input| input.0 >= id.0) {
            return Err(PipelineError::ForwardEdge);
        }
        self.ops.push((op, inputs));
        Ok(id)
    }

    /// Finishes the pipeline with `root` as its output operator. The root
    /// must be a [`TreeView`] (or a [`Catch`] in tests) so that results have
    /// a declared order.
    pub fn finish(self, root: OperatorId) -> Result<Pipeline, PipelineError> {
        match self.ops.get(root.0) {
            Some((Operator::View(_) | Operator::Catch(_), _)) => {}
            _ => return Err(PipelineError::UnorderedRoot),
        }
        Ok(Pipeline {
            ops: self.ops,
            sources: self.sources,
            root,
            hydrated: false,
        })
    }
}

/// A compiled, incrementally-maintained query.
#[derive(Debug)]
pub struct Pipeline {
    ops: Vec<(Operator, Vec<OperatorId>)>,
    sources: BTreeMap<TableRef, OperatorId>,
    root: OperatorId,
    hydrated: bool,
}

impl Pipeline {
    /// The tables this pipeline reads.
    pub fn tables(&self) -> impl Iterator<Item = &TableRef> {
        self.sources.keys()
    }

    /// Stages a change onto the named table's source. The change takes
    /// effect at the next [`Pipeline::commit`].
    pub fn push(&mut self, table: &TableRef, change: SourceChange) -> Result<(), PipelineError> {
        let id = self
            .sources
            .get(table)
            .ok_or_else(|| PipelineError::UnknownTable(table.clone()))?;
        match &mut self.ops[id.0].0 {
            Operator::Source(source) => {
                source.stage(change);
                Ok(())
            }
            _ => unreachable!("sources map only holds sources"),
        }
    }

    /// Performs the initial full fetch, populating every operator's state
    /// and the root view. Returns the root's initial contents as an
    /// all-additions delta.
    pub fn hydrate(&mut self) -> Result<Delta, PipelineError> {
        if self.hydrated {
            return Err(PipelineError::AlreadyHydrated);
        }
        self.hydrated = true;
        Ok(self.run(true))
    }

    /// Drains every source's staged changes through the graph, returning
    /// the root's output delta for this commit.
    pub fn commit(&mut self) -> Result<Delta, PipelineError> {
        if !self.hydrated {
            return Err(PipelineError::NotHydrated);
        }
        Ok(self.run(false))
    }

    fn run(&mut self, hydrate: bool) -> Delta {
        let mut outputs: Vec<Delta> = Vec::with_capacity(self.ops.len());
        for i in 0..self.ops.len() {
            let inputs: Vec<Delta> = self.ops[i]
                .1
                .iter()
                .map(|input| outputs[input.0].clone())
                .collect();
            let out = if hydrate {
                self.ops[i].0.hydrate(inputs)
            } else {
                self.ops[i].0.process(inputs)
            };
            outputs.push(out);
        }
        outputs.swap_remove(self.root.0)
    }

    /// The materialized result, in view order, honoring the view's limit.
    pub fn results(&self) -> Vec<&ViewNode> {
        match &self.ops[self.root.0].0 {
            Operator::View(view) => view.fetch(),
            _ => Vec::new(),
        }
    }

    /// The root view, if the pipeline is rooted in one.
    pub fn view(&self) -> Option<&TreeView> {
        match &self.ops[self.root.0].0 {
            Operator::View(view) => Some(view),
            _ => None,
        }
    }

    /// Test access to a [`Catch`] root.
    pub fn catch(&self) -> Option<&Catch> {
        match &self.ops[self.root.0].0 {
            Operator::Catch(catch) => Some(catch),
            _ => None,
        }
    }
}

/// An error in pipeline construction or operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// The pipeline has no source for the pushed table.
    #[error("no source for table {0}")]
    UnknownTable(TableRef),
    /// An operator was given the wrong number of inputs.
    #[error("operator {operator} cannot take {inputs} inputs")]
    BadArity {
        /// The offending operator.
        operator: String,
        /// The number of inputs supplied.
        inputs: usize,
    },
    /// An operator referenced an input added after it.
    #[error("operator inputs must be added before the operator")]
    ForwardEdge,
    /// The root operator does not declare an order.
    #[error("pipeline root must be an ordered view")]
    UnorderedRoot,
    /// `commit` was called before `hydrate`.
    #[error("pipeline has not been hydrated")]
    NotHydrated,
    /// `hydrate` was called twice.
    #[error("pipeline is already hydrated")]
    AlreadyHydrated,
}

#[cfg(test)]
mod tests {
    use lens_repr::{RelationDesc, ScalarType};

    use super::*;
    use crate::view::TreeView;

    fn users_desc() -> RelationDesc {
        RelationDesc::new("public", "users")
            .with_column("id", ScalarType::Int8, false)
            .with_column("name", ScalarType::Text, true)
            .with_key(vec!["id".into()])
    }

    fn user(id: i64, name: &str) -> Row {
        let mut r = Row::new();
        r.set("id", id);
        r.set("name", name);
        r
    }

    #[test]
    fn source_to_view_round_trip() {
        let mut b = PipelineBuilder::new();
        let desc = users_desc();
        let src = b.add_source(MemorySource::new(desc.clone()));
        let view = b
            .add(
                Operator::View(TreeView::new(vec![], vec!["id".into()], None)),
                vec![src],
            )
            .unwrap();
        let mut p = b.finish(view).unwrap();

        let table = TableRef::new("public", "users");
        p.push(
            &table,
            SourceChange::Insert {
                row: user(2, "bea"),
            },
        )
        .unwrap();
        p.push(
            &table,
            SourceChange::Insert {
                row: user(1, "abe"),
            },
        )
        .unwrap();

        // Pushes before hydration surface at hydrate time.
        let delta = p.hydrate().unwrap();
        assert_eq!(delta.len(), 2);
        let ids: Vec<_> = p
            .results()
            .iter()
            .map(|n| n.row.datum("id"))
            .collect();
        assert_eq!(ids, vec![Datum::Int(1), Datum::Int(2)]);

        p.push(&table, SourceChange::Delete {
            key: vec![Datum::Int(1)],
        })
        .unwrap();
        let delta = p.commit().unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].diff, -1);
        assert_eq!(p.results().len(), 1);
    }

    #[test]
    fn builder_rejects_bad_shapes() {
        let mut b = PipelineBuilder::new();
        let src = b.add_source(MemorySource::new(users_desc()));
        assert_eq!(
            b.add(Operator::Concat(Concat::default()), vec![])
                .unwrap_err(),
            PipelineError::BadArity {
                operator: "Concat(Concat)".into(),
                inputs: 0
            }
        );
        // A bare source is not an acceptable root.
        assert_eq!(
            b.finish(src).unwrap_err(),
            PipelineError::UnorderedRoot
        );
    }

    #[test]
    fn commit_requires_hydration() {
        let mut b = PipelineBuilder::new();
        let src = b.add_source(MemorySource::new(users_desc()));
        let view = b
            .add(
                Operator::View(TreeView::new(vec![], vec!["id".into()], None)),
                vec![src],
            )
            .unwrap();
        let mut p = b.finish(view).unwrap();
        assert_eq!(p.commit().unwrap_err(), PipelineError::NotHydrated);
        p.hydrate().unwrap();
        assert_eq!(p.hydrate().unwrap_err(), PipelineError::AlreadyHydrated);
    }
}
