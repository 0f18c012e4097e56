// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Incremental view maintenance.
//!
//! A query compiles into a [`Pipeline`]: an arena of dataflow operators
//! rooted at one or more [`MemorySource`]s and terminating in a [`TreeView`]
//! that holds the materialized, ordered result. At every upstream commit the
//! pipeline's sources are fed the commit's changes and the resulting
//! multiset deltas flow through the operator graph; the view's output delta
//! is what the caller diffs against client state.
//!
//! The operator set is closed: [`MemorySource`], [`Filter`], [`Join`],
//! [`Reduce`], [`Concat`], [`Distinct`], [`TreeView`], and the [`Catch`]
//! test sink. Operators share a uniform capability surface: `hydrate` (full
//! fetch at subscription time) and `process` (push one commit's delta).
//! Aggregation is open for extension through the [`Aggregate`] strategy
//! trait.

#![warn(missing_debug_implementations)]

mod catch;
mod concat;
mod distinct;
mod filter;
mod join;
mod node;
mod pipeline;
mod reduce;
mod source;
mod view;

pub use catch::Catch;
pub use concat::Concat;
pub use distinct::Distinct;
pub use filter::{Filter, Predicate};
pub use join::{Join, JoinKind, MemoryStorage};
pub use node::{consolidate, Delta, Update, ViewNode};
pub use pipeline::{Operator, OperatorId, Pipeline, PipelineBuilder, PipelineError, SourceChange};
pub use reduce::{Aggregate, ArrayAgg, Avg, Count, Max, Min, Reduce, Sum};
pub use source::MemorySource;
pub use view::TreeView;
