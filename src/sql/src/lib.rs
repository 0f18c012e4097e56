// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client query language.
//!
//! Clients describe queries as a JSON AST ([`ast::Ast`]); this crate
//! validates an AST against the replicated schema and lowers it into an
//! incrementally-maintained [`lens_compute::Pipeline`]. Compilation is
//! all-or-nothing: a query that names an unknown column, carries a bad
//! limit, or compares across types is rejected without side effects.

#![warn(missing_debug_implementations)]

pub mod ast;
pub mod compile;
pub mod condition;
pub mod like;

pub use compile::{CompileError, CompiledQuery, ResultShape};
