// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fundamental data representation.
//!
//! This crate contains the types for representing data that all layers of the
//! stack can understand. Think of it as the _lingua franca_: individual layers
//! may use different representations internally, but they all agree to use
//! this representation at their boundaries.
//!
//! * The core value type is the [`Datum`] enum, which represents a literal
//!   value with a total order suitable for index keys.
//! * [`Row`] extends a `Datum` horizontally into a named-column record, and
//!   carries the reserved `_0_version` column.
//! * [`RelationDesc`] describes the shape of a replicated table: its columns,
//!   primary key, and indexes.
//! * [`LexiVersion`] is the lexicographically-ordered version string derived
//!   from the upstream log sequence number; every committed transaction and
//!   every row it writes is stamped with one.

#![warn(missing_debug_implementations)]

mod lexi;
mod relation;
mod row;
mod scalar;

pub use lexi::LexiVersion;
pub use relation::{ColumnName, ColumnType, IndexDesc, RelationDesc, SortOrder};
pub use row::{Row, VERSION_COLUMN};
pub use scalar::{Datum, ScalarType, UnrepresentableError, MAX_SAFE_INTEGER};

/// System-wide record count difference type.
pub type Diff = i64;
