// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared types for the Lens change stream.
//!
//! These types form the vocabulary spoken between the change source, the
//! change log, the replica apply path, and every change-stream subscriber.
//! They are serialization-stable: encoded [`ChangeEntry`]s are persisted in
//! the change log and must remain readable across versions.

#![warn(missing_debug_implementations)]

pub mod sources;

pub use sources::{Change, ChangeEntry, TableRef, Transaction};
