// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::node::Delta;

/// A test sink that records every delta pushed into it, for assertions in
/// operator and compiler tests.
#[derive(Debug, Default)]
pub struct Catch {
    deltas: Vec<Delta>,
}

impl Catch {
    /// Creates an empty sink.
    pub fn new() -> Catch {
        Catch::default()
    }

    /// Records and passes through one commit's delta.
    pub fn process(&mut self, delta: Delta) -> Delta {
        self.deltas.push(delta.clone());
        delta
    }

    /// Every delta seen so far, in commit order.
    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    /// The most recent delta.
    pub fn last(&self) -> Option<&Delta> {
        self.deltas.last()
    }
}
