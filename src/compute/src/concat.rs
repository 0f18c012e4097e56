// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::node::Delta;

/// Merges the deltas of several branches into one stream, preserving
/// branch order. Stateless; deduplication is a downstream
/// [`crate::Distinct`]'s job.
#[derive(Debug, Default)]
pub struct Concat;

impl Concat {
    /// Processes one commit's per-branch deltas.
    pub fn process(&mut self, inputs: Vec<Delta>) -> Delta {
        inputs.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use lens_repr::Row;

    use super::*;
    use crate::node::Update;

    #[test]
    fn branches_merge_in_order() {
        let mut row_a = Row::new();
        row_a.set("id", 1i64);
        let mut row_b = Row::new();
        row_b.set("id", 2i64);
        let mut c = Concat;
        let out = c.process(vec![
            vec![Update::add(row_a.clone())],
            vec![Update::add(row_b.clone())],
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].node.row, row_a);
        assert_eq!(out[1].node.row, row_b);
    }
}
