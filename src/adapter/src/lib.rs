// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client-facing half of the system.
//!
//! * [`protocol`] defines the JSON wire messages exchanged with clients.
//! * [`cvr`] is the Client View Record: the durable contract about what a
//!   client group currently sees and at what version.
//! * [`syncer`] runs one task per client group that subscribes its query
//!   pipelines to the change stream, diffs results against the CVR at each
//!   commit, and emits poke sequences.
//! * [`connection`] adapts one socket to the syncer: inbound validation
//!   and dispatch, outbound stop-and-wait streaming.

#![warn(missing_debug_implementations)]

pub mod connection;
pub mod cvr;
pub mod protocol;
pub mod syncer;
pub mod test_util;
