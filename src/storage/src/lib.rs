// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Change ingestion and storage.
//!
//! This crate owns the upstream half of the system:
//!
//! * [`source`] decodes the upstream logical replication feed into the
//!   typed change stream, one [`lens_storage_types::Transaction`] per
//!   upstream commit;
//! * [`changelog`] is the durable, replayable log of those transactions,
//!   keyed by watermark;
//! * [`replica`] is the local row store the streamer keeps in lockstep
//!   with upstream, stamping every row with its commit watermark;
//! * [`streamer`] multiplexes one change source into many subscribers,
//!   acknowledging upstream only after durable persistence.

#![warn(missing_debug_implementations)]

pub mod changelog;
pub mod metrics;
pub mod replica;
pub mod source;
pub mod streamer;
