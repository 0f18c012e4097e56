// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus metrics for the ingestion path.

use prometheus::{IntCounter, IntGauge, Registry};

/// Metrics for one change source and the streamer in front of it.
#[derive(Debug, Clone)]
pub struct SourceMetrics {
    /// Committed transactions ingested.
    pub transactions: IntCounter,
    /// Row inserts decoded.
    pub inserts: IntCounter,
    /// Row updates decoded.
    pub updates: IntCounter,
    /// Row deletes decoded.
    pub deletes: IntCounter,
    /// The last committed upstream LSN.
    pub lsn: IntGauge,
    /// Live change stream subscribers.
    pub subscribers: IntGauge,
}

impl SourceMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn register(registry: &Registry) -> SourceMetrics {
        let metrics = SourceMetrics::unregistered();
        for c in [
            &metrics.transactions,
            &metrics.inserts,
            &metrics.updates,
            &metrics.deletes,
        ] {
            registry
                .register(Box::new(c.clone()))
                .expect("metric names are unique");
        }
        for g in [&metrics.lsn, &metrics.subscribers] {
            registry
                .register(Box::new(g.clone()))
                .expect("metric names are unique");
        }
        metrics
    }

    /// Creates the metrics without registering them, for tests.
    pub fn unregistered() -> SourceMetrics {
        SourceMetrics {
            transactions: IntCounter::new(
                "lens_source_transactions_total",
                "Committed upstream transactions ingested.",
            )
            .expect("valid metric"),
            inserts: IntCounter::new("lens_source_inserts_total", "Row inserts decoded.")
                .expect("valid metric"),
            updates: IntCounter::new("lens_source_updates_total", "Row updates decoded.")
                .expect("valid metric"),
            deletes: IntCounter::new("lens_source_deletes_total", "Row deletes decoded.")
                .expect("valid metric"),
            lsn: IntGauge::new("lens_source_lsn", "Last committed upstream LSN.")
                .expect("valid metric"),
            subscribers: IntGauge::new(
                "lens_streamer_subscribers",
                "Live change stream subscribers.",
            )
            .expect("valid metric"),
        }
    }
}
