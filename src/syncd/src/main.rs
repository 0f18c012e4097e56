// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `syncd` binary: ingests the upstream change stream and serves the
//! sync protocol to WebSocket clients.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use lens_storage::changelog::ChangeLog;
use lens_storage::metrics::SourceMetrics;
use lens_storage::replica::Replica;
use lens_storage::source::postgres::{PostgresChangeSource, PostgresSourceConfig};
use lens_storage::streamer::ChangeStreamer;

mod http;
mod server;

/// The Lens sync server.
#[derive(Debug, Parser)]
#[clap(name = "syncd", about = "Serves incrementally-maintained queries to sync clients.")]
struct Args {
    /// The upstream Postgres connection string.
    #[clap(long, env = "SYNCD_UPSTREAM_URL")]
    upstream_url: String,
    /// The logical replication slot to stream from.
    #[clap(long, env = "SYNCD_SLOT", default_value = "lens_slot")]
    slot: String,
    /// The publication to subscribe to.
    #[clap(long, env = "SYNCD_PUBLICATION", default_value = "lens_publication")]
    publication: String,
    /// Path to the replica database.
    #[clap(long, env = "SYNCD_REPLICA_PATH", default_value = "lens-replica.db")]
    replica_path: PathBuf,
    /// Path to the change log database.
    #[clap(long, env = "SYNCD_CHANGELOG_PATH", default_value = "lens-changelog.db")]
    changelog_path: PathBuf,
    /// Path to the CVR database.
    #[clap(long, env = "SYNCD_CVR_PATH", default_value = "lens-cvr.db")]
    cvr_path: PathBuf,
    /// The address to serve clients on.
    #[clap(long, env = "SYNCD_LISTEN_ADDR", default_value = "0.0.0.0:4848")]
    listen_addr: SocketAddr,
    /// Bound on each change stream subscriber's buffered transactions.
    #[clap(long, env = "SYNCD_SUBSCRIBER_CAPACITY", default_value_t = 4096)]
    subscriber_capacity: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("SYNCD_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = prometheus::Registry::new();
    let metrics = SourceMetrics::register(&registry);

    let replica = Replica::open(&args.replica_path)
        .with_context(|| format!("opening replica at {}", args.replica_path.display()))?;
    if replica.replica_version()?.is_none() {
        anyhow::bail!(
            "replica at {} has no snapshot; run the initial copy first",
            args.replica_path.display()
        );
    }
    let changelog = ChangeLog::open(&args.changelog_path)
        .with_context(|| format!("opening change log at {}", args.changelog_path.display()))?;
    let source = PostgresChangeSource::new(
        PostgresSourceConfig {
            url: args.upstream_url.clone(),
            slot: args.slot.clone(),
            publication: args.publication.clone(),
        },
        metrics.clone(),
    );
    let streamer = Arc::new(ChangeStreamer::spawn(
        Arc::new(source),
        changelog,
        replica,
        metrics,
        args.subscriber_capacity,
    ));

    let server = Arc::new(server::Server::new(
        Arc::clone(&streamer),
        args.replica_path.clone(),
        args.cvr_path.clone(),
        registry,
    ));

    info!(addr = %args.listen_addr, "syncd listening");
    let listener = tokio::net::TcpListener::bind(args.listen_addr)
        .await
        .with_context(|| format!("binding {}", args.listen_addr))?;
    axum::serve(listener, http::router(server))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            streamer.stop();
        })
        .await?;
    Ok(())
}
