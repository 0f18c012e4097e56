// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Server state: the streamer handle and the per-group view syncers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use lens_adapter::connection::{MutationService, NoopMutationService};
use lens_adapter::cvr::CvrStore;
use lens_adapter::syncer::ViewSyncer;
use lens_storage::replica::Replica;
use lens_storage::streamer::ChangeStreamer;

/// Shared server state behind the HTTP surface.
pub struct Server {
    streamer: Arc<ChangeStreamer>,
    replica_path: PathBuf,
    cvr_path: PathBuf,
    registry: prometheus::Registry,
    mutations: Arc<dyn MutationService>,
    syncers: Mutex<HashMap<String, ViewSyncer>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Creates the server state.
    pub fn new(
        streamer: Arc<ChangeStreamer>,
        replica_path: PathBuf,
        cvr_path: PathBuf,
        registry: prometheus::Registry,
    ) -> Server {
        Server {
            streamer,
            replica_path,
            cvr_path,
            registry,
            mutations: Arc::new(NoopMutationService),
            syncers: Mutex::new(HashMap::new()),
        }
    }

    /// The streamer handle.
    pub fn streamer(&self) -> &ChangeStreamer {
        &self.streamer
    }

    /// The metrics registry.
    pub fn metrics_registry(&self) -> &prometheus::Registry {
        &self.registry
    }

    /// The mutation service.
    pub fn mutations(&self) -> Arc<dyn MutationService> {
        Arc::clone(&self.mutations)
    }

    /// The view syncer for a client group, creating it on first use. Each
    /// syncer gets its own read-only replica connection and CVR store
    /// connection.
    pub fn syncer_for(&self, group_id: &str) -> anyhow::Result<ViewSyncer> {
        let mut syncers = self.syncers.lock().expect("poisoned");
        if let Some(syncer) = syncers.get(group_id) {
            return Ok(syncer.clone());
        }
        let replica = Replica::open_read_only(&self.replica_path)?;
        let store = CvrStore::open(&self.cvr_path)?;
        let syncer = ViewSyncer::spawn(
            group_id,
            Arc::clone(&self.streamer),
            replica,
            store,
        );
        syncers.insert(group_id.to_owned(), syncer.clone());
        Ok(syncer)
    }
}
