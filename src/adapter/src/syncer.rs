// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The view syncer.
//!
//! One task per client group owns the group's CVR and its query pipelines.
//! The task subscribes to the change streamer at the CVR's state version;
//! at every committed upstream transaction it feeds the commit's changes
//! into each pipeline's sources, pulls fresh results, reconciles them
//! against the CVR, persists the CVR, and emits one poke sequence per
//! connected client. Pipelines execute synchronously inside this task, so
//! a version's deltas are fully drained before the next version is
//! admitted and pokes leave strictly in version order.
//!
//! The reserved internal query tracks the group's `lastMutationID`s from
//! the upstream `lens.clients` table; its results travel in
//! `lastMutationIDChanges` rather than as entities.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use lens_compute::{SourceChange, ViewNode};
use lens_repr::{Datum, LexiVersion, Row, UnrepresentableError};
use lens_sql::ast::Ast;
use lens_sql::{compile, CompileError, CompiledQuery, ResultShape};
use lens_storage::replica::{Replica, ReplicaError};
use lens_storage::streamer::{ChangeStreamer, SubscribeError, SubscribeRequest};
use lens_storage_types::{Change, TableRef, Transaction};

use crate::cvr::{Cvr, CvrError, CvrStore, CvrVersion, DesiredRow, RowKey, RowPatch};
use crate::protocol::{
    ClientsPatchOp, Downstream, EntityPatchOp, ErrorKind, PatchOp, PokeEnd, PokePart, PokeStart,
    QueriesPatchOp,
};

/// The upstream table that tracks each client's last confirmed mutation.
fn clients_table() -> TableRef {
    TableRef::new("lens", "clients")
}

/// Capacity of each connection's downstream channel.
const DOWNSTREAM_CAPACITY: usize = 256;

/// Identifies one socket's session with the syncer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncContext {
    /// The client behind the socket.
    pub client_id: String,
    /// The socket id; a newer socket for the same client supersedes older
    /// ones.
    pub ws_id: String,
    /// The cookie the client currently holds, if any.
    pub base_cookie: Option<String>,
}

/// A view syncer failure surfaced to the connection.
#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    /// A desired query failed to compile; the CVR was not modified.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// CVR storage failed.
    #[error(transparent)]
    Cvr(#[from] CvrError),
    /// The replica could not be read.
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    /// The change stream subscription failed.
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    /// The pipeline misbehaved; indicates a bug.
    #[error(transparent)]
    Pipeline(#[from] lens_compute::PipelineError),
    /// The syncer task is gone.
    #[error("view syncer is stopped")]
    Stopped,
}

/// A handle to a running view syncer.
#[derive(Debug, Clone)]
pub struct ViewSyncer {
    cmd_tx: mpsc::Sender<Command>,
}

enum Command {
    Init {
        ctx: SyncContext,
        patch: Vec<QueriesPatchOp>,
        reply: oneshot::Sender<Result<mpsc::Receiver<Downstream>, SyncerError>>,
    },
    ChangeQueries {
        ctx: SyncContext,
        patch: Vec<QueriesPatchOp>,
        reply: oneshot::Sender<Result<(), SyncerError>>,
    },
    Stop,
}

impl ViewSyncer {
    /// Spawns the syncer task for one client group. `replica` must be a
    /// read-only connection; the CVR store becomes owned by this syncer.
    pub fn spawn(
        group_id: impl Into<String>,
        streamer: Arc<ChangeStreamer>,
        replica: Replica,
        store: CvrStore,
    ) -> ViewSyncer {
        let group_id = group_id.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task = Task {
            group_id: group_id.clone(),
            streamer,
            replica,
            store,
            cvr: None,
            pipelines: BTreeMap::new(),
            lmids_pipeline: None,
            conns: Vec::new(),
        };
        lens_ore::task::spawn(move || format!("view-syncer-{group_id}"), task.run(cmd_rx));
        ViewSyncer { cmd_tx }
    }

    /// Handles an `initConnection`: applies the desired-queries patch and
    /// returns the connection's downstream sequence, beginning with a
    /// catch-up poke. Supersedes any prior socket for the same client.
    pub async fn init_connection(
        &self,
        ctx: SyncContext,
        patch: Vec<QueriesPatchOp>,
    ) -> Result<mpsc::Receiver<Downstream>, SyncerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Init { ctx, patch, reply })
            .await
            .map_err(|_| SyncerError::Stopped)?;
        rx.await.map_err(|_| SyncerError::Stopped)?
    }

    /// Handles a `changeDesiredQueries`. Messages from superseded sockets
    /// are ignored.
    pub async fn change_desired_queries(
        &self,
        ctx: SyncContext,
        patch: Vec<QueriesPatchOp>,
    ) -> Result<(), SyncerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ChangeQueries { ctx, patch, reply })
            .await
            .map_err(|_| SyncerError::Stopped)?;
        rx.await.map_err(|_| SyncerError::Stopped)?
    }

    /// Stops the syncer task.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }
}

struct Conn {
    client_id: String,
    ws_id: String,
    tx: mpsc::Sender<Downstream>,
}

struct Task {
    group_id: String,
    streamer: Arc<ChangeStreamer>,
    replica: Replica,
    store: CvrStore,
    cvr: Option<Cvr>,
    pipelines: BTreeMap<String, CompiledQuery>,
    lmids_pipeline: Option<CompiledQuery>,
    conns: Vec<Conn>,
}

impl Task {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut cvr = match self.store.load(&self.group_id) {
            Ok(cvr) => cvr,
            Err(e) => {
                warn!(group = %self.group_id, "cannot load CVR: {e}");
                return;
            }
        };
        if let Err(e) = self.rebuild_pipelines(&mut cvr) {
            warn!(group = %self.group_id, "cannot build pipelines: {e}");
        }
        let replica_version = self
            .replica
            .replica_version()
            .ok()
            .flatten()
            .unwrap_or_else(LexiVersion::min);
        let mut subscription = match self
            .streamer
            .subscribe(SubscribeRequest {
                id: format!("view-syncer-{}", self.group_id),
                watermark: cvr.version.state_version.clone(),
                replica_version,
                initial: cvr.version == CvrVersion::initial(),
            })
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                warn!(group = %self.group_id, "cannot subscribe: {e}");
                return;
            }
        };
        self.cvr = Some(cvr);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Init { ctx, patch, reply }) => {
                        let result = self.handle_init(ctx, patch);
                        let _ = reply.send(result);
                    }
                    Some(Command::ChangeQueries { ctx, patch, reply }) => {
                        let result = self.handle_change_queries(ctx, patch);
                        let _ = reply.send(result);
                    }
                    Some(Command::Stop) | None => {
                        info!(group = %self.group_id, "view syncer stopping");
                        return;
                    }
                },
                item = subscription.recv() => match item {
                    Some(Ok(transaction)) => {
                        if let Err(e) = self.process_commit(transaction) {
                            warn!(group = %self.group_id, "commit processing failed: {e}");
                            self.fail_all(ErrorKind::Internal, &e.to_string());
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(group = %self.group_id, "subscription error: {e}");
                        self.fail_all(ErrorKind::Internal, &e.to_string());
                        return;
                    }
                    None => {
                        self.fail_all(ErrorKind::Internal, "change stream closed");
                        return;
                    }
                },
            }
        }
    }

    /// Compiles and hydrates the pipelines for every desired query plus
    /// the internal one. Queries that no longer compile (a schema change
    /// removed a column) are dropped; their rows fall out at the next
    /// reconciliation.
    fn rebuild_pipelines(&mut self, cvr: &mut Cvr) -> Result<(), SyncerError> {
        let schemas = self.replica.tables().clone();
        self.pipelines.clear();
        let desired: Vec<(String, Ast)> = cvr
            .desired_queries()
            .map(|(hash, ast)| (hash.clone(), ast.clone()))
            .collect();
        for (hash, ast) in desired {
            match compile::compile(&ast, &schemas) {
                Ok(query) => {
                    let query = self.hydrate(query)?;
                    self.pipelines.insert(hash, query);
                }
                Err(e) => {
                    warn!(group = %self.group_id, %hash, "query no longer compiles: {e}");
                    cvr.queries.remove(&hash);
                    for client in cvr.clients.values_mut() {
                        client.desired_query_ids.remove(&hash);
                    }
                }
            }
        }
        self.lmids_pipeline = self.build_lmids_pipeline(&schemas)?;
        Ok(())
    }

    fn build_lmids_pipeline(
        &mut self,
        schemas: &BTreeMap<TableRef, lens_repr::RelationDesc>,
    ) -> Result<Option<CompiledQuery>, SyncerError> {
        if !schemas.contains_key(&clients_table()) {
            return Ok(None);
        }
        let ast: Ast = serde_json::from_value(serde_json::json!({
            "schema": "lens",
            "table": "clients",
            "where": {
                "type": "simple",
                "op": "=",
                "field": "clientGroupID",
                "value": self.group_id,
            },
        }))
        .expect("static AST is well formed");
        let query = compile::compile(&ast, schemas)?;
        Ok(Some(self.hydrate(query)?))
    }

    /// Seeds a compiled query's sources from the replica and hydrates it.
    fn hydrate(&self, mut query: CompiledQuery) -> Result<CompiledQuery, SyncerError> {
        let tables: Vec<TableRef> = query.pipeline.tables().cloned().collect();
        for table in tables {
            for row in self.replica.scan_table(&table)? {
                query
                    .pipeline
                    .push(&table, SourceChange::Insert { row })?;
            }
        }
        query.pipeline.hydrate()?;
        Ok(query)
    }

    /// Routes one committed transaction through every pipeline, reconciles,
    /// persists, and pokes.
    fn process_commit(&mut self, transaction: Transaction) -> Result<(), SyncerError> {
        let mut cvr = self.cvr.take().expect("cvr is resident");
        let result = self.process_commit_inner(&mut cvr, transaction);
        self.cvr = Some(cvr);
        result
    }

    fn process_commit_inner(
        &mut self,
        cvr: &mut Cvr,
        transaction: Transaction,
    ) -> Result<(), SyncerError> {
        if transaction.watermark <= cvr.version.state_version {
            return Ok(());
        }
        let schema_changed = transaction.changes.iter().any(Change::is_schema_change);
        let mut lmid_changes: BTreeMap<String, u64> = BTreeMap::new();
        if schema_changed {
            // Pending pokes for prior versions have already gone out; the
            // recompiled pipelines take over from this commit boundary on.
            self.replica.reload_tables()?;
            self.rebuild_pipelines(cvr)?;
            lmid_changes = self.all_lmids();
        } else {
            for change in &transaction.changes {
                self.route_change(change)?;
            }
            for query in self.pipelines.values_mut() {
                query.pipeline.commit()?;
            }
            if let Some(lmids) = self.lmids_pipeline.as_mut() {
                let delta = lmids.pipeline.commit()?;
                for update in delta {
                    if update.diff > 0 {
                        if let (Datum::String(client), Datum::Int(lmid)) = (
                            update.node.row.datum("clientID"),
                            update.node.row.datum("lastMutationID"),
                        ) {
                            lmid_changes.insert(client, lmid as u64);
                        }
                    }
                }
            }
        }

        let version = CvrVersion {
            state_version: transaction.watermark.clone(),
            minor: 0,
        };
        let base_cookie = cvr.version.cookie();
        let (desired, values) = self.desired_rows(&version.state_version);
        let patches = cvr.reconcile_rows(&desired, &version);
        cvr.advance(&transaction.watermark);
        self.store.save(cvr, &patches)?;

        let entities = match entities_patch(&patches, &values) {
            Ok(entities) => entities,
            Err(e) => {
                // Valid but unsendable data: the CVR has advanced, this
                // specific poke is replaced by a typed error, and clients
                // keep their sequences and may re-request.
                self.error_all(ErrorKind::Internal, &e.to_string());
                return Ok(());
            }
        };
        let part = PokePart {
            poke_id: version.cookie(),
            last_mutation_id_changes: (!lmid_changes.is_empty()).then_some(lmid_changes),
            entities_patch: (!entities.is_empty()).then_some(entities),
            got_queries_patch: None,
            clients_patch: None,
            desired_queries_patches: None,
        };
        self.poke_all(&base_cookie, &version, vec![part]);
        Ok(())
    }

    fn covers(&self, table: &TableRef) -> bool {
        self.pipelines
            .values()
            .chain(self.lmids_pipeline.as_ref())
            .any(|q| q.pipeline.tables().any(|t| t == table))
    }

    fn route_change(&mut self, change: &Change) -> Result<(), SyncerError> {
        let (table, source_change) = match change {
            Change::Insert { table, row } | Change::Update { table, row, .. } => {
                if !self.covers(table) {
                    return Ok(());
                }
                let key = self.key_of(table, row)?;
                let old_key = match change {
                    Change::Update {
                        old_key: Some(old), ..
                    } => Some(old.clone()),
                    _ => None,
                };
                // Always re-read through the replica so pipelines observe
                // the merged row with its `_0_version` stamp.
                match self.replica.get_row(table, &key)? {
                    Some(stamped) => (
                        table.clone(),
                        SourceChange::Edit {
                            old_key,
                            row: stamped,
                        },
                    ),
                    None => (
                        table.clone(),
                        SourceChange::Delete {
                            key: old_key.unwrap_or(key),
                        },
                    ),
                }
            }
            Change::Delete { table, key } => {
                (table.clone(), SourceChange::Delete { key: key.clone() })
            }
            Change::Truncate { tables } => {
                for table in tables {
                    self.push_to_pipelines(table, &SourceChange::Truncate)?;
                }
                return Ok(());
            }
            _ => return Ok(()),
        };
        self.push_to_pipelines(&table, &source_change)
    }

    fn key_of(&self, table: &TableRef, row: &lens_repr::Row) -> Result<Vec<Datum>, SyncerError> {
        let desc = self
            .replica
            .tables()
            .get(table)
            .ok_or_else(|| ReplicaError::UnknownTable(table.clone()))?;
        Ok(row.key(desc.key()))
    }

    fn push_to_pipelines(
        &mut self,
        table: &TableRef,
        change: &SourceChange,
    ) -> Result<(), SyncerError> {
        for query in self
            .pipelines
            .values_mut()
            .chain(self.lmids_pipeline.as_mut())
        {
            if query.pipeline.tables().any(|t| t == table) {
                query.pipeline.push(table, change.clone())?;
            }
        }
        Ok(())
    }

    /// The full set of currently-desired rows across every client query,
    /// with their projected (not yet wire-encoded) values.
    fn desired_rows(
        &self,
        state_version: &LexiVersion,
    ) -> (BTreeMap<RowKey, DesiredRow>, BTreeMap<RowKey, Row>) {
        let mut desired: BTreeMap<RowKey, DesiredRow> = BTreeMap::new();
        let mut values = BTreeMap::new();
        for (hash, query) in &self.pipelines {
            let results = query.pipeline.results();
            collect_rows(
                &results,
                &query.shape,
                hash,
                &query.footprint,
                state_version,
                &mut desired,
                &mut values,
            );
        }
        (desired, values)
    }

    fn all_lmids(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        if let Some(lmids) = &self.lmids_pipeline {
            for node in lmids.pipeline.results() {
                if let (Datum::String(client), Datum::Int(lmid)) = (
                    node.row.datum("clientID"),
                    node.row.datum("lastMutationID"),
                ) {
                    out.insert(client, lmid as u64);
                }
            }
        }
        out
    }

    fn handle_init(
        &mut self,
        ctx: SyncContext,
        patch: Vec<QueriesPatchOp>,
    ) -> Result<mpsc::Receiver<Downstream>, SyncerError> {
        let mut cvr = self.cvr.take().expect("cvr is resident");
        let result = self.handle_init_inner(&mut cvr, ctx, patch);
        self.cvr = Some(cvr);
        result
    }

    fn handle_init_inner(
        &mut self,
        cvr: &mut Cvr,
        ctx: SyncContext,
        patch: Vec<QueriesPatchOp>,
    ) -> Result<mpsc::Receiver<Downstream>, SyncerError> {
        let new_client = !cvr.clients.contains_key(&ctx.client_id);
        let (got_patch, row_patches, version, base_cookie) =
            self.apply_queries_patch(cvr, &ctx.client_id, &patch)?;

        // The incremental poke for already-connected sockets; an empty
        // patch leaves the version unchanged and gives them nothing to say.
        if !self.conns.is_empty() && version.cookie() != base_cookie {
            let (_, values) = self.desired_rows(&version.state_version);
            match entities_patch(&row_patches, &values) {
                Ok(entities) => {
                    let part = PokePart {
                        poke_id: version.cookie(),
                        clients_patch: new_client.then(|| {
                            vec![ClientsPatchOp {
                                op: PatchOp::Put,
                                client_id: ctx.client_id.clone(),
                            }]
                        }),
                        desired_queries_patches: Some(
                            [(ctx.client_id.clone(), patch.clone())].into_iter().collect(),
                        ),
                        entities_patch: (!entities.is_empty()).then_some(entities),
                        got_queries_patch: (!got_patch.is_empty()).then_some(got_patch.clone()),
                        last_mutation_id_changes: None,
                    };
                    self.poke_all(&base_cookie, &version, vec![part]);
                }
                // Valid but unsendable data fails this poke only.
                Err(e) => self.error_all(ErrorKind::Internal, &e.to_string()),
            }
        }

        // The catch-up poke for the new socket.
        let (tx, rx) = mpsc::channel(DOWNSTREAM_CAPACITY);
        let since = ctx
            .base_cookie
            .as_deref()
            .and_then(CvrVersion::parse_cookie);
        let catchup = self.catchup_poke(cvr, &ctx, since)?;
        for message in catchup {
            let _ = tx.try_send(message);
        }

        // A newer socket for the same client supersedes older ones; their
        // sequences are cancelled by dropping the sender.
        self.conns.retain(|c| c.client_id != ctx.client_id);
        self.conns.push(Conn {
            client_id: ctx.client_id,
            ws_id: ctx.ws_id,
            tx,
        });
        Ok(rx)
    }

    fn handle_change_queries(
        &mut self,
        ctx: SyncContext,
        patch: Vec<QueriesPatchOp>,
    ) -> Result<(), SyncerError> {
        // Superseded sockets are ignored entirely.
        let live = self
            .conns
            .iter()
            .any(|c| c.client_id == ctx.client_id && c.ws_id == ctx.ws_id);
        if !live {
            info!(group = %self.group_id, ws = %ctx.ws_id, "ignoring superseded socket");
            return Ok(());
        }
        let mut cvr = self.cvr.take().expect("cvr is resident");
        let result = (|| -> Result<(), SyncerError> {
            let (got_patch, row_patches, version, base_cookie) =
                self.apply_queries_patch(&mut cvr, &ctx.client_id, &patch)?;
            let (_, values) = self.desired_rows(&version.state_version);
            match entities_patch(&row_patches, &values) {
                Ok(entities) => {
                    let part = PokePart {
                        poke_id: version.cookie(),
                        desired_queries_patches: Some(
                            [(ctx.client_id.clone(), patch.clone())].into_iter().collect(),
                        ),
                        entities_patch: (!entities.is_empty()).then_some(entities),
                        got_queries_patch: (!got_patch.is_empty()).then_some(got_patch),
                        clients_patch: None,
                        last_mutation_id_changes: None,
                    };
                    self.poke_all(&base_cookie, &version, vec![part]);
                }
                // Valid but unsendable data fails this poke only; the CVR
                // has already advanced.
                Err(e) => self.error_all(ErrorKind::Internal, &e.to_string()),
            }
            Ok(())
        })();
        self.cvr = Some(cvr);
        result
    }

    /// Validates and applies a desired-queries patch: compiles the new
    /// ASTs (rejecting without any CVR mutation on failure), updates the
    /// CVR, reconciles rows, and persists. Returns the got-queries patch,
    /// the row patches, the new version, and the prior cookie.
    fn apply_queries_patch(
        &mut self,
        cvr: &mut Cvr,
        client_id: &str,
        patch: &[QueriesPatchOp],
    ) -> Result<(Vec<QueriesPatchOp>, Vec<RowPatch>, CvrVersion, String), SyncerError> {
        let schemas = self.replica.tables().clone();
        let mut compiled = Vec::new();
        for op in patch {
            if op.op == PatchOp::Put {
                let ast = op.ast.as_ref().ok_or(CvrError::MissingAst {
                    hash: op.hash.clone(),
                })?;
                compiled.push((op.hash.clone(), compile::compile(ast, &schemas)?));
            }
        }

        let base_cookie = cvr.version.cookie();
        let version = cvr.apply_desired_patch(client_id, patch)?;
        let mut got_patch = Vec::new();
        for (hash, query) in compiled {
            let hydrated = self.hydrate(query)?;
            if !self.pipelines.contains_key(&hash) {
                got_patch.push(QueriesPatchOp {
                    op: PatchOp::Put,
                    hash: hash.clone(),
                    ast: None,
                });
            }
            self.pipelines.insert(hash.clone(), hydrated);
            if let Some(record) = cvr.queries.get_mut(&hash) {
                record.transformation_version = Some(version.clone());
                record.patch_version = Some(version.clone());
            }
        }
        for op in patch {
            if op.op == PatchOp::Del && !cvr.queries.contains_key(&op.hash) {
                self.pipelines.remove(&op.hash);
                got_patch.push(QueriesPatchOp {
                    op: PatchOp::Del,
                    hash: op.hash.clone(),
                    ast: None,
                });
            }
        }

        let (desired, _) = self.desired_rows(&version.state_version);
        let row_patches = cvr.reconcile_rows(&desired, &version);
        self.store.save(cvr, &row_patches)?;
        Ok((got_patch, row_patches, version, base_cookie))
    }

    /// Builds the full catch-up poke for a (re)connecting socket: every
    /// current row the group sees, deletions since the client's cookie,
    /// the full clients/queries state, and all `lastMutationID`s.
    fn catchup_poke(
        &mut self,
        cvr: &Cvr,
        ctx: &SyncContext,
        since: Option<CvrVersion>,
    ) -> Result<Vec<Downstream>, SyncerError> {
        let version = cvr.version.clone();
        if since.as_ref() == Some(&version) {
            // Nothing to say; the client is current.
            return Ok(Vec::new());
        }
        let (_, values) = self.desired_rows(&version.state_version);
        let mut entities = Vec::new();
        if let Some(since) = &since {
            for key in self.store.deleted_since(&cvr.id, since)? {
                entities.push(EntityPatchOp {
                    op: PatchOp::Del,
                    entity_type: key.table.to_string(),
                    entity_id: key.entity_id(),
                    value: None,
                });
            }
        }
        for (key, row) in &values {
            let value = match row.to_wire() {
                Ok(value) => value,
                Err(e) => {
                    // Valid but unsendable data fails this poke only.
                    return Ok(vec![Downstream::Error {
                        kind: ErrorKind::Internal,
                        detail: e.to_string(),
                    }]);
                }
            };
            entities.push(EntityPatchOp {
                op: PatchOp::Put,
                entity_type: key.table.to_string(),
                entity_id: key.entity_id(),
                value: Some(serde_json::Value::Object(value)),
            });
        }
        let clients_patch: Vec<ClientsPatchOp> = cvr
            .clients
            .keys()
            .map(|client_id| ClientsPatchOp {
                op: PatchOp::Put,
                client_id: client_id.clone(),
            })
            .collect();
        let desired: BTreeMap<String, Vec<QueriesPatchOp>> = cvr
            .clients
            .iter()
            .map(|(client_id, record)| {
                (
                    client_id.clone(),
                    record
                        .desired_query_ids
                        .iter()
                        .map(|hash| QueriesPatchOp {
                            op: PatchOp::Put,
                            hash: hash.clone(),
                            ast: None,
                        })
                        .collect(),
                )
            })
            .collect();
        let got: Vec<QueriesPatchOp> = self
            .pipelines
            .keys()
            .map(|hash| QueriesPatchOp {
                op: PatchOp::Put,
                hash: hash.clone(),
                ast: None,
            })
            .collect();
        let lmids = self.all_lmids();

        let poke_id = version.cookie();
        let part = PokePart {
            poke_id: poke_id.clone(),
            clients_patch: (!clients_patch.is_empty()).then_some(clients_patch),
            last_mutation_id_changes: (!lmids.is_empty()).then_some(lmids),
            desired_queries_patches: (!desired.is_empty()).then_some(desired),
            entities_patch: (!entities.is_empty()).then_some(entities),
            got_queries_patch: (!got.is_empty()).then_some(got),
        };
        Ok(vec![
            Downstream::PokeStart(PokeStart {
                poke_id: poke_id.clone(),
                base_cookie: ctx.base_cookie.clone(),
                cookie: poke_id.clone(),
            }),
            Downstream::PokePart(part),
            Downstream::PokeEnd(PokeEnd { poke_id }),
        ])
    }

    /// Emits one poke sequence to every connected socket, dropping sockets
    /// whose channels are gone or full.
    fn poke_all(&mut self, base_cookie: &str, version: &CvrVersion, parts: Vec<PokePart>) {
        let poke_id = version.cookie();
        let mut messages = Vec::with_capacity(parts.len() + 2);
        messages.push(Downstream::PokeStart(PokeStart {
            poke_id: poke_id.clone(),
            base_cookie: Some(base_cookie.to_owned()),
            cookie: poke_id.clone(),
        }));
        messages.extend(parts.into_iter().map(Downstream::PokePart));
        messages.push(Downstream::PokeEnd(PokeEnd { poke_id }));
        self.conns.retain(|conn| {
            for message in &messages {
                if conn.tx.try_send(message.clone()).is_err() {
                    warn!(ws = %conn.ws_id, "dropping connection: downstream stalled");
                    return false;
                }
            }
            true
        });
    }

    /// Replaces one failed poke with a typed error on every live socket.
    /// Sequences stay open; clients may re-request. Sockets whose channels
    /// are gone are dropped.
    fn error_all(&mut self, kind: ErrorKind, detail: &str) {
        self.conns.retain(|conn| {
            conn.tx
                .try_send(Downstream::Error {
                    kind,
                    detail: detail.to_owned(),
                })
                .is_ok()
        });
    }

    /// Terminal failure: surfaces the error and tears every sequence down.
    fn fail_all(&mut self, kind: ErrorKind, detail: &str) {
        for conn in self.conns.drain(..) {
            let _ = conn.tx.try_send(Downstream::Error {
                kind,
                detail: detail.to_owned(),
            });
        }
    }
}

/// Walks a pipeline's result tree, attributing every node to its table and
/// merging column coverage across queries.
fn collect_rows(
    nodes: &[&ViewNode],
    shape: &ResultShape,
    hash: &str,
    footprint: &BTreeMap<TableRef, BTreeSet<String>>,
    state_version: &LexiVersion,
    desired: &mut BTreeMap<RowKey, DesiredRow>,
    values: &mut BTreeMap<RowKey, Row>,
) {
    for node in nodes {
        let key = RowKey {
            table: shape.table.clone(),
            key: shape
                .key
                .iter()
                .map(|c| (c.clone(), node.row.datum(c.as_str())))
                .collect(),
        };
        let row_version = node.row.version().unwrap_or_else(|| state_version.clone());
        let columns = footprint.get(&shape.table).cloned().unwrap_or_default();
        let entry = desired.entry(key.clone()).or_insert_with(|| DesiredRow {
            columns: BTreeMap::new(),
            row_version: row_version.clone(),
        });
        entry.row_version = entry.row_version.clone().max(row_version);
        for column in columns {
            entry
                .columns
                .entry(column)
                .or_default()
                .insert(hash.to_owned());
        }
        // Representability is enforced at poke assembly; raw datums are
        // carried through here.
        let value = values.entry(key).or_default();
        for (column, datum) in node.row.project(&shape.columns).iter() {
            value.set(column.clone(), datum.clone());
        }
        for (name, children) in &node.relationships {
            if let Some(child_shape) = shape.relationships.get(name) {
                let children: Vec<&ViewNode> = children.iter().collect();
                collect_rows(
                    &children,
                    child_shape,
                    hash,
                    footprint,
                    state_version,
                    desired,
                    values,
                );
            }
        }
    }
}

/// Converts reconciliation patches plus current values into the wire
/// entities patch, failing when a value has no wire representation.
fn entities_patch(
    patches: &[RowPatch],
    values: &BTreeMap<RowKey, Row>,
) -> Result<Vec<EntityPatchOp>, UnrepresentableError> {
    let mut out = Vec::with_capacity(patches.len());
    for patch in patches {
        match patch.op {
            PatchOp::Put => {
                let value = match values.get(&patch.key) {
                    Some(row) => row.to_wire()?,
                    None => serde_json::Map::new(),
                };
                out.push(EntityPatchOp {
                    op: PatchOp::Put,
                    entity_type: patch.key.table.to_string(),
                    entity_id: patch.key.entity_id(),
                    value: Some(serde_json::Value::Object(value)),
                });
            }
            PatchOp::Del => {
                out.push(EntityPatchOp {
                    op: PatchOp::Del,
                    entity_type: patch.key.table.to_string(),
                    entity_id: patch.key.entity_id(),
                    value: None,
                });
            }
        }
    }
    Ok(out)
}
