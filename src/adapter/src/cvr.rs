// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Client View Record.
//!
//! A CVR is the durable contract between the view syncer and a client
//! group: which queries each client desires, which rows (and which columns
//! of them) the group currently sees, and at what version. Reconciliation
//! against fresh query results is idempotent: re-running it with identical
//! inputs produces no additional patches.
//!
//! Invariants:
//! * a row is present iff at least one column of it is covered by at least
//!   one active query;
//! * a column is recorded iff some active query selects or filters on it;
//! * `version` only moves forward; desired-query changes that are not yet
//!   tied to a replica version advance the minor version.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use lens_repr::{ColumnName, Datum, LexiVersion};
use lens_sql::ast::Ast;
use lens_storage_types::TableRef;

use crate::protocol::{PatchOp, QueriesPatchOp};

/// The hash of the reserved internal query tracking `lastMutationID`s.
pub const LMIDS_QUERY: &str = "lmids";

/// A CVR version: the replica state version plus a minor version counting
/// desired-query changes not yet tied to a new state version.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CvrVersion {
    /// The replica version the CVR last reflected.
    pub state_version: LexiVersion,
    /// Counts CVR-only changes within one state version.
    pub minor: u64,
}

impl CvrVersion {
    /// The version of a CVR that has never synced.
    pub fn initial() -> CvrVersion {
        CvrVersion {
            state_version: LexiVersion::min(),
            minor: 0,
        }
    }

    /// The client-visible cookie. Minor versions append a
    /// lexicographically-ordered suffix, so cookie order matches version
    /// order.
    pub fn cookie(&self) -> String {
        if self.minor == 0 {
            self.state_version.as_str().to_owned()
        } else {
            format!("{}:{}", self.state_version, LexiVersion::from_lsn(self.minor))
        }
    }

    /// Parses a client-presented cookie.
    pub fn parse_cookie(cookie: &str) -> Option<CvrVersion> {
        match cookie.split_once(':') {
            None => Some(CvrVersion {
                state_version: LexiVersion::parse(cookie).ok()?,
                minor: 0,
            }),
            Some((state, minor)) => Some(CvrVersion {
                state_version: LexiVersion::parse(state).ok()?,
                minor: LexiVersion::parse(minor).ok()?.to_lsn().ok()?,
            }),
        }
    }

    /// The next minor version.
    pub fn next_minor(&self) -> CvrVersion {
        CvrVersion {
            state_version: self.state_version.clone(),
            minor: self.minor + 1,
        }
    }
}

/// Identifies a row across the whole replica: table plus named key datums.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RowKey {
    /// The row's table.
    pub table: TableRef,
    /// The primary key columns, in key order.
    pub key: Vec<(ColumnName, Datum)>,
}

impl RowKey {
    /// The wire `entityID`: a JSON object of key columns.
    pub fn entity_id(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (name, datum) in &self.key {
            obj.insert(
                name.as_str().to_owned(),
                datum.to_wire().unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(obj)
    }
}

/// What the CVR records about one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    /// The version at which this record last changed.
    pub patch_version: CvrVersion,
    /// Which queries cover which columns of the row.
    pub queried_columns: BTreeMap<String, BTreeSet<String>>,
    /// The row's `_0_version` as last observed.
    pub row_version: LexiVersion,
}

/// What the CVR records about one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// The query AST; absent for internal queries.
    pub ast: Option<Ast>,
    /// Which clients desire the query, and since when.
    pub desired_by: BTreeMap<String, CvrVersion>,
    /// When the query's got-state last changed.
    pub patch_version: Option<CvrVersion>,
    /// When the query was last (re)compiled and hydrated.
    pub transformation_version: Option<CvrVersion>,
    /// Reserved server-maintained queries (`lmids`).
    pub internal: bool,
}

/// What the CVR records about one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// The queries this client desires.
    pub desired_query_ids: BTreeSet<String>,
    /// When this client's desires last changed.
    pub patch_version: Option<CvrVersion>,
}

/// A row-level patch produced by reconciliation. The row's current value
/// travels separately; the CVR tracks membership and coverage only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowPatch {
    /// Put or del.
    pub op: PatchOp,
    /// The affected row.
    pub key: RowKey,
}

/// What reconciliation wants the CVR to look like for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredRow {
    /// Which queries cover which columns.
    pub columns: BTreeMap<String, BTreeSet<String>>,
    /// The row's current `_0_version`.
    pub row_version: LexiVersion,
}

/// The in-memory CVR state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cvr {
    /// The client group this record belongs to.
    pub id: String,
    /// The record's version.
    pub version: CvrVersion,
    /// Per-client state.
    pub clients: BTreeMap<String, ClientRecord>,
    /// Per-query state.
    pub queries: BTreeMap<String, QueryRecord>,
    /// Per-row state.
    pub row_records: BTreeMap<RowKey, RowRecord>,
}

impl Cvr {
    /// Creates an empty CVR for a client group, with the reserved internal
    /// query installed.
    pub fn new(id: impl Into<String>) -> Cvr {
        let mut queries = BTreeMap::new();
        queries.insert(
            LMIDS_QUERY.to_owned(),
            QueryRecord {
                ast: None,
                desired_by: BTreeMap::new(),
                patch_version: None,
                transformation_version: None,
                internal: true,
            },
        );
        Cvr {
            id: id.into(),
            version: CvrVersion::initial(),
            clients: BTreeMap::new(),
            queries,
            row_records: BTreeMap::new(),
        }
    }

    /// Applies a desired-queries patch for one client, advancing the minor
    /// version. ASTs must already be validated; a `put` without an AST is
    /// rejected without mutating anything.
    pub fn apply_desired_patch(
        &mut self,
        client_id: &str,
        patch: &[QueriesPatchOp],
    ) -> Result<CvrVersion, CvrError> {
        if patch.is_empty() {
            return Ok(self.version.clone());
        }
        for op in patch {
            if op.op == PatchOp::Put && op.ast.is_none() {
                return Err(CvrError::MissingAst {
                    hash: op.hash.clone(),
                });
            }
        }
        let version = self.version.next_minor();
        self.version = version.clone();
        self.clients
            .entry(client_id.to_owned())
            .or_default()
            .patch_version = Some(version.clone());
        for op in patch {
            match op.op {
                PatchOp::Put => {
                    self.clients
                        .get_mut(client_id)
                        .expect("client record created above")
                        .desired_query_ids
                        .insert(op.hash.clone());
                    let query = self
                        .queries
                        .entry(op.hash.clone())
                        .or_insert_with(|| QueryRecord {
                            ast: None,
                            desired_by: BTreeMap::new(),
                            patch_version: None,
                            transformation_version: None,
                            internal: false,
                        });
                    query.ast = op.ast.clone();
                    query.desired_by.insert(client_id.to_owned(), version.clone());
                }
                PatchOp::Del => {
                    if let Some(client) = self.clients.get_mut(client_id) {
                        client.desired_query_ids.remove(&op.hash);
                    }
                    if let Some(query) = self.queries.get_mut(&op.hash) {
                        query.desired_by.remove(client_id);
                        if query.desired_by.is_empty() && !query.internal {
                            self.queries.remove(&op.hash);
                        }
                    }
                }
            }
        }
        Ok(version)
    }

    /// The active client-desired queries.
    pub fn desired_queries(&self) -> impl Iterator<Item = (&String, &Ast)> {
        self.queries
            .iter()
            .filter_map(|(hash, q)| q.ast.as_ref().map(|ast| (hash, ast)))
    }

    /// Reconciles the full set of currently-desired rows against the
    /// record, mutating row records and returning the patches to send.
    pub fn reconcile_rows(
        &mut self,
        desired: &BTreeMap<RowKey, DesiredRow>,
        version: &CvrVersion,
    ) -> Vec<RowPatch> {
        let mut patches = Vec::new();
        for (key, want) in desired {
            match self.row_records.get_mut(key) {
                None => {
                    self.row_records.insert(
                        key.clone(),
                        RowRecord {
                            patch_version: version.clone(),
                            queried_columns: want.columns.clone(),
                            row_version: want.row_version.clone(),
                        },
                    );
                    patches.push(RowPatch {
                        op: PatchOp::Put,
                        key: key.clone(),
                    });
                }
                Some(record) => {
                    if record.queried_columns != want.columns
                        || record.row_version != want.row_version
                    {
                        record.queried_columns = want.columns.clone();
                        record.row_version = want.row_version.clone();
                        record.patch_version = version.clone();
                        patches.push(RowPatch {
                            op: PatchOp::Put,
                            key: key.clone(),
                        });
                    }
                }
            }
        }
        let stale: Vec<RowKey> = self
            .row_records
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            self.row_records.remove(&key);
            patches.push(RowPatch {
                op: PatchOp::Del,
                key,
            });
        }
        patches
    }

    /// Advances to a new replica state version, folding in any pending
    /// minor versions.
    pub fn advance(&mut self, state_version: &LexiVersion) {
        if *state_version > self.version.state_version {
            self.version = CvrVersion {
                state_version: state_version.clone(),
                minor: 0,
            };
        }
    }
}

/// A CVR storage failure.
#[derive(Debug, thiserror::Error)]
pub enum CvrError {
    /// The underlying store failed.
    #[error("cvr store error")]
    Sqlite(#[from] rusqlite::Error),
    /// A persisted record failed to encode or decode.
    #[error("cvr encoding error")]
    Encoding(#[from] serde_json::Error),
    /// A desired-queries `put` without an AST.
    #[error("desired query {hash} has no AST")]
    MissingAst {
        /// The query hash.
        hash: String,
    },
}

const META: &str = r#""vs.cvr_meta""#;
const ROWS: &str = r#""vs.cvr_rows""#;
const PATCHES: &str = r#""vs.cvr_patches""#;
const SCHEMA_META: &str = r#""vs.storage_schema_meta""#;

/// The storage schema version of the CVR layout.
const STORAGE_SCHEMA_VERSION: i64 = 1;

/// Durable CVR storage. Written only by the owning view syncer.
#[derive(Debug)]
pub struct CvrStore {
    conn: Connection,
}

impl CvrStore {
    /// Opens (creating if necessary) the store at `path`.
    pub fn open(path: &Path) -> Result<CvrStore, CvrError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        Self::init(conn)
    }

    /// Opens an in-memory store, for tests.
    pub fn open_in_memory() -> Result<CvrStore, CvrError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<CvrStore, CvrError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {META} (
                group_id TEXT PRIMARY KEY,
                meta TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {ROWS} (
                group_id TEXT NOT NULL,
                row_key TEXT NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (group_id, row_key)
            );
            CREATE TABLE IF NOT EXISTS {PATCHES} (
                group_id TEXT NOT NULL,
                version TEXT NOT NULL,
                seq INTEGER NOT NULL,
                patch TEXT NOT NULL,
                PRIMARY KEY (group_id, version, seq)
            );
            CREATE TABLE IF NOT EXISTS {SCHEMA_META} (
                version INTEGER NOT NULL,
                max_version INTEGER NOT NULL,
                min_safe_rollback_version INTEGER NOT NULL
            );",
        ))?;
        let initialized: Option<i64> = conn
            .query_row(&format!("SELECT version FROM {SCHEMA_META}"), [], |row| {
                row.get(0)
            })
            .optional()?;
        if initialized.is_none() {
            conn.execute(
                &format!(
                    "INSERT INTO {SCHEMA_META} (version, max_version, min_safe_rollback_version)
                     VALUES (?, ?, ?)"
                ),
                params![STORAGE_SCHEMA_VERSION, STORAGE_SCHEMA_VERSION, 1],
            )?;
        }
        Ok(CvrStore { conn })
    }

    /// Loads a group's CVR, or creates a fresh one.
    pub fn load(&self, group_id: &str) -> Result<Cvr, CvrError> {
        let meta: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT meta FROM {META} WHERE group_id = ?"),
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(meta) = meta else {
            return Ok(Cvr::new(group_id));
        };
        let mut cvr: Cvr = serde_json::from_str(&meta)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT row_key, record FROM {ROWS} WHERE group_id = ?"))?;
        let rows = stmt.query_map(params![group_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, record) = row?;
            cvr.row_records
                .insert(serde_json::from_str(&key)?, serde_json::from_str(&record)?);
        }
        Ok(cvr)
    }

    /// Persists the CVR and the row patches that produced its current
    /// state, in one transaction.
    pub fn save(&mut self, cvr: &Cvr, patches: &[RowPatch]) -> Result<(), CvrError> {
        let tx = self.conn.transaction()?;
        {
            // Row records are persisted individually so that only the
            // patched rows are rewritten; the meta document intentionally
            // excludes them.
            let mut meta_only = cvr.clone();
            meta_only.row_records = BTreeMap::new();
            tx.execute(
                &format!("INSERT OR REPLACE INTO {META} (group_id, meta) VALUES (?, ?)"),
                params![cvr.id, serde_json::to_string(&meta_only)?],
            )?;
            let mut upsert = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {ROWS} (group_id, row_key, record) VALUES (?, ?, ?)"
            ))?;
            let mut delete = tx.prepare(&format!(
                "DELETE FROM {ROWS} WHERE group_id = ? AND row_key = ?"
            ))?;
            let mut record_patch = tx.prepare(&format!(
                "INSERT OR REPLACE INTO {PATCHES} (group_id, version, seq, patch)
                 VALUES (?, ?, ?, ?)"
            ))?;
            for (seq, patch) in patches.iter().enumerate() {
                let key = serde_json::to_string(&patch.key)?;
                match patch.op {
                    PatchOp::Put => {
                        let record = cvr
                            .row_records
                            .get(&patch.key)
                            .expect("put patch for a recorded row");
                        upsert.execute(params![cvr.id, key, serde_json::to_string(record)?])?;
                    }
                    PatchOp::Del => {
                        delete.execute(params![cvr.id, key])?;
                        record_patch.execute(params![
                            cvr.id,
                            cvr.version.cookie(),
                            seq as i64,
                            serde_json::to_string(patch)?,
                        ])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The row deletions recorded strictly after `since`, for catch-up of
    /// reconnecting clients.
    pub fn deleted_since(
        &self,
        group_id: &str,
        since: &CvrVersion,
    ) -> Result<Vec<RowKey>, CvrError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT patch FROM {PATCHES}
             WHERE group_id = ? AND version > ? ORDER BY version, seq"
        ))?;
        let rows = stmt.query_map(params![group_id, since.cookie()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            let patch: RowPatch = serde_json::from_str(&row?)?;
            out.push(patch.key);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_key(id: &str) -> RowKey {
        RowKey {
            table: TableRef::new("public", "issues"),
            key: vec![("id".into(), Datum::String(id.into()))],
        }
    }

    fn desired(ids: &[&str], version: u64) -> BTreeMap<RowKey, DesiredRow> {
        ids.iter()
            .map(|id| {
                (
                    row_key(id),
                    DesiredRow {
                        columns: [(
                            "title".to_owned(),
                            ["q1".to_owned()].into_iter().collect(),
                        )]
                        .into_iter()
                        .collect(),
                        row_version: LexiVersion::from_lsn(version),
                    },
                )
            })
            .collect()
    }

    fn at(lsn: u64) -> CvrVersion {
        CvrVersion {
            state_version: LexiVersion::from_lsn(lsn),
            minor: 0,
        }
    }

    #[test]
    fn cookie_order_matches_version_order() {
        let base = at(5);
        let minor = base.next_minor();
        let later = at(6);
        assert!(base < minor && minor < later);
        assert!(base.cookie() < minor.cookie());
        assert!(minor.cookie() < later.cookie());
        assert_eq!(CvrVersion::parse_cookie(&minor.cookie()), Some(minor));
    }

    #[test]
    fn desired_patch_updates_clients_and_queries() {
        let mut cvr = Cvr::new("g1");
        let ast: Ast = serde_json::from_value(serde_json::json!({"table": "issues"})).unwrap();
        cvr.apply_desired_patch(
            "c1",
            &[QueriesPatchOp {
                op: PatchOp::Put,
                hash: "q1".into(),
                ast: Some(ast),
            }],
        )
        .unwrap();
        assert_eq!(cvr.version.minor, 1);
        assert!(cvr.clients["c1"].desired_query_ids.contains("q1"));
        assert!(cvr.queries["q1"].desired_by.contains_key("c1"));

        cvr.apply_desired_patch(
            "c1",
            &[QueriesPatchOp {
                op: PatchOp::Del,
                hash: "q1".into(),
                ast: None,
            }],
        )
        .unwrap();
        // The last desirer leaving drops the query entirely.
        assert!(!cvr.queries.contains_key("q1"));
        // The internal query is never dropped.
        assert!(cvr.queries.contains_key(LMIDS_QUERY));
    }

    #[test]
    fn put_without_ast_is_rejected_without_mutation() {
        let mut cvr = Cvr::new("g1");
        let before = cvr.clone();
        let err = cvr
            .apply_desired_patch(
                "c1",
                &[QueriesPatchOp {
                    op: PatchOp::Put,
                    hash: "q1".into(),
                    ast: None,
                }],
            )
            .unwrap_err();
        assert!(matches!(err, CvrError::MissingAst { .. }));
        assert_eq!(cvr, before);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut cvr = Cvr::new("g1");
        let want = desired(&["1", "2"], 5);
        let patches = cvr.reconcile_rows(&want, &at(5));
        assert_eq!(patches.len(), 2);
        assert!(patches.iter().all(|p| p.op == PatchOp::Put));
        // Same inputs, zero additional patches.
        assert!(cvr.reconcile_rows(&want, &at(5)).is_empty());
    }

    #[test]
    fn reconcile_tracks_membership_and_versions() {
        let mut cvr = Cvr::new("g1");
        cvr.reconcile_rows(&desired(&["1", "2"], 5), &at(5));
        // Row 2 leaves, row 3 arrives, row 1 advances.
        let mut want = desired(&["1", "3"], 5);
        want.get_mut(&row_key("1")).unwrap().row_version = LexiVersion::from_lsn(6);
        let patches = cvr.reconcile_rows(&want, &at(6));
        let ops: Vec<_> = patches.iter().map(|p| (p.op, p.key.clone())).collect();
        assert!(ops.contains(&(PatchOp::Put, row_key("1"))));
        assert!(ops.contains(&(PatchOp::Put, row_key("3"))));
        assert!(ops.contains(&(PatchOp::Del, row_key("2"))));
        assert_eq!(patches.len(), 3);
        assert!(!cvr.row_records.contains_key(&row_key("2")));
    }

    #[test]
    fn store_round_trips_and_records_deletions() {
        let mut store = CvrStore::open_in_memory().unwrap();
        let mut cvr = store.load("g1").unwrap();
        let patches = cvr.reconcile_rows(&desired(&["1", "2"], 5), &at(5));
        cvr.advance(&LexiVersion::from_lsn(5));
        store.save(&cvr, &patches).unwrap();

        let patches = cvr.reconcile_rows(&desired(&["1"], 5), &at(6));
        cvr.advance(&LexiVersion::from_lsn(6));
        store.save(&cvr, &patches).unwrap();

        let reloaded = store.load("g1").unwrap();
        assert_eq!(reloaded.version, at(6));
        assert_eq!(reloaded.row_records.len(), 1);

        let deleted = store.deleted_since("g1", &at(5)).unwrap();
        assert_eq!(deleted, vec![row_key("2")]);
        assert!(store.deleted_since("g1", &at(6)).unwrap().is_empty());
    }
}
