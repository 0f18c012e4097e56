// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Postgres logical replication source.
//!
//! # Progress and acknowledgement
//!
//! The upstream server retains WAL until the replication slot's confirmed
//! flush LSN advances, so timely standby status updates matter. Status
//! updates carry the last watermark the caller reported as durably
//! persisted, never further: acknowledging beyond durability would let the
//! server discard WAL we still need after a crash.
//!
//! Keepalives are sent proactively on a timer derived from the server's
//! `wal_sender_timeout` (half of it, capped at one second), with the reply
//! flag set so the server answers promptly even when no data flows.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use postgres_replication::protocol::{
    LogicalReplicationMessage, ReplicationMessage, TupleData,
};
use postgres_replication::LogicalReplicationStream;
use tokio::sync::mpsc;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{info, trace};

use lens_ore::task;
use lens_repr::{ColumnName, Datum, LexiVersion, RelationDesc, Row, ScalarType, VERSION_COLUMN};
use lens_storage_types::{Change, TableRef, Transaction};

use crate::metrics::SourceMetrics;
use crate::source::{
    ChangeSource, ChangeStream, DefiniteError, ReplicationError, TransientError,
    SOURCE_CHANNEL_CAPACITY,
};

/// Postgres epoch is 2000-01-01T00:00:00Z.
const PG_EPOCH_OFFSET: Duration = Duration::from_secs(946_684_800);

/// Connection parameters for the upstream database.
#[derive(Debug, Clone)]
pub struct PostgresSourceConfig {
    /// The upstream connection string.
    pub url: String,
    /// The logical replication slot to stream from.
    pub slot: String,
    /// The publication to subscribe to.
    pub publication: String,
}

/// A [`ChangeSource`] over Postgres logical replication.
#[derive(Debug)]
pub struct PostgresChangeSource {
    config: PostgresSourceConfig,
    metrics: SourceMetrics,
}

impl PostgresChangeSource {
    /// Creates a source; no connection is made until [`ChangeSource::start`].
    pub fn new(config: PostgresSourceConfig, metrics: SourceMetrics) -> PostgresChangeSource {
        PostgresChangeSource { config, metrics }
    }
}

#[async_trait]
impl ChangeSource for PostgresChangeSource {
    async fn start(&self, from: LexiVersion) -> Result<ChangeStream, TransientError> {
        let mut config = tokio_postgres::Config::from_str(&self.config.url)?;
        config.replication_mode(ReplicationMode::Logical);
        let (replication_client, connection) = config.connect(NoTls).await?;
        task::spawn_logged(|| "pg-replication-conn", connection);

        let metadata_config = tokio_postgres::Config::from_str(&self.config.url)?;
        let (metadata_client, connection) = metadata_config.connect(NoTls).await?;
        task::spawn_logged(|| "pg-metadata-conn", connection);

        ensure_replication_slot(&replication_client, &self.config.slot).await?;
        let feedback_interval = feedback_interval(&metadata_client).await?;

        let resume_lsn = from
            .to_lsn()
            .map_err(|e| TransientError::Generic(anyhow::anyhow!(e)))?;
        let query = format!(
            r#"START_REPLICATION SLOT "{}" LOGICAL {} ("proto_version" '1', "publication_names" '{}')"#,
            self.config.slot,
            PgLsn::from(resume_lsn),
            self.config.publication,
        );
        let copy_stream = match replication_client
            .copy_both_simple::<bytes::Bytes>(&query)
            .await
        {
            Ok(stream) => stream,
            Err(err) if err.code() == Some(&SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE) => {
                return Err(TransientError::OvercompactedSlot { requested: from });
            }
            Err(err) => return Err(err.into()),
        };
        info!(slot = %self.config.slot, %from, "replication stream started");

        let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let reader = Reader {
            metrics: self.metrics.clone(),
            tables: BTreeMap::new(),
            resume_lsn,
        };
        task::spawn(|| "pg-replication-reader", async move {
            let stream = LogicalReplicationStream::new(copy_stream);
            if let Err(err) = reader.run(stream, feedback_interval, &tx, ack_rx).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(ChangeStream {
            transactions: rx,
            acks: ack_tx,
        })
    }
}

/// Creates the replication slot if it does not already exist.
async fn ensure_replication_slot(client: &Client, slot: &str) -> Result<(), TransientError> {
    let query = format!(r#"CREATE_REPLICATION_SLOT "{slot}" LOGICAL "pgoutput" NOEXPORT_SNAPSHOT"#);
    match client.simple_query(&query).await {
        Ok(_) => {
            info!(%slot, "created replication slot");
            Ok(())
        }
        Err(err) if err.code() == Some(&SqlState::DUPLICATE_OBJECT) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Derives the proactive keepalive cadence from `wal_sender_timeout`: half
/// the timeout, capped at one second. The upstream cannot be relied on to
/// request status updates in time when it is busy sending a large
/// transaction.
async fn feedback_interval(client: &Client) -> Result<Duration, TransientError> {
    let rows = client.simple_query("SHOW wal_sender_timeout;").await?;
    let value = rows
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_owned),
            _ => None,
        })
        .unwrap_or_else(|| "0".into());
    Ok(parse_feedback_interval(&value))
}

fn parse_feedback_interval(wal_sender_timeout: &str) -> Duration {
    let default = Duration::from_secs(1);
    let digits: String = wal_sender_timeout
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let unit = &wal_sender_timeout[digits.len()..];
    let Ok(n) = digits.parse::<u64>() else {
        return default;
    };
    if n == 0 {
        // A zero timeout disables the server-side deadline entirely.
        return default;
    }
    let timeout = match unit.trim() {
        "ms" => Duration::from_millis(n),
        "min" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        _ => Duration::from_secs(n),
    };
    std::cmp::min(default, timeout / 2)
}

struct Reader {
    metrics: SourceMetrics,
    tables: BTreeMap<u32, RelationDesc>,
    resume_lsn: u64,
}

impl Reader {
    async fn run(
        mut self,
        stream: LogicalReplicationStream,
        feedback_interval: Duration,
        tx: &mpsc::Sender<Result<Transaction, ReplicationError>>,
        mut ack_rx: mpsc::Receiver<LexiVersion>,
    ) -> Result<(), ReplicationError> {
        let mut stream = std::pin::pin!(stream);
        let mut feedback_timer = tokio::time::interval(feedback_interval);
        feedback_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_acked = self.resume_lsn;
        let mut acks_open = true;
        // The transaction currently being assembled, if any.
        let mut pending: Option<Transaction> = None;

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(ReplicationMessage::XLogData(data))) => {
                        if let Some(tx_done) = self.decode(data.into_data(), &mut pending)? {
                            self.metrics.transactions.inc();
                            if let Ok(lsn) = tx_done.watermark.to_lsn() {
                                self.metrics.lsn.set(lsn as i64);
                            }
                            if tx.send(Ok(tx_done)).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(ReplicationMessage::PrimaryKeepAlive(keepalive))) => {
                        if keepalive.reply() == 1 {
                            let ts = pg_timestamp();
                            let lsn = PgLsn::from(last_acked);
                            stream.as_mut()
                                .standby_status_update(lsn, lsn, lsn, ts, 0)
                                .await
                                .map_err(TransientError::from)?;
                        }
                    }
                    Some(Ok(_)) => return Err(TransientError::UnknownReplicationMessage.into()),
                    Some(Err(err)) => return Err(TransientError::from(err).into()),
                    // We never expect the replication stream to gracefully end.
                    None => return Err(TransientError::ReplicationEOF.into()),
                },
                _ = feedback_timer.tick() => {
                    let ts = pg_timestamp();
                    let lsn = PgLsn::from(last_acked);
                    trace!(%lsn, "sending proactive keepalive");
                    // The reply flag forces a prompt PrimaryKeepAlive, which
                    // drives progress in the absence of data updates.
                    stream.as_mut()
                        .standby_status_update(lsn, lsn, lsn, ts, 1)
                        .await
                        .map_err(TransientError::from)?;
                }
                ack = ack_rx.recv(), if acks_open => match ack {
                    Some(watermark) => {
                        if let Ok(lsn) = watermark.to_lsn() {
                            last_acked = std::cmp::max(last_acked, lsn);
                        }
                    }
                    None => acks_open = false,
                }
            }
        }
    }

    /// Decodes one logical replication message, returning a completed
    /// transaction when the message commits one.
    fn decode(
        &mut self,
        message: LogicalReplicationMessage,
        pending: &mut Option<Transaction>,
    ) -> Result<Option<Transaction>, ReplicationError> {
        use LogicalReplicationMessage::*;
        match message {
            Begin(body) => {
                *pending = Some(Transaction {
                    watermark: LexiVersion::from_lsn(body.final_lsn()),
                    changes: Vec::new(),
                });
                Ok(None)
            }
            Commit(body) => {
                let done = pending.take();
                match done {
                    Some(tx) if body.commit_lsn() <= self.resume_lsn => {
                        // Already persisted before this incarnation; the
                        // server replays transactions at or after the
                        // resume point.
                        trace!(watermark = %tx.watermark, "skipping replayed transaction");
                        Ok(None)
                    }
                    Some(tx) => Ok(Some(tx)),
                    None => Err(TransientError::UnknownReplicationMessage.into()),
                }
            }
            Origin(_) => Ok(None),
            Type(body) => Err(DefiniteError::CustomType {
                name: body.name().unwrap_or("<invalid utf8>").to_owned(),
                oid: body.id(),
            }
            .into()),
            Relation(body) => {
                let desc = relation_desc(&body)?;
                self.tables.insert(body.rel_id(), desc.clone());
                buffer(pending, Change::Relation { desc })?;
                Ok(None)
            }
            Insert(body) => {
                let Some(desc) = self.tables.get(&body.rel_id()) else {
                    return Ok(None);
                };
                self.metrics.inserts.inc();
                let row = unpack_row(desc, body.tuple().tuple_data())?;
                let change = Change::Insert {
                    table: TableRef::from(desc),
                    row,
                };
                buffer(pending, change)?;
                Ok(None)
            }
            Update(body) => {
                let Some(desc) = self.tables.get(&body.rel_id()) else {
                    return Ok(None);
                };
                self.metrics.updates.inc();
                let row = unpack_row(desc, body.new_tuple().tuple_data())?;
                // With REPLICA IDENTITY DEFAULT an old tuple is present only
                // when the key itself changed.
                let old_key = body
                    .old_tuple()
                    .or_else(|| body.key_tuple())
                    .map(|old| {
                        let old_row = unpack_row(desc, old.tuple_data())?;
                        Ok::<_, DefiniteError>(old_row.key(desc.key()))
                    })
                    .transpose()?;
                let change = Change::Update {
                    table: TableRef::from(desc),
                    old_key,
                    row,
                };
                buffer(pending, change)?;
                Ok(None)
            }
            Delete(body) => {
                let Some(desc) = self.tables.get(&body.rel_id()) else {
                    return Ok(None);
                };
                self.metrics.deletes.inc();
                let old = body
                    .key_tuple()
                    .or_else(|| body.old_tuple())
                    .ok_or(DefiniteError::ValueDecode {
                        column: "<key>".into(),
                        detail: "delete without key tuple".into(),
                    })?;
                let old_row = unpack_row(desc, old.tuple_data())?;
                let change = Change::Delete {
                    table: TableRef::from(desc),
                    key: old_row.key(desc.key()),
                };
                buffer(pending, change)?;
                Ok(None)
            }
            Truncate(body) => {
                let tables: Vec<TableRef> = body
                    .rel_ids()
                    .iter()
                    .filter_map(|id| self.tables.get(id).map(TableRef::from))
                    .collect();
                if !tables.is_empty() {
                    buffer(pending, Change::Truncate { tables })?;
                }
                Ok(None)
            }
            _ => Err(TransientError::UnknownReplicationMessage.into()),
        }
    }

}

fn buffer(pending: &mut Option<Transaction>, change: Change) -> Result<(), ReplicationError> {
    match pending {
        Some(tx) => {
            tx.changes.push(change);
            Ok(())
        }
        // Data outside a transaction violates the protocol.
        None => Err(TransientError::UnknownReplicationMessage.into()),
    }
}

fn pg_timestamp() -> i64 {
    (SystemTime::now()
        .duration_since(UNIX_EPOCH + PG_EPOCH_OFFSET)
        .unwrap_or_default()
        .as_micros()) as i64
}

/// Builds a [`RelationDesc`] from an upstream `Relation` message, enforcing
/// the replica identity and type policies.
fn relation_desc(
    body: &postgres_replication::protocol::RelationBody,
) -> Result<RelationDesc, DefiniteError> {
    let schema = body.namespace().unwrap_or("public").to_owned();
    let name = body.name().unwrap_or_default().to_owned();
    let qualified = format!("{schema}.{name}");

    // Key columns only in change messages; anything else either floods the
    // stream (FULL) or starves it of keys (NOTHING/INDEX).
    let identity = match body.replica_identity() {
        postgres_replication::protocol::ReplicaIdentity::Default => "default",
        postgres_replication::protocol::ReplicaIdentity::Full => "full",
        postgres_replication::protocol::ReplicaIdentity::Nothing => "nothing",
        postgres_replication::protocol::ReplicaIdentity::Index => "index",
    };
    if identity != "default" {
        return Err(DefiniteError::BadReplicaIdentity {
            table: qualified,
            found: identity.to_owned(),
        });
    }

    let mut desc = RelationDesc::new(schema, name);
    let mut key = Vec::new();
    for column in body.columns() {
        let column_name = column.name().map_err(|_| DefiniteError::ValueDecode {
            column: "<name>".into(),
            detail: "column name is not valid utf8".into(),
        })?;
        let type_oid = column.type_id() as u32;
        let scalar_type =
            scalar_type(type_oid).ok_or_else(|| DefiniteError::UnsupportedType {
                table: qualified.clone(),
                column: column_name.to_owned(),
                type_oid,
            })?;
        // The version column is replicated NOT NULL; everything else is
        // treated as nullable since pgoutput does not carry nullability.
        let nullable = column_name != VERSION_COLUMN;
        desc = desc.with_column(column_name, scalar_type, nullable);
        if column.flags() == 1 {
            key.push(ColumnName::from(column_name));
        }
    }
    Ok(desc.with_key(key))
}

fn scalar_type(oid: u32) -> Option<ScalarType> {
    match oid {
        16 => Some(ScalarType::Bool),
        20 | 21 | 23 => Some(ScalarType::Int8),
        700 | 701 | 1700 => Some(ScalarType::Float8),
        25 | 1042 | 1043 | 2950 => Some(ScalarType::Text),
        17 => Some(ScalarType::Bytea),
        1082 | 1114 | 1184 => Some(ScalarType::Text),
        _ => None,
    }
}

/// Decodes one tuple into a [`Row`]. Columns whose value is an unchanged
/// TOAST reference are omitted; the replica merges them from the stored
/// row.
fn unpack_row<'a>(
    desc: &RelationDesc,
    tuple_data: impl IntoIterator<Item = &'a TupleData>,
) -> Result<Row, DefiniteError> {
    let mut row = Row::new();
    for ((name, ty), data) in desc.columns().iter().zip(tuple_data) {
        match data {
            TupleData::Null => row.set(name.clone(), Datum::Null),
            TupleData::UnchangedToast => {}
            TupleData::Text(bytes) => {
                let text =
                    std::str::from_utf8(bytes).map_err(|_| DefiniteError::ValueDecode {
                        column: name.as_str().to_owned(),
                        detail: "value is not valid utf8".into(),
                    })?;
                row.set(name.clone(), decode_datum(ty.scalar_type, text, name)?);
            }
            _ => {
                return Err(DefiniteError::ValueDecode {
                    column: name.as_str().to_owned(),
                    detail: "unsupported tuple data representation".into(),
                })
            }
        }
    }
    Ok(row)
}

fn decode_datum(
    ty: ScalarType,
    text: &str,
    column: &ColumnName,
) -> Result<Datum, DefiniteError> {
    let bad = |detail: String| DefiniteError::ValueDecode {
        column: column.as_str().to_owned(),
        detail,
    };
    match ty {
        ScalarType::Bool => match text {
            "t" => Ok(Datum::Bool(true)),
            "f" => Ok(Datum::Bool(false)),
            other => Err(bad(format!("bad bool {other:?}"))),
        },
        ScalarType::Int8 => text
            .parse::<i64>()
            .map(Datum::Int)
            .map_err(|e| bad(e.to_string())),
        ScalarType::Float8 => text
            .parse::<f64>()
            .map(Datum::Double)
            .map_err(|e| bad(e.to_string())),
        ScalarType::Text => Ok(Datum::String(text.to_owned())),
        ScalarType::Bytea => {
            let hex = text
                .strip_prefix("\\x")
                .ok_or_else(|| bad("bytea value is not hex encoded".into()))?;
            let mut bytes = Vec::with_capacity(hex.len() / 2);
            let mut chars = hex.as_bytes().chunks_exact(2);
            for pair in &mut chars {
                let s = std::str::from_utf8(pair).map_err(|e| bad(e.to_string()))?;
                bytes.push(u8::from_str_radix(s, 16).map_err(|e| bad(e.to_string()))?);
            }
            Ok(Datum::Bytes(bytes))
        }
    }
}
