// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The change source seam.
//!
//! A [`ChangeSource`] produces the strict, gap-free stream of committed
//! upstream transactions starting from a watermark, together with a sink
//! for acknowledging what has been durably persisted. The production
//! implementation is [`postgres::PostgresChangeSource`]; tests use the
//! scripted [`TestSource`].
//!
//! Errors follow the transient/definite split: a [`TransientError`] tears
//! down the stream and is retried with backoff, while a [`DefiniteError`]
//! describes an upstream state that retrying cannot fix.

use async_trait::async_trait;
use tokio::sync::mpsc;

use lens_repr::LexiVersion;
use lens_storage_types::Transaction;

pub mod postgres;

/// Channel capacity for in-flight transactions between a source task and
/// its consumer.
pub(crate) const SOURCE_CHANNEL_CAPACITY: usize = 256;

/// A live connection to the upstream change feed.
#[derive(Debug)]
pub struct ChangeStream {
    /// Committed transactions with watermark strictly beyond the requested
    /// start, in watermark order. A `None` from the channel means the
    /// connection ended and the caller should reconnect.
    pub transactions: mpsc::Receiver<Result<Transaction, ReplicationError>>,
    /// Durably-persisted watermarks, forwarded upstream as acknowledgement.
    /// Duplicate acknowledgements are harmless.
    pub acks: mpsc::Sender<LexiVersion>,
}

/// A factory for upstream change streams.
#[async_trait]
pub trait ChangeSource: Send + Sync + 'static {
    /// Opens the stream of transactions committed strictly after `from`.
    async fn start(&self, from: LexiVersion) -> Result<ChangeStream, TransientError>;
}

/// An error in upstream replication.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Worth retrying.
    #[error(transparent)]
    Transient(#[from] TransientError),
    /// Not worth retrying.
    #[error(transparent)]
    Definite(#[from] DefiniteError),
}

/// A transient error: the stream is torn down and reconnected with
/// backoff.
#[derive(Debug, thiserror::Error)]
pub enum TransientError {
    /// The replication stream ended without an error; it never should.
    #[error("replication stream ended prematurely")]
    ReplicationEOF,
    /// An unrecognized replication protocol frame.
    #[error("unknown replication message")]
    UnknownReplicationMessage,
    /// The upstream no longer retains the requested watermark.
    #[error("replication slot compacted past the requested watermark {requested}")]
    OvercompactedSlot {
        /// The watermark the subscriber asked for.
        requested: LexiVersion,
    },
    /// A database-level error.
    #[error("postgres error")]
    Postgres(#[from] tokio_postgres::Error),
    /// A socket-level error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Anything else.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

/// A definite error: the upstream is in a state that retrying will not
/// change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefiniteError {
    /// A published table does not use `REPLICA IDENTITY DEFAULT`.
    #[error("table {table} requires REPLICA IDENTITY DEFAULT, found {found}")]
    BadReplicaIdentity {
        /// The offending table.
        table: String,
        /// The identity the table actually uses.
        found: String,
    },
    /// A column uses a type the replica cannot represent.
    #[error("table {table} column {column} has unsupported type oid {type_oid}")]
    UnsupportedType {
        /// The offending table.
        table: String,
        /// The offending column.
        column: String,
        /// The upstream type.
        type_oid: u32,
    },
    /// The upstream stream described a custom user type.
    #[error("custom type {name} (oid {oid}) cannot be replicated")]
    CustomType {
        /// The type's name.
        name: String,
        /// The type's oid.
        oid: u32,
    },
    /// A value failed to decode under its declared type.
    #[error("unable to decode value for column {column}: {detail}")]
    ValueDecode {
        /// The offending column.
        column: String,
        /// What went wrong.
        detail: String,
    },
    /// The publication disappeared upstream.
    #[error("publication {0} no longer exists")]
    PublicationDropped(String),
}

/// A scripted change source for tests: replays its scripted transactions
/// to every subscription, delivers transactions scripted later to live
/// subscriptions, and records the acknowledgements it receives.
#[derive(Debug)]
pub struct TestSource {
    transactions: std::sync::Mutex<Vec<Transaction>>,
    acks: std::sync::Mutex<Vec<LexiVersion>>,
    live: std::sync::Mutex<Vec<mpsc::Sender<Result<Transaction, ReplicationError>>>>,
}

impl TestSource {
    /// Creates a source that will replay `transactions` and then hold the
    /// stream open.
    pub fn new(transactions: Vec<Transaction>) -> TestSource {
        TestSource {
            transactions: std::sync::Mutex::new(transactions),
            acks: std::sync::Mutex::new(Vec::new()),
            live: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Commits a transaction: future subscriptions replay it and live
    /// subscriptions receive it immediately.
    pub fn script(&self, transaction: Transaction) {
        self.transactions
            .lock()
            .expect("poisoned")
            .push(transaction.clone());
        self.live
            .lock()
            .expect("poisoned")
            .retain(|tx| tx.try_send(Ok(transaction.clone())).is_ok());
    }

    /// The acknowledgements received so far.
    pub fn acked(&self) -> Vec<LexiVersion> {
        self.acks.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl ChangeSource for std::sync::Arc<TestSource> {
    async fn start(&self, from: LexiVersion) -> Result<ChangeStream, TransientError> {
        let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let (ack_tx, mut ack_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let pending: Vec<Transaction> = self
            .transactions
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|t| t.watermark > from)
            .cloned()
            .collect();
        for t in pending {
            let _ = tx.try_send(Ok(t));
        }
        self.live.lock().expect("poisoned").push(tx);
        let this = std::sync::Arc::clone(self);
        lens_ore::task::spawn(
            || "test-change-source-acks",
            async move {
                while let Some(ack) = ack_rx.recv().await {
                    this.acks.lock().expect("poisoned").push(ack);
                }
            },
        );
        Ok(ChangeStream {
            transactions: rx,
            acks: ack_tx,
        })
    }
}
