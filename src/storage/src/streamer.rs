// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The change streamer service.
//!
//! One task serializes the entire upstream order: it receives committed
//! transactions from the change source, appends them durably to the change
//! log, applies them to the replica, broadcasts them to every live
//! subscriber, and only then acknowledges upstream. Because subscription
//! handling runs on the same task, a new subscriber's catch-up scan and its
//! entry into the live broadcast cannot interleave with a commit: the
//! splice is gap-free and duplicate-free by construction.
//!
//! Subscriber channels are bounded. A subscriber that stops draining does
//! not stall the service or its peers; it is cancelled with a typed error
//! and removed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use lens_ore::retry::Backoff;
use lens_ore::task;
use lens_repr::LexiVersion;
use lens_storage_types::Transaction;

use crate::changelog::{AppendOutcome, ChangeLog};
use crate::metrics::SourceMetrics;
use crate::replica::Replica;
use crate::source::{ChangeSource, ReplicationError};

/// Default bound for each subscriber's transaction channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 4096;

/// What a subscriber receives: committed transactions in watermark order,
/// or a terminal error.
pub type SubscriberItem = Result<Transaction, SubscribeError>;

/// A subscription request.
#[derive(Debug)]
pub struct SubscribeRequest {
    /// Identifies the subscriber, for diagnostics and replacement: a new
    /// subscription under a live id supersedes the old one.
    pub id: String,
    /// Deliver transactions with watermark strictly beyond this.
    pub watermark: LexiVersion,
    /// The snapshot version the subscriber's state was built from. A
    /// mismatch is rejected: the subscriber must rebuild from scratch.
    pub replica_version: LexiVersion,
    /// True when the subscriber has no prior state and expects the full
    /// catch-up to start at `watermark`.
    pub initial: bool,
}

/// Why a subscription was rejected or cancelled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The subscriber was built against a different replica snapshot.
    /// Non-retryable.
    #[error("replica version mismatch: streamer has {expected}, subscriber has {got}")]
    WrongReplicaVersion {
        /// The streamer's snapshot version.
        expected: LexiVersion,
        /// The subscriber's snapshot version.
        got: LexiVersion,
    },
    /// The subscriber failed to drain its channel before it overflowed.
    #[error("subscriber fell too far behind and was cancelled")]
    Lagging,
    /// The service is shutting down.
    #[error("change streamer is stopped")]
    Stopped,
    /// The durable log could not serve the catch-up scan.
    #[error("catch-up scan failed: {0}")]
    CatchupFailed(String),
}

/// A snapshot of the streamer's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerStatus {
    /// The last durably committed watermark.
    pub watermark: Option<LexiVersion>,
    /// The number of live subscribers.
    pub subscribers: usize,
}

/// A handle to a running change streamer service.
#[derive(Debug)]
pub struct ChangeStreamer {
    subscribe_tx: mpsc::Sender<(SubscribeRequest, oneshot::Sender<SubscribeReply>)>,
    status_rx: watch::Receiver<StreamerStatus>,
    stop_tx: watch::Sender<bool>,
}

type SubscribeReply = Result<mpsc::Receiver<SubscriberItem>, SubscribeError>;

impl ChangeStreamer {
    /// Spawns the service. `replica` must already be seeded (its
    /// `replica_version` set); the service resumes from the replica's last
    /// applied watermark.
    pub fn spawn(
        source: Arc<dyn ChangeSource>,
        changelog: ChangeLog,
        replica: Replica,
        metrics: SourceMetrics,
        subscriber_capacity: usize,
    ) -> ChangeStreamer {
        let (subscribe_tx, subscribe_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(StreamerStatus {
            watermark: None,
            subscribers: 0,
        });
        let service = Service {
            source,
            changelog,
            replica,
            metrics,
            subscriber_capacity,
            subscribers: Vec::new(),
            stop_rx,
            status_tx,
        };
        task::spawn(|| "change-streamer", service.run(subscribe_rx));
        ChangeStreamer {
            subscribe_tx,
            status_rx,
            stop_tx,
        }
    }

    /// Subscribes to the change stream.
    pub async fn subscribe(&self, req: SubscribeRequest) -> SubscribeReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.subscribe_tx
            .send((req, reply_tx))
            .await
            .map_err(|_| SubscribeError::Stopped)?;
        reply_rx.await.map_err(|_| SubscribeError::Stopped)?
    }

    /// The current service status.
    pub fn status(&self) -> StreamerStatus {
        self.status_rx.borrow().clone()
    }

    /// Signals the service to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

struct Subscriber {
    id: String,
    tx: mpsc::Sender<SubscriberItem>,
}

struct Service {
    source: Arc<dyn ChangeSource>,
    changelog: ChangeLog,
    replica: Replica,
    metrics: SourceMetrics,
    subscriber_capacity: usize,
    subscribers: Vec<Subscriber>,
    stop_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<StreamerStatus>,
}

impl Service {
    async fn run(
        mut self,
        mut subscribe_rx: mpsc::Receiver<(SubscribeRequest, oneshot::Sender<SubscribeReply>)>,
    ) {
        let replica_version = match self.replica.replica_version() {
            Ok(Some(v)) => v,
            Ok(None) => LexiVersion::min(),
            Err(e) => {
                error!("replica is unreadable, streamer cannot start: {e}");
                return;
            }
        };
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let mut stop_rx = self.stop_rx.clone();
        loop {
            if *stop_rx.borrow() {
                self.shutdown();
                return;
            }
            let from = match self.resume_watermark(&replica_version) {
                Ok(from) => from,
                Err(e) => {
                    error!("cannot determine resume watermark: {e}");
                    self.shutdown();
                    return;
                }
            };
            let mut stream = tokio::select! {
                res = self.source.start(from.clone()) => match res {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(%from, "upstream connection failed, backing off: {e}");
                        tokio::select! {
                            _ = backoff.sleep() => continue,
                            _ = stop_rx.changed() => continue,
                        }
                    }
                },
                _ = stop_rx.changed() => continue,
            };
            info!(%from, "streaming changes");
            loop {
                tokio::select! {
                    message = stream.transactions.recv() => match message {
                        Some(Ok(transaction)) => {
                            // A healthy frame resets the reconnect backoff.
                            backoff.reset();
                            match self.commit(transaction, &replica_version, &stream.acks).await {
                                Ok(()) => {}
                                Err(e) => {
                                    error!("persistence failure is fatal, not acknowledging: {e}");
                                    self.shutdown();
                                    return;
                                }
                            }
                        }
                        Some(Err(ReplicationError::Definite(e))) => {
                            error!("definite upstream error, stopping: {e}");
                            self.shutdown();
                            return;
                        }
                        Some(Err(ReplicationError::Transient(e))) => {
                            warn!("transient upstream error, reconnecting: {e}");
                            break;
                        }
                        None => {
                            warn!("upstream stream closed, reconnecting");
                            break;
                        }
                    },
                    request = subscribe_rx.recv() => match request {
                        Some((req, reply)) => {
                            let result = self.handle_subscribe(req, &replica_version);
                            let _ = reply.send(result);
                            self.publish_status();
                        }
                        None => {
                            self.shutdown();
                            return;
                        }
                    },
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            self.shutdown();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn resume_watermark(
        &self,
        replica_version: &LexiVersion,
    ) -> Result<LexiVersion, crate::replica::ReplicaError> {
        Ok(self
            .replica
            .version()?
            .unwrap_or_else(|| replica_version.clone()))
    }

    /// Persist, apply, broadcast, acknowledge; strictly in that order.
    async fn commit(
        &mut self,
        transaction: Transaction,
        replica_version: &LexiVersion,
        acks: &mpsc::Sender<LexiVersion>,
    ) -> Result<(), anyhow::Error> {
        let watermark = transaction.watermark.clone();
        match self.changelog.append(&transaction)? {
            AppendOutcome::Appended => {
                self.replica.apply(&transaction)?;
                self.broadcast(transaction);
            }
            AppendOutcome::AlreadyPersisted => {
                // A replayed transaction after a restart. The replica may
                // still need it if the crash fell between append and apply;
                // live subscribers never do, since their catch-up came from
                // the log this transaction is already in.
                let applied = self.replica.version()?.unwrap_or_else(|| replica_version.clone());
                if applied < watermark {
                    self.replica.apply(&transaction)?;
                }
                info!(%watermark, "skipping already-persisted transaction, re-acking");
            }
        }
        // Duplicate acks are harmless; a missing ack only delays upstream
        // WAL truncation until the next commit.
        let _ = acks.send(watermark).await;
        self.publish_status();
        Ok(())
    }

    fn broadcast(&mut self, transaction: Transaction) {
        self.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(Ok(transaction.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(id = %subscriber.id, "cancelling subscriber: channel overflow");
                    // Deliver the cancellation once the subscriber drains a
                    // slot; if it never does, dropping the sender ends its
                    // stream anyway.
                    let tx = subscriber.tx.clone();
                    task::spawn(|| "subscriber-cancel", async move {
                        let _ = tx.send(Err(SubscribeError::Lagging)).await;
                    });
                    false
                }
            }
        });
    }

    fn handle_subscribe(
        &mut self,
        req: SubscribeRequest,
        replica_version: &LexiVersion,
    ) -> SubscribeReply {
        if req.replica_version != *replica_version {
            return Err(SubscribeError::WrongReplicaVersion {
                expected: replica_version.clone(),
                got: req.replica_version,
            });
        }
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        // Catch up from the durable log, then enter the live broadcast.
        // Nothing can commit between the scan and the push because both
        // happen on the service task; the splice point is exact.
        let backlog = self
            .changelog
            .scan(&req.watermark)
            .map_err(|e| SubscribeError::CatchupFailed(e.to_string()))?;
        info!(
            id = %req.id,
            from = %req.watermark,
            backlog = backlog.len(),
            initial = req.initial,
            "subscriber joining",
        );
        for transaction in backlog {
            if tx.try_send(Ok(transaction)).is_err() {
                // The catch-up alone overflowed the channel; the subscriber
                // would be cancelled on its first live commit anyway.
                return Err(SubscribeError::Lagging);
            }
        }
        // A resubscription under a live id supersedes the old stream.
        self.subscribers.retain(|s| s.id != req.id);
        self.subscribers.push(Subscriber { id: req.id, tx });
        Ok(rx)
    }

    fn publish_status(&self) {
        self.metrics.subscribers.set(self.subscribers.len() as i64);
        let _ = self.status_tx.send(StreamerStatus {
            watermark: self.changelog.latest_watermark().ok().flatten(),
            subscribers: self.subscribers.len(),
        });
    }

    fn shutdown(&mut self) {
        for subscriber in self.subscribers.drain(..) {
            let _ = subscriber.tx.try_send(Err(SubscribeError::Stopped));
        }
        let _ = self.status_tx.send(StreamerStatus {
            watermark: self.changelog.latest_watermark().ok().flatten(),
            subscribers: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use lens_repr::{Datum, RelationDesc, Row, ScalarType, VERSION_COLUMN};
    use lens_storage_types::{Change, TableRef};

    use super::*;
    use crate::source::TestSource;

    fn issues_desc() -> RelationDesc {
        RelationDesc::new("public", "issues")
            .with_column("id", ScalarType::Text, false)
            .with_column("title", ScalarType::Text, true)
            .with_column(VERSION_COLUMN, ScalarType::Text, false)
            .with_key(vec!["id".into()])
    }

    fn insert_tx(lsn: u64, id: &str) -> Transaction {
        let mut row = Row::new();
        row.set("id", id);
        row.set("title", "t");
        Transaction {
            watermark: LexiVersion::from_lsn(lsn),
            changes: vec![Change::Insert {
                table: TableRef::new("public", "issues"),
                row,
            }],
        }
    }

    fn seeded_replica() -> Replica {
        let mut replica = Replica::open_in_memory().unwrap();
        replica.create_table(&issues_desc()).unwrap();
        replica.set_replica_version(&LexiVersion::from_lsn(1)).unwrap();
        replica
    }

    fn request(from: u64) -> SubscribeRequest {
        SubscribeRequest {
            id: "test".into(),
            watermark: LexiVersion::from_lsn(from),
            replica_version: LexiVersion::from_lsn(1),
            initial: true,
        }
    }

    #[tokio::test]
    async fn persists_broadcasts_and_acks_in_order() {
        let source = Arc::new(TestSource::new(vec![insert_tx(5, "a"), insert_tx(6, "b")]));
        let streamer = ChangeStreamer::spawn(
            Arc::new(Arc::clone(&source)),
            ChangeLog::open_in_memory().unwrap(),
            seeded_replica(),
            SourceMetrics::unregistered(),
            16,
        );
        let mut rx = streamer.subscribe(request(1)).await.unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert!(first.watermark < second.watermark);
        // Upstream was acked only after persistence.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let acked = source.acked();
        assert_eq!(acked.len(), 2);
        assert_eq!(acked[1], LexiVersion::from_lsn(6));
        assert_eq!(
            streamer.status().watermark,
            Some(LexiVersion::from_lsn(6))
        );
    }

    #[tokio::test]
    async fn late_subscriber_catches_up_without_gaps() {
        let source = Arc::new(TestSource::new(vec![insert_tx(5, "a"), insert_tx(6, "b")]));
        let streamer = ChangeStreamer::spawn(
            Arc::new(Arc::clone(&source)),
            ChangeLog::open_in_memory().unwrap(),
            seeded_replica(),
            SourceMetrics::unregistered(),
            16,
        );
        // Let both transactions commit before subscribing.
        let mut first = streamer.subscribe(request(1)).await.unwrap();
        first.recv().await.unwrap().unwrap();
        first.recv().await.unwrap().unwrap();

        // The late subscriber replays the same sequence from the log.
        let mut late = streamer.subscribe(SubscribeRequest { id: "late".into(), ..request(1) }).await.unwrap();
        let a = late.recv().await.unwrap().unwrap();
        let b = late.recv().await.unwrap().unwrap();
        assert_eq!(a.watermark, LexiVersion::from_lsn(5));
        assert_eq!(b.watermark, LexiVersion::from_lsn(6));
    }

    #[tokio::test]
    async fn wrong_replica_version_is_rejected() {
        let source = Arc::new(TestSource::new(vec![]));
        let streamer = ChangeStreamer::spawn(
            Arc::new(source),
            ChangeLog::open_in_memory().unwrap(),
            seeded_replica(),
            SourceMetrics::unregistered(),
            16,
        );
        let err = streamer
            .subscribe(SubscribeRequest {
                replica_version: LexiVersion::from_lsn(999),
                ..request(1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::WrongReplicaVersion { .. }));
    }

    #[tokio::test]
    async fn duplicate_transaction_is_reacked_not_reapplied() {
        // The same transaction twice, as if upstream replayed it after a
        // reconnect that lost the ack.
        let source = Arc::new(TestSource::new(vec![insert_tx(5, "a"), insert_tx(5, "a")]));
        let streamer = ChangeStreamer::spawn(
            Arc::new(Arc::clone(&source)),
            ChangeLog::open_in_memory().unwrap(),
            seeded_replica(),
            SourceMetrics::unregistered(),
            16,
        );
        let mut rx = streamer.subscribe(request(1)).await.unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.watermark, LexiVersion::from_lsn(5));
        // The duplicate is not re-broadcast, but it is re-acked.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(source.acked().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_is_cancelled_not_blocking() {
        let source = Arc::new(TestSource::new(
            (5..10).map(|lsn| insert_tx(lsn, "x")).collect(),
        ));
        let streamer = ChangeStreamer::spawn(
            Arc::new(source),
            ChangeLog::open_in_memory().unwrap(),
            seeded_replica(),
            SourceMetrics::unregistered(),
            // A capacity of two cannot hold five transactions.
            2,
        );
        let mut rx = streamer.subscribe(request(1)).await.unwrap();
        // Do not drain; wait for the service to overflow the channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut saw_cancel = false;
        for _ in 0..10 {
            match rx.recv().await {
                Some(Ok(_)) => continue,
                Some(Err(SubscribeError::Lagging)) => {
                    saw_cancel = true;
                    break;
                }
                other => panic!("unexpected item {other:?}"),
            }
        }
        assert!(saw_cancel);
        assert_eq!(streamer.status().subscribers, 0);
    }
}
