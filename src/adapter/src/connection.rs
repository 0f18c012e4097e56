// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-socket connection.
//!
//! Validates every inbound frame, dispatches it to the view syncer or the
//! mutation service, and streams downstream messages under a stop-and-wait
//! protocol: outbound messages carry implicit monotonically-increasing ids
//! (their send order), the client acknowledges with `{"ack": n}`, and the
//! next message is not sent until the previous one is acknowledged. At
//! most one acknowledgement is ever outstanding, so the ack state is a
//! single slot; closing the socket releases it and cancels the downstream
//! sequence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{Downstream, ErrorKind, Mutation, Upstream};
use crate::syncer::{SyncContext, SyncerError, ViewSyncer};

/// A bidirectional text-frame transport; implemented over WebSocket by the
/// server binary and over channels in tests.
#[async_trait]
pub trait Socket: Send {
    /// Sends one frame.
    async fn send(&mut self, frame: String) -> Result<(), std::io::Error>;

    /// Receives the next frame; `None` when the peer closed.
    async fn recv(&mut self) -> Option<Result<String, std::io::Error>>;
}

/// Applies client mutations. The real implementation lives outside the
/// sync core; tests stub it.
#[async_trait]
pub trait MutationService: Send + Sync {
    /// Applies one mutation, returning a client-facing description on
    /// failure.
    async fn apply(&self, group_id: &str, mutation: &Mutation) -> Result<(), String>;
}

/// A mutation service that accepts everything, for wiring without a
/// mutation backend.
#[derive(Debug, Default)]
pub struct NoopMutationService;

#[async_trait]
impl MutationService for NoopMutationService {
    async fn apply(&self, _group_id: &str, _mutation: &Mutation) -> Result<(), String> {
        Ok(())
    }
}

/// One client socket's session.
pub struct Connection<S> {
    socket: S,
    ws_id: String,
    client_group_id: String,
    client_id: String,
    base_cookie: Option<String>,
    syncer: ViewSyncer,
    mutations: Arc<dyn MutationService>,
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("ws_id", &self.ws_id)
            .field("client_group_id", &self.client_group_id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl<S: Socket> Connection<S> {
    /// Creates a connection for an accepted socket. `client_id`,
    /// `client_group_id`, and `base_cookie` come from the connect URL.
    pub fn new(
        socket: S,
        ws_id: impl Into<String>,
        client_group_id: impl Into<String>,
        client_id: impl Into<String>,
        base_cookie: Option<String>,
        syncer: ViewSyncer,
        mutations: Arc<dyn MutationService>,
    ) -> Connection<S> {
        Connection {
            socket,
            ws_id: ws_id.into(),
            client_group_id: client_group_id.into(),
            client_id: client_id.into(),
            base_cookie,
            syncer,
            mutations,
        }
    }

    /// Runs the session until the socket closes or a protocol error tears
    /// it down.
    pub async fn run(mut self) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let mut outbound = Outbound::new();
        outbound.push(Downstream::Connected {
            wsid: self.ws_id.clone(),
            timestamp,
        });

        let mut downstream: Option<mpsc::Receiver<Downstream>> = None;
        loop {
            // Flush at most one unacknowledged message.
            if let Some(frame) = outbound.next_frame() {
                if self.socket.send(frame).await.is_err() {
                    break;
                }
            }
            tokio::select! {
                inbound = self.socket.recv() => {
                    let frame = match inbound {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!(ws = %self.ws_id, "socket error: {e}");
                            break;
                        }
                        None => break,
                    };
                    match self.dispatch(&frame, &mut outbound, &mut downstream).await {
                        Flow::Continue => {}
                        Flow::Close => {
                            // Drain what we owe the client before closing.
                            while let Some(frame) = outbound.next_frame_ignoring_acks() {
                                if self.socket.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            break;
                        }
                    }
                }
                message = recv_downstream(&mut downstream), if downstream.is_some() => {
                    match message {
                        Some(message) => outbound.push(message),
                        None => {
                            // The syncer cancelled this sequence (e.g. a
                            // newer socket superseded it).
                            info!(ws = %self.ws_id, "downstream sequence ended");
                            break;
                        }
                    }
                }
            }
        }
        // Dropping the receiver cancels the source sequence in the syncer.
        info!(ws = %self.ws_id, "connection closed");
    }

    async fn dispatch(
        &mut self,
        frame: &str,
        outbound: &mut Outbound,
        downstream: &mut Option<mpsc::Receiver<Downstream>>,
    ) -> Flow {
        let message = match Upstream::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                outbound.push(Downstream::Error {
                    kind: ErrorKind::InvalidMessage,
                    detail: e.to_string(),
                });
                return Flow::Close;
            }
        };
        match message {
            Upstream::Ack(id) => {
                outbound.ack(id);
                Flow::Continue
            }
            Upstream::Ping => {
                outbound.push(Downstream::Pong);
                Flow::Continue
            }
            Upstream::Pull(_) => Flow::Continue,
            Upstream::Push(body) => {
                if body.client_group_id != self.client_group_id {
                    outbound.push(Downstream::Error {
                        kind: ErrorKind::InvalidPush,
                        detail: format!(
                            "push clientGroupID {:?} does not match connection group {:?}",
                            body.client_group_id, self.client_group_id,
                        ),
                    });
                    return Flow::Close;
                }
                for mutation in &body.mutations {
                    if let Err(detail) = self.mutations.apply(&self.client_group_id, mutation).await
                    {
                        // Per-mutation failures are reported and the rest
                        // of the push continues.
                        outbound.push(Downstream::Error {
                            kind: ErrorKind::MutationFailed,
                            detail,
                        });
                    }
                }
                Flow::Continue
            }
            Upstream::ChangeDesiredQueries(body) => {
                let result = self
                    .syncer
                    .change_desired_queries(self.sync_context(), body.desired_queries_patch)
                    .await;
                self.handle_syncer_result(result, outbound)
            }
            Upstream::InitConnection(body) => {
                match self
                    .syncer
                    .init_connection(self.sync_context(), body.desired_queries_patch)
                    .await
                {
                    Ok(rx) => {
                        *downstream = Some(rx);
                        Flow::Continue
                    }
                    Err(e) => self.handle_syncer_result::<()>(Err(e), outbound),
                }
            }
        }
    }

    fn handle_syncer_result<T>(
        &self,
        result: Result<T, SyncerError>,
        outbound: &mut Outbound,
    ) -> Flow {
        match result {
            Ok(_) => Flow::Continue,
            Err(e @ SyncerError::Compile(_)) | Err(e @ SyncerError::Cvr(_)) => {
                // Bad client input: reject the request, keep the session.
                outbound.push(Downstream::Error {
                    kind: ErrorKind::InvalidMessage,
                    detail: e.to_string(),
                });
                Flow::Continue
            }
            Err(e) => {
                warn!(ws = %self.ws_id, "syncer failure: {e}");
                outbound.push(Downstream::Error {
                    kind: ErrorKind::Internal,
                    detail: e.to_string(),
                });
                Flow::Close
            }
        }
    }

    fn sync_context(&self) -> SyncContext {
        SyncContext {
            client_id: self.client_id.clone(),
            ws_id: self.ws_id.clone(),
            base_cookie: self.base_cookie.clone(),
        }
    }
}

async fn recv_downstream(
    downstream: &mut Option<mpsc::Receiver<Downstream>>,
) -> Option<Downstream> {
    match downstream {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

enum Flow {
    Continue,
    Close,
}

/// The stop-and-wait outbound queue: messages leave one at a time, each
/// holding the line until its positional id is acknowledged.
struct Outbound {
    queue: VecDeque<Downstream>,
    next_id: u64,
    awaiting: Option<u64>,
}

impl Outbound {
    fn new() -> Outbound {
        Outbound {
            queue: VecDeque::new(),
            next_id: 1,
            awaiting: None,
        }
    }

    fn push(&mut self, message: Downstream) {
        self.queue.push_back(message);
    }

    fn ack(&mut self, id: u64) {
        if self.awaiting == Some(id) {
            self.awaiting = None;
        }
    }

    /// The next frame to write, unless one is still unacknowledged.
    fn next_frame(&mut self) -> Option<String> {
        if self.awaiting.is_some() {
            return None;
        }
        let message = self.queue.pop_front()?;
        let id = self.next_id;
        self.next_id += 1;
        self.awaiting = Some(id);
        Some(message.encode().to_string())
    }

    /// Drains frames regardless of acknowledgement state; used only while
    /// closing, when no more acks can arrive.
    fn next_frame_ignoring_acks(&mut self) -> Option<String> {
        let message = self.queue.pop_front()?;
        Some(message.encode().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PokeEnd;

    #[test]
    fn outbound_is_stop_and_wait() {
        let mut outbound = Outbound::new();
        outbound.push(Downstream::Pong);
        outbound.push(Downstream::PokeEnd(PokeEnd { poke_id: "0a".into() }));
        assert!(outbound.next_frame().is_some());
        // The second message is held until the first is acknowledged.
        assert!(outbound.next_frame().is_none());
        outbound.ack(1);
        assert!(outbound.next_frame().is_some());
        assert!(outbound.next_frame().is_none());
        // Acks for other ids do not release the slot.
        outbound.ack(1);
        assert!(outbound.next_frame().is_none());
        outbound.ack(2);
        assert!(outbound.next_frame().is_none());
    }
}
