// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The HTTP and WebSocket surface.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing, Router};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use lens_adapter::connection::{Connection, Socket};

use crate::server::Server;

/// Builds the server's router.
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/sync/v1/connect", routing::get(handle_connect))
        .route("/healthz", routing::get(handle_healthz))
        .route("/metrics", routing::get(handle_metrics))
        .with_state(server)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    #[serde(rename = "clientGroupID")]
    client_group_id: String,
    #[serde(rename = "clientID")]
    client_id: String,
    #[serde(default)]
    base_cookie: Option<String>,
    #[serde(default)]
    wsid: Option<String>,
}

async fn handle_connect(
    State(server): State<Arc<Server>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let syncer = match server.syncer_for(&params.client_group_id) {
        Ok(syncer) => syncer,
        Err(e) => {
            warn!(group = %params.client_group_id, "cannot start view syncer: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let mutations = server.mutations();
    ws.on_upgrade(move |socket| async move {
        let ws_id = params
            .wsid
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(ws = %ws_id, group = %params.client_group_id, "client connected");
        Connection::new(
            WsSocket(socket),
            ws_id,
            params.client_group_id,
            params.client_id,
            params.base_cookie,
            syncer,
            mutations,
        )
        .run()
        .await;
    })
    .into_response()
}

async fn handle_healthz(State(server): State<Arc<Server>>) -> impl IntoResponse {
    let status = server.streamer().status();
    axum::Json(serde_json::json!({
        "watermark": status.watermark.as_ref().map(|w| w.as_str().to_owned()),
        "subscribers": status.subscribers,
    }))
}

async fn handle_metrics(State(server): State<Arc<Server>>) -> impl IntoResponse {
    use prometheus::Encoder;
    let mut buf = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if encoder
        .encode(&server.metrics_registry().gather(), &mut buf)
        .is_err()
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (StatusCode::OK, buf).into_response()
}

/// Adapts an axum WebSocket to the connection's [`Socket`] seam.
struct WsSocket(WebSocket);

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, frame: String) -> Result<(), std::io::Error> {
        self.0
            .send(Message::Text(frame))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, std::io::Error>> {
        loop {
            match self.0.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                // Axum answers protocol pings itself; other control frames
                // carry nothing we dispatch on.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    return Some(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        e.to_string(),
                    )))
                }
            }
        }
    }
}
