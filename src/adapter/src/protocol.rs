// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The client wire protocol.
//!
//! Messages are JSON arrays of `[tag, body]` (the error message carries two
//! payload elements: `['error', kind, detail]`). Decoding is strict: an
//! unknown tag, a non-array frame, or a body that fails validation is an
//! [`ProtocolError`], which connections surface as `InvalidMessage`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lens_sql::ast::Ast;

/// A message from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    /// `['ping', {}]`
    Ping,
    /// `['push', {...}]`
    Push(PushBody),
    /// `['pull', {...}]`; accepted but not part of the sync core.
    Pull(Value),
    /// `['changeDesiredQueries', {...}]`
    ChangeDesiredQueries(ChangeDesiredQueriesBody),
    /// `['initConnection', {...}]`
    InitConnection(InitConnectionBody),
    /// `{'ack': n}`: a stop-and-wait acknowledgement for an outbound
    /// message.
    Ack(u64),
}

/// The body of a `push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PushBody {
    /// The client group the mutations belong to.
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    /// The mutations, in order.
    pub mutations: Vec<Mutation>,
    /// The schema version the client pushed under.
    #[serde(default)]
    pub schema_version: Option<u64>,
}

/// One client mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Mutation {
    /// Per-client monotonically increasing id.
    pub id: u64,
    /// The originating client.
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// The mutator name.
    pub name: String,
    /// The mutator arguments.
    #[serde(default)]
    pub args: Value,
}

/// The body of a `changeDesiredQueries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangeDesiredQueriesBody {
    /// The patch to apply to the client's desired queries.
    pub desired_queries_patch: Vec<QueriesPatchOp>,
}

/// The body of an `initConnection`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InitConnectionBody {
    /// The client's initial desired queries.
    pub desired_queries_patch: Vec<QueriesPatchOp>,
}

/// A put/del patch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Upsert.
    Put,
    /// Remove.
    Del,
}

/// One desired- or got-queries patch entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueriesPatchOp {
    /// Whether the query is added or removed.
    pub op: PatchOp,
    /// The query hash, assigned by the client.
    pub hash: String,
    /// The query AST; required for `put`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ast: Option<Ast>,
}

/// One clients patch entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientsPatchOp {
    /// Whether the client is added or removed.
    pub op: PatchOp,
    /// The client id.
    #[serde(rename = "clientID")]
    pub client_id: String,
}

/// One entities patch entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntityPatchOp {
    /// Whether the entity is put or deleted.
    pub op: PatchOp,
    /// The entity's table.
    pub entity_type: String,
    /// The entity's primary key, as a JSON object of key columns.
    #[serde(rename = "entityID")]
    pub entity_id: Value,
    /// The entity's projected columns; present for `put`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// `['pokeStart', ...]`: opens a version-aligned batch of patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PokeStart {
    /// Identifies the poke; equals its cookie.
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    /// The cookie the client must currently hold; null for a fresh client.
    pub base_cookie: Option<String>,
    /// The cookie the client holds after applying the poke.
    pub cookie: String,
}

/// `['pokePart', ...]`: one chunk of a poke.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PokePart {
    /// The poke this part belongs to.
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    /// Clients added to or removed from the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients_patch: Option<Vec<ClientsPatchOp>>,
    /// Confirmed mutation ids, per client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mutation_id_changes: Option<BTreeMap<String, u64>>,
    /// Desired-query changes, per client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<String, Vec<QueriesPatchOp>>>,
    /// Row-level changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities_patch: Option<Vec<EntityPatchOp>>,
    /// Queries whose results are now reflected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueriesPatchOp>>,
}

/// `['pokeEnd', ...]`: closes a poke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PokeEnd {
    /// The poke being closed.
    #[serde(rename = "pokeID")]
    pub poke_id: String,
}

/// The wire error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A malformed or unexpected inbound message.
    InvalidMessage,
    /// A push for the wrong client group.
    InvalidPush,
    /// A mutation failed to apply.
    MutationFailed,
    /// An internal server error.
    Internal,
}

/// A message to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Downstream {
    /// `['connected', {wsid, timestamp}]`
    Connected {
        /// The socket's id.
        wsid: String,
        /// Milliseconds since the epoch.
        timestamp: i64,
    },
    /// `['pong', {}]`
    Pong,
    /// `['pokeStart', {...}]`
    PokeStart(PokeStart),
    /// `['pokePart', {...}]`
    PokePart(PokePart),
    /// `['pokeEnd', {...}]`
    PokeEnd(PokeEnd),
    /// `['error', kind, detail]`
    Error {
        /// The error kind.
        kind: ErrorKind,
        /// Human-readable detail.
        detail: String,
    },
}

/// A malformed inbound frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a JSON array of `[tag, body]`.
    #[error("message must be a [tag, body] array")]
    BadFrame,
    /// The tag is not one this server speaks.
    #[error("unknown message tag {0:?}")]
    UnknownTag(String),
    /// The body failed validation.
    #[error("invalid {tag} body: {detail}")]
    BadBody {
        /// The message tag.
        tag: &'static str,
        /// What was wrong.
        detail: String,
    },
}

impl Upstream {
    /// Decodes and validates one inbound frame.
    pub fn decode(text: &str) -> Result<Upstream, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::BadFrame)?;
        // Stop-and-wait acknowledgements are bare objects.
        if let Some(ack) = value.get("ack").and_then(Value::as_u64) {
            if value.as_object().map(|o| o.len()) == Some(1) {
                return Ok(Upstream::Ack(ack));
            }
        }
        let parts = value.as_array().ok_or(ProtocolError::BadFrame)?;
        let (tag, body) = match parts.as_slice() {
            [tag, body] => (tag.as_str().ok_or(ProtocolError::BadFrame)?, body),
            _ => return Err(ProtocolError::BadFrame),
        };
        let bad = |tag: &'static str| {
            move |e: serde_json::Error| ProtocolError::BadBody {
                tag,
                detail: e.to_string(),
            }
        };
        match tag {
            "ping" => Ok(Upstream::Ping),
            "push" => Ok(Upstream::Push(
                serde_json::from_value(body.clone()).map_err(bad("push"))?,
            )),
            "pull" => Ok(Upstream::Pull(body.clone())),
            "changeDesiredQueries" => Ok(Upstream::ChangeDesiredQueries(
                serde_json::from_value(body.clone()).map_err(bad("changeDesiredQueries"))?,
            )),
            "initConnection" => Ok(Upstream::InitConnection(
                serde_json::from_value(body.clone()).map_err(bad("initConnection"))?,
            )),
            other => Err(ProtocolError::UnknownTag(other.to_owned())),
        }
    }
}

impl Downstream {
    /// Encodes one outbound frame.
    pub fn encode(&self) -> Value {
        match self {
            Downstream::Connected { wsid, timestamp } => serde_json::json!([
                "connected",
                { "wsid": wsid, "timestamp": timestamp },
            ]),
            Downstream::Pong => serde_json::json!(["pong", {}]),
            Downstream::PokeStart(body) => {
                serde_json::json!(["pokeStart", body])
            }
            Downstream::PokePart(body) => serde_json::json!(["pokePart", body]),
            Downstream::PokeEnd(body) => serde_json::json!(["pokeEnd", body]),
            Downstream::Error { kind, detail } => {
                serde_json::json!(["error", kind, detail])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_upstream_frames() {
        assert_eq!(Upstream::decode(r#"["ping", {}]"#).unwrap(), Upstream::Ping);
        assert_eq!(Upstream::decode(r#"{"ack": 7}"#).unwrap(), Upstream::Ack(7));
        let push = Upstream::decode(
            r#"["push", {"clientGroupID": "g1", "mutations": [
                {"id": 1, "clientID": "c1", "name": "createIssue", "args": {"x": 1}}
            ]}]"#,
        )
        .unwrap();
        match push {
            Upstream::Push(body) => {
                assert_eq!(body.client_group_id, "g1");
                assert_eq!(body.mutations[0].name, "createIssue");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(Upstream::decode("not json").unwrap_err(), ProtocolError::BadFrame);
        assert_eq!(Upstream::decode(r#"{"x": 1}"#).unwrap_err(), ProtocolError::BadFrame);
        assert_eq!(
            Upstream::decode(r#"["frobnicate", {}]"#).unwrap_err(),
            ProtocolError::UnknownTag("frobnicate".into())
        );
        assert!(matches!(
            Upstream::decode(r#"["push", {"mutations": []}]"#).unwrap_err(),
            ProtocolError::BadBody { tag: "push", .. }
        ));
    }

    #[test]
    fn encodes_downstream_frames() {
        let frame = Downstream::Error {
            kind: ErrorKind::InvalidPush,
            detail: "wrong group".into(),
        }
        .encode();
        assert_eq!(
            frame,
            serde_json::json!(["error", "InvalidPush", "wrong group"])
        );

        let poke = Downstream::PokeStart(PokeStart {
            poke_id: "0a".into(),
            base_cookie: None,
            cookie: "0a".into(),
        })
        .encode();
        assert_eq!(poke[0], "pokeStart");
        assert_eq!(poke[1]["cookie"], "0a");
        assert_eq!(poke[1]["baseCookie"], Value::Null);
    }

    #[test]
    fn poke_part_omits_empty_sections() {
        let part = Downstream::PokePart(PokePart {
            poke_id: "0a".into(),
            ..Default::default()
        })
        .encode();
        assert_eq!(part[1].as_object().unwrap().len(), 1);
    }
}
