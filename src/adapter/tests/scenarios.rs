// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end sync scenarios: a scripted change source, a real change
//! streamer over temp-file stores, a view syncer, and a connection over an
//! in-process socket.

use std::sync::Arc;

use serde_json::{json, Value};

use lens_adapter::connection::{Connection, NoopMutationService, Socket};
use lens_adapter::cvr::CvrStore;
use lens_adapter::syncer::ViewSyncer;
use lens_adapter::test_util::{socket_pair, ChannelSocket};
use lens_repr::{LexiVersion, RelationDesc, Row, ScalarType, VERSION_COLUMN};
use lens_storage::changelog::ChangeLog;
use lens_storage::metrics::SourceMetrics;
use lens_storage::replica::Replica;
use lens_storage::source::TestSource;
use lens_storage::streamer::ChangeStreamer;
use lens_storage_types::{Change, TableRef, Transaction};

fn users_desc() -> RelationDesc {
    RelationDesc::new("public", "users")
        .with_column("id", ScalarType::Text, false)
        .with_column("name", ScalarType::Text, true)
        .with_column(VERSION_COLUMN, ScalarType::Text, false)
        .with_key(vec!["id".into()])
}

fn issues_desc() -> RelationDesc {
    RelationDesc::new("public", "issues")
        .with_column("id", ScalarType::Text, false)
        .with_column("title", ScalarType::Text, true)
        .with_column("big", ScalarType::Int8, true)
        .with_column("owner_id", ScalarType::Text, true)
        .with_column(VERSION_COLUMN, ScalarType::Text, false)
        .with_key(vec!["id".into()])
}

fn clients_desc() -> RelationDesc {
    RelationDesc::new("lens", "clients")
        .with_column("clientGroupID", ScalarType::Text, false)
        .with_column("clientID", ScalarType::Text, false)
        .with_column("lastMutationID", ScalarType::Int8, false)
        .with_column(VERSION_COLUMN, ScalarType::Text, false)
        .with_key(vec!["clientGroupID".into(), "clientID".into()])
}

fn row(pairs: &[(&str, Value)]) -> Row {
    let mut row = Row::new();
    for (name, value) in pairs {
        let datum = lens_repr::Datum::from_wire(value).unwrap();
        row.set(*name, datum);
    }
    row
}

struct Harness {
    source: Arc<TestSource>,
    syncer: ViewSyncer,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let replica_path = dir.path().join("replica.db");
        let mut replica = Replica::open(&replica_path).unwrap();
        replica.create_table(&users_desc()).unwrap();
        replica.create_table(&issues_desc()).unwrap();
        replica.create_table(&clients_desc()).unwrap();
        let snapshot = LexiVersion::from_lsn(1);
        replica.set_replica_version(&snapshot).unwrap();

        let users_table = TableRef::new("public", "users");
        for id in ["100", "101", "102"] {
            replica
                .seed_row(
                    &users_table,
                    row(&[("id", json!(id)), ("name", json!(format!("user-{id}")))]),
                    &snapshot,
                )
                .unwrap();
        }
        let issues_table = TableRef::new("public", "issues");
        for id in ["1", "2", "3", "4", "5"] {
            replica
                .seed_row(
                    &issues_table,
                    row(&[
                        ("id", json!(id)),
                        ("title", json!(format!("issue {id}"))),
                        ("big", json!(100)),
                        ("owner_id", json!("100")),
                    ]),
                    &snapshot,
                )
                .unwrap();
        }
        replica
            .seed_row(
                &TableRef::new("lens", "clients"),
                row(&[
                    ("clientGroupID", json!("g1")),
                    ("clientID", json!("foo")),
                    ("lastMutationID", json!(42)),
                ]),
                &snapshot,
            )
            .unwrap();

        let source = Arc::new(TestSource::new(vec![]));
        let changelog = ChangeLog::open(&dir.path().join("changelog.db")).unwrap();
        let streamer = Arc::new(ChangeStreamer::spawn(
            Arc::new(Arc::clone(&source)),
            changelog,
            replica,
            SourceMetrics::unregistered(),
            4096,
        ));
        let read_replica = Replica::open_read_only(&replica_path).unwrap();
        let store = CvrStore::open(&dir.path().join("cvr.db")).unwrap();
        let syncer = ViewSyncer::spawn("g1", streamer, read_replica, store);
        Harness {
            source,
            syncer,
            _dir: dir,
        }
    }

    /// Opens a connection for client `foo` on a fresh socket.
    fn connect(&self, ws_id: &str, base_cookie: Option<String>) -> TestClient {
        let (client, server) = socket_pair();
        let connection = Connection::new(
            server,
            ws_id,
            "g1",
            "foo",
            base_cookie,
            self.syncer.clone(),
            Arc::new(NoopMutationService),
        );
        tokio::spawn(connection.run());
        TestClient {
            socket: client,
            received: 0,
        }
    }
}

struct TestClient {
    socket: ChannelSocket,
    received: u64,
}

impl TestClient {
    async fn send(&mut self, value: Value) {
        self.socket.send(value.to_string()).await.unwrap();
    }

    /// Receives one frame, acknowledging it per the stop-and-wait
    /// protocol.
    async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.socket.recv(),
        )
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed")
        .unwrap();
        self.received += 1;
        let ack = json!({"ack": self.received});
        let _ = self.socket.send(ack.to_string()).await;
        serde_json::from_str(&frame).unwrap()
    }

    /// Receives until `pokeEnd`, returning every `pokePart` body of that
    /// poke plus the `pokeStart` body.
    async fn recv_poke(&mut self) -> (Value, Vec<Value>) {
        let mut start = Value::Null;
        let mut parts = Vec::new();
        loop {
            let frame = self.recv().await;
            match frame[0].as_str().unwrap() {
                "pokeStart" => start = frame[1].clone(),
                "pokePart" => parts.push(frame[1].clone()),
                "pokeEnd" => return (start, parts),
                other => panic!("unexpected frame {other} while awaiting poke"),
            }
        }
    }

    async fn expect_connected(&mut self) {
        let frame = self.recv().await;
        assert_eq!(frame[0], "connected");
        assert!(frame[1]["wsid"].is_string());
    }
}

fn issues_query() -> Value {
    json!({
        "table": "issues",
        "select": ["id", "title", "big"],
        "where": {"type": "simple", "op": "IN", "field": "id", "value": ["1", "2", "3", "4"]},
        "orderBy": [{"field": "id"}],
    })
}

fn users_query() -> Value {
    json!({"table": "users", "select": ["id", "name"]})
}

fn entity_ids(parts: &[Value], op: &str, entity_type: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in parts {
        if let Some(entities) = part["entitiesPatch"].as_array() {
            for e in entities {
                if e["op"] == op && e["entityType"] == entity_type {
                    out.push(e["entityID"]["id"].as_str().unwrap_or_default().to_owned());
                }
            }
        }
    }
    out.sort();
    out
}

fn got_hashes(parts: &[Value], op: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in parts {
        if let Some(got) = part["gotQueriesPatch"].as_array() {
            for g in got {
                if g["op"] == op {
                    out.push(g["hash"].as_str().unwrap().to_owned());
                }
            }
        }
    }
    out.sort();
    out
}

async fn initial_sync(harness: &Harness) -> (TestClient, String) {
    let mut client = harness.connect("ws1", None);
    client.expect_connected().await;
    client
        .send(json!([
            "initConnection",
            {"desiredQueriesPatch": [
                {"op": "put", "hash": "query-hash1", "ast": issues_query()},
            ]},
        ]))
        .await;
    let (start, _parts) = client.recv_poke().await;
    let cookie = start["cookie"].as_str().unwrap().to_owned();
    (client, cookie)
}

// S1: initial sync delivers the queried rows, the got-queries patch, and
// the group's lastMutationIDs.
#[tokio::test]
async fn s1_initial_sync() {
    let harness = Harness::new();
    let mut client = harness.connect("ws1", None);
    client.expect_connected().await;
    client
        .send(json!([
            "initConnection",
            {"desiredQueriesPatch": [
                {"op": "put", "hash": "query-hash1", "ast": issues_query()},
            ]},
        ]))
        .await;
    let (start, parts) = client.recv_poke().await;
    assert!(start["baseCookie"].is_null());
    assert_eq!(start["cookie"], start["pokeID"]);

    let ids = entity_ids(&parts, "put", "public.issues");
    assert_eq!(ids, vec!["1", "2", "3", "4"]);
    // Every entity carries its row version.
    for part in &parts {
        if let Some(entities) = part["entitiesPatch"].as_array() {
            for e in entities {
                assert_eq!(e["value"][VERSION_COLUMN], "01");
            }
        }
    }
    assert_eq!(got_hashes(&parts, "put"), vec!["query-hash1"]);
    let lmids: Vec<_> = parts
        .iter()
        .filter_map(|p| p["lastMutationIDChanges"].as_object())
        .collect();
    assert_eq!(lmids.len(), 1);
    assert_eq!(lmids[0]["foo"], 42);
}

// S2: swapping the desired queries pokes the delta of both the query state
// and the row membership.
#[tokio::test]
async fn s2_change_desired_queries() {
    let harness = Harness::new();
    let (mut client, _cookie) = initial_sync(&harness).await;

    client
        .send(json!([
            "changeDesiredQueries",
            {"desiredQueriesPatch": [
                {"op": "del", "hash": "query-hash1"},
                {"op": "put", "hash": "query-hash2", "ast": users_query()},
            ]},
        ]))
        .await;
    let (_, parts) = client.recv_poke().await;

    let desired = parts
        .iter()
        .find_map(|p| p["desiredQueriesPatches"]["foo"].as_array())
        .expect("desired patch present");
    let ops: Vec<_> = desired.iter().map(|p| p["op"].as_str().unwrap()).collect();
    assert!(ops.contains(&"del") && ops.contains(&"put"));

    assert_eq!(
        entity_ids(&parts, "put", "public.users"),
        vec!["100", "101", "102"]
    );
    assert_eq!(got_hashes(&parts, "del"), vec!["query-hash1"]);
    assert_eq!(got_hashes(&parts, "put"), vec!["query-hash2"]);
}

// S3: an upstream row update produces one poke at the commit watermark
// with a single put patch.
#[tokio::test]
async fn s3_row_update() {
    let harness = Harness::new();
    let (mut client, cookie) = initial_sync(&harness).await;

    harness.source.script(Transaction {
        watermark: LexiVersion::from_lsn(7),
        changes: vec![Change::Update {
            table: TableRef::new("public", "issues"),
            old_key: None,
            row: row(&[("id", json!("1")), ("title", json!("X"))]),
        }],
    });

    let (start, parts) = client.recv_poke().await;
    assert_eq!(start["baseCookie"], cookie.as_str());
    assert_eq!(start["cookie"], "07");

    let mut puts = Vec::new();
    for part in &parts {
        if let Some(entities) = part["entitiesPatch"].as_array() {
            puts.extend(entities.iter().cloned());
        }
    }
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0]["op"], "put");
    assert_eq!(puts[0]["entityID"]["id"], "1");
    assert_eq!(puts[0]["value"]["title"], "X");
    assert_eq!(puts[0]["value"][VERSION_COLUMN], "07");
}

// S4: a key change that moves the row out of the queried set produces a
// del patch, and the row is no longer tracked.
#[tokio::test]
async fn s4_row_leaves_query() {
    let harness = Harness::new();
    let (mut client, _cookie) = initial_sync(&harness).await;

    harness.source.script(Transaction {
        watermark: LexiVersion::from_lsn(7),
        changes: vec![Change::Update {
            table: TableRef::new("public", "issues"),
            old_key: Some(vec![lens_repr::Datum::String("1".into())]),
            row: row(&[("id", json!("99")), ("title", json!("issue 1"))]),
        }],
    });

    let (_, parts) = client.recv_poke().await;
    assert_eq!(entity_ids(&parts, "del", "public.issues"), vec!["1"]);
    assert!(entity_ids(&parts, "put", "public.issues").is_empty());
}

// S5: a disconnect mid-poke leaves the CVR coherent; a reconnect with the
// old cookie receives a full re-poke ending at the current version.
#[tokio::test]
async fn s5_disconnect_mid_stream() {
    let harness = Harness::new();
    let (mut client, cookie) = initial_sync(&harness).await;

    harness.source.script(Transaction {
        watermark: LexiVersion::from_lsn(7),
        changes: vec![Change::Update {
            table: TableRef::new("public", "issues"),
            old_key: None,
            row: row(&[("id", json!("1")), ("title", json!("X"))]),
        }],
    });

    // Read the pokeStart but hang up before pokeEnd.
    let frame = client.recv().await;
    assert_eq!(frame[0], "pokeStart");
    client.socket.close();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Reconnect at the pre-update cookie.
    let mut client = harness.connect("ws2", Some(cookie));
    client.expect_connected().await;
    client
        .send(json!(["initConnection", {"desiredQueriesPatch": []}]))
        .await;
    let (start, parts) = client.recv_poke().await;
    assert_eq!(start["cookie"], "07");
    let ids = entity_ids(&parts, "put", "public.issues");
    assert_eq!(ids, vec!["1", "2", "3", "4"]);
    // The re-poke carries the post-update title.
    for part in &parts {
        if let Some(entities) = part["entitiesPatch"].as_array() {
            for e in entities {
                if e["entityID"]["id"] == "1" {
                    assert_eq!(e["value"]["title"], "X");
                }
            }
        }
    }
}

// S6: a push for the wrong client group closes the connection with a typed
// error.
#[tokio::test]
async fn s6_malformed_push() {
    let harness = Harness::new();
    let (mut client, _cookie) = initial_sync(&harness).await;

    client
        .send(json!(["push", {"clientGroupID": "wrong", "mutations": []}]))
        .await;
    let frame = client.recv().await;
    assert_eq!(frame[0], "error");
    assert_eq!(frame[1], "InvalidPush");
    assert!(frame[2].as_str().unwrap().contains("does not match"));
    // The connection is closed afterwards.
    assert!(client.socket.recv().await.is_none());
}
