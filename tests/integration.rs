//! End-to-end tests over the in-process loopback transport.
//!
//! Each test plays the server side of the connection by hand: accept the
//! dial, ack the `hello`, then script whatever the scenario needs. Acks
//! keep the session in text mode except where binary is the point.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use storelink::transport::memory::ServerEnd;
use storelink::transport::{MemoryHub, SocketFactory};
use storelink::{ConnectEvent, LinkBuilder, LinkConfig, LinkError};

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

fn test_config() -> LinkConfig {
    LinkConfig {
        dial_timeout: Duration::from_secs(5),
        // Keepalive disabled unless a test opts in.
        ping_interval: Duration::from_secs(3600),
        hang_timeout: Duration::from_secs(3600),
        activity_debounce: Duration::from_millis(10),
    }
}

fn builder(hub: &Arc<MemoryHub>) -> LinkBuilder {
    init_logging();
    LinkBuilder::new("ws://store.test/ws", |_| {})
        .factory(hub.clone() as Arc<dyn SocketFactory>)
        .config(test_config())
}

async fn accept(hub: &MemoryHub) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(10), hub.accept())
        .await
        .expect("no dial within 10s")
        .expect("hub closed")
}

async fn recv_frame(server: &mut ServerEnd) -> Bytes {
    tokio::time::timeout(Duration::from_secs(5), server.recv())
        .await
        .expect("no frame within 5s")
        .expect("socket closed")
}

async fn recv_json(server: &mut ServerEnd) -> Value {
    let frame = recv_frame(server).await;
    serde_json::from_slice(&frame).expect("json frame")
}

async fn expect_no_frame(server: &mut ServerEnd, window: Duration) {
    if let Ok(Some(frame)) = tokio::time::timeout(window, server.recv()).await {
        let value: Value = serde_json::from_slice(&frame).expect("json frame");
        panic!("unexpected frame: {value}");
    }
}

/// Consume the client's `hello` and ack it in text mode.
async fn handshake(server: &mut ServerEnd, reconnect: bool) {
    let hello = recv_json(server).await;
    assert_eq!(hello["method"], "hello");
    assert_eq!(hello["id"], -1);
    assert_eq!(hello["broadcast"], true);
    server.send_json(&json!({
        "id": -1,
        "result": { "binary": false, "reconnect": reconnect },
    }));
}

fn session_id_of(server: &ServerEnd) -> String {
    server
        .url
        .split("sessionId=")
        .nth(1)
        .expect("sessionId param")
        .to_string()
}

#[tokio::test]
async fn test_call_resolves_with_result() {
    let hub = MemoryHub::new();
    let link = builder(&hub).connect();
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let server_task = tokio::spawn(async move {
        let req = recv_json(&mut server).await;
        assert_eq!(req["method"], "getAccount");
        server.send_json(&json!({
            "id": req["id"],
            "result": { "email": "dev@store.test" },
        }));
        server
    });

    let account = link.get_account().await.unwrap();
    assert_eq!(account["email"], "dev@store.test");
    assert_eq!(link.pending_count(), 0);

    server_task.await.unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() {
    let hub = MemoryHub::new();
    let link = builder(&hub).connect();
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let server_task = tokio::spawn(async move {
        // Collect all three requests, then reply in reverse order.
        let mut reqs = Vec::new();
        for _ in 0..3 {
            reqs.push(recv_json(&mut server).await);
        }
        for req in reqs.iter().rev() {
            assert_eq!(req["method"], "findAll");
            server.send_json(&json!({
                "id": req["id"],
                "result": [{ "class": req["params"][0] }],
            }));
        }
    });

    let (a, b, c) = tokio::join!(
        link.find_all("core:class:A", json!({}), json!({})),
        link.find_all("core:class:B", json!({}), json!({})),
        link.find_all("core:class:C", json!({}), json!({})),
    );

    assert_eq!(a.unwrap()[0]["class"], "core:class:A");
    assert_eq!(b.unwrap()[0]["class"], "core:class:B");
    assert_eq!(c.unwrap()[0]["class"], "core:class:C");

    server_task.await.unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_chunked_result_reassembled_in_index_order() {
    let hub = MemoryHub::new();
    let link = builder(&hub).connect();
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let server_task = tokio::spawn(async move {
        let req = recv_json(&mut server).await;
        let id = req["id"].clone();
        // Slices delivered out of order; "final" marks the last delivered.
        server.send_json(&json!({
            "id": id, "result": ["c"],
            "chunk": { "index": 2, "total": 3, "final": false },
        }));
        server.send_json(&json!({
            "id": id, "result": ["a"],
            "chunk": { "index": 0, "total": 3, "final": false },
        }));
        server.send_json(&json!({
            "id": id, "result": ["b"],
            "chunk": { "index": 1, "total": 3, "final": true },
        }));
    });

    let docs = link
        .find_all("core:class:Doc", json!({}), json!({}))
        .await
        .unwrap();
    assert_eq!(docs, vec![json!("a"), json!("b"), json!("c")]);

    server_task.await.unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_call_issued_before_handshake_waits_for_open() {
    let hub = MemoryHub::new();
    let link = Arc::new(builder(&hub).connect());
    let mut server = accept(&hub).await;

    // Handshake not acked yet; the call must queue, not fail.
    let pending = {
        let link = link.clone();
        tokio::spawn(async move { link.get_account().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.pending_count(), 1);

    handshake(&mut server, false).await;
    let req = recv_json(&mut server).await;
    assert_eq!(req["method"], "getAccount");
    server.send_json(&json!({ "id": req["id"], "result": {} }));

    pending.await.unwrap().unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_reconnect_replays_sent_call_exactly_once() {
    let hub = MemoryHub::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
    let link = Arc::new(
        builder(&hub)
            .on_connect(move |event| {
                let _ = events_tx.send(event);
            })
            .on_activity(move |n| {
                let _ = activity_tx.send(n);
            })
            .connect(),
    );

    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;
    assert_eq!(events_rx.recv().await, Some(ConnectEvent::Connected));

    let pending = {
        let link = link.clone();
        tokio::spawn(async move { link.get_account().await })
    };

    // The call reaches the wire, then the socket dies unanswered.
    let first = recv_json(&mut server).await;
    assert_eq!(first["method"], "getAccount");
    server.close();

    // Socket-level failure surfaces as a -1 activity signal.
    loop {
        match activity_rx.recv().await {
            Some(-1) => break,
            Some(_) => continue,
            None => panic!("activity channel closed"),
        }
    }

    let mut server = accept(&hub).await;
    handshake(&mut server, true).await;
    assert_eq!(events_rx.recv().await, Some(ConnectEvent::Reconnected));

    // Replayed with the original correlation id, exactly once.
    let replayed = recv_json(&mut server).await;
    assert_eq!(replayed["method"], "getAccount");
    assert_eq!(replayed["id"], first["id"]);
    expect_no_frame(&mut server, Duration::from_millis(150)).await;

    server.send_json(&json!({ "id": replayed["id"], "result": { "ok": true } }));
    assert_eq!(pending.await.unwrap().unwrap()["ok"], true);

    link.close().await;
}

#[tokio::test]
async fn test_tx_replay_probe_resends_when_not_applied() {
    let hub = MemoryHub::new();
    let link = Arc::new(builder(&hub).connect());
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let pending = {
        let link = link.clone();
        tokio::spawn(async move {
            link.tx(json!({ "_class": "core:class:TxCreateDoc", "_id": "tx-1" }))
                .await
        })
    };

    let tx_req = recv_json(&mut server).await;
    assert_eq!(tx_req["method"], "tx");
    server.close();

    let mut server = accept(&hub).await;
    handshake(&mut server, true).await;

    // The reconnect probes whether the write landed before resending.
    let probe = recv_json(&mut server).await;
    assert_eq!(probe["method"], "findAll");
    assert_eq!(probe["params"][0], "core:class:Tx");
    assert_eq!(probe["params"][1]["_id"], "tx-1");
    assert_eq!(probe["params"][2]["limit"], 1);
    server.send_json(&json!({ "id": probe["id"], "result": [] }));

    let resent = recv_json(&mut server).await;
    assert_eq!(resent["method"], "tx");
    assert_eq!(resent["id"], tx_req["id"]);
    server.send_json(&json!({ "id": resent["id"], "result": {} }));

    pending.await.unwrap().unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_tx_replay_probe_skips_resend_when_applied() {
    let hub = MemoryHub::new();
    let link = Arc::new(builder(&hub).connect());
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let pending = {
        let link = link.clone();
        tokio::spawn(async move {
            link.tx(json!({ "_class": "core:class:TxCreateDoc", "_id": "tx-9" }))
                .await
        })
    };

    let tx_req = recv_json(&mut server).await;
    server.close();

    let mut server = accept(&hub).await;
    handshake(&mut server, true).await;

    // The probe finds the journal entry: the write landed, never resend.
    let probe = recv_json(&mut server).await;
    assert_eq!(probe["method"], "findAll");
    server.send_json(&json!({ "id": probe["id"], "result": [{ "_id": "tx-9" }] }));
    expect_no_frame(&mut server, Duration::from_millis(150)).await;

    // The call is still correlated; the server's late answer resolves it.
    assert_eq!(link.pending_count(), 1);
    server.send_json(&json!({ "id": tx_req["id"], "result": { "applied": true } }));
    assert_eq!(pending.await.unwrap().unwrap()["applied"], true);

    link.close().await;
}

#[tokio::test]
async fn test_backoff_recovers_after_refused_dials() {
    let hub = MemoryHub::new();
    hub.set_refusing(true);

    let link = Arc::new(builder(&hub).connect());
    let pending = {
        let link = link.clone();
        tokio::spawn(async move { link.get_account().await })
    };

    // Let at least one dial fail before the endpoint comes back.
    tokio::time::sleep(Duration::from_millis(150)).await;
    hub.set_refusing(false);

    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;
    let req = recv_json(&mut server).await;
    assert_eq!(req["method"], "getAccount");
    server.send_json(&json!({ "id": req["id"], "result": {} }));

    pending.await.unwrap().unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_close_rejects_pending_and_new_calls() {
    let hub = MemoryHub::new();
    let link = Arc::new(builder(&hub).connect());
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let pending = {
        let link = link.clone();
        tokio::spawn(async move { link.get_account().await })
    };
    let req = recv_json(&mut server).await;
    assert_eq!(req["method"], "getAccount");

    link.close().await;

    assert!(matches!(
        pending.await.unwrap().unwrap_err(),
        LinkError::ConnectionClosed
    ));
    assert!(matches!(
        link.get_account().await.unwrap_err(),
        LinkError::ConnectionClosed
    ));
    assert_eq!(link.pending_count(), 0);

    // Closed means closed: no redial.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), hub.accept())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_hang_detection_forces_reconnect_and_pending_survives() {
    let hub = MemoryHub::new();
    let config = LinkConfig {
        ping_interval: Duration::from_millis(50),
        hang_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let link = Arc::new(builder(&hub).config(config).connect());

    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let pending = {
        let link = link.clone();
        tokio::spawn(async move { link.get_account().await })
    };
    let req = recv_json(&mut server).await;
    assert_eq!(req["method"], "getAccount");

    // Ignore every keepalive ping; the watermark goes stale and the
    // supervisor force-closes the socket.
    let mut server = accept(&hub).await;
    handshake(&mut server, true).await;

    // The original call is replayed on the fresh socket; pings are too,
    // so scan for it.
    loop {
        let frame = recv_json(&mut server).await;
        if frame["method"] == "getAccount" {
            assert_eq!(frame["id"], req["id"]);
            server.send_json(&json!({ "id": frame["id"], "result": {} }));
            break;
        }
        assert_eq!(frame["method"], "ping");
        server.send_json(&json!({ "id": frame["id"], "result": {} }));
    }

    pending.await.unwrap().unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_already_connected_regenerates_session_id() {
    let hub = MemoryHub::new();
    let link = builder(&hub).connect();

    let mut server = accept(&hub).await;
    let first_session = session_id_of(&server);
    let hello = recv_json(&mut server).await;
    assert_eq!(hello["method"], "hello");
    server.send_json(&json!({ "id": -1, "result": { "alreadyConnected": true } }));

    // The client mints a fresh session id and dials again.
    let mut server = accept(&hub).await;
    let second_session = session_id_of(&server);
    assert_ne!(first_session, second_session);
    handshake(&mut server, false).await;

    let server_task = tokio::spawn(async move {
        let req = recv_json(&mut server).await;
        server.send_json(&json!({ "id": req["id"], "result": {} }));
    });
    link.get_account().await.unwrap();

    server_task.await.unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_unauthorized_is_terminal() {
    let hub = MemoryHub::new();
    let (unauthorized_tx, mut unauthorized_rx) = mpsc::unbounded_channel();
    let link = builder(&hub)
        .on_unauthorized(move || {
            let _ = unauthorized_tx.send(());
        })
        .connect();

    let mut server = accept(&hub).await;
    let hello = recv_json(&mut server).await;
    assert_eq!(hello["method"], "hello");
    server.send_json(&json!({ "id": -1, "error": { "code": "UNAUTHORIZED" } }));

    unauthorized_rx.recv().await.expect("unauthorized callback");

    assert!(matches!(
        link.get_account().await.unwrap_err(),
        LinkError::ConnectionClosed
    ));
    // No retry, ever.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), hub.accept())
            .await
            .is_err()
    );

    link.close().await;
}

#[tokio::test]
async fn test_upgrade_broadcast_acks_and_notifies() {
    let hub = MemoryHub::new();
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let (upgrade_tx, mut upgrade_rx) = mpsc::unbounded_channel();
    let link = LinkBuilder::new("ws://store.test/ws", move |txes| {
        let _ = batch_tx.send(txes);
    })
    .factory(hub.clone() as Arc<dyn SocketFactory>)
    .config(test_config())
    .on_upgrade(move || {
        let _ = upgrade_tx.send(());
    })
    .connect();

    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    server.send_json(&json!({
        "result": [{ "_class": "core:class:TxWorkspaceEvent", "event": 1 }],
    }));

    // The client acks with a fire-and-forget #upgrading control frame.
    let ack = recv_json(&mut server).await;
    assert_eq!(ack["method"], "#upgrading");
    assert_eq!(ack["id"], -1);
    upgrade_rx.recv().await.expect("upgrade callback");

    // The upgrade notice never reaches the transaction handler.
    assert!(batch_rx.try_recv().is_err());

    link.close().await;
}

#[tokio::test]
async fn test_broadcast_batches_delivered_in_order() {
    let hub = MemoryHub::new();
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let link = LinkBuilder::new("ws://store.test/ws", move |txes| {
        let _ = batch_tx.send(txes);
    })
    .factory(hub.clone() as Arc<dyn SocketFactory>)
    .config(test_config())
    .connect();

    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    server.send_json(&json!({ "result": [{ "n": 1 }, { "n": 2 }] }));
    // A bare transaction object arrives as a batch of one.
    server.send_json(&json!({ "result": { "n": 3 } }));

    let first = batch_rx.recv().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0]["n"], 1);
    assert_eq!(first[1]["n"], 2);

    let second = batch_rx.recv().await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0]["n"], 3);

    link.close().await;
}

#[tokio::test]
async fn test_server_ping_prompt_is_answered() {
    let hub = MemoryHub::new();
    let link = builder(&hub).connect();
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    server.send(Bytes::from(
        serde_json::to_vec(&json!({ "result": "ping" })).unwrap(),
    ));

    let answer = recv_json(&mut server).await;
    assert_eq!(answer["method"], "ping");
    assert!(answer["id"].as_i64().unwrap() >= 0);
    server.send_json(&json!({ "id": answer["id"], "result": {} }));

    link.close().await;
}

#[tokio::test]
async fn test_derived_txes_redelivered_through_handler() {
    let hub = MemoryHub::new();
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let link = LinkBuilder::new("ws://store.test/ws", move |txes| {
        let _ = batch_tx.send(txes);
    })
    .factory(hub.clone() as Arc<dyn SocketFactory>)
    .config(test_config())
    .connect();

    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let server_task = tokio::spawn(async move {
        let req = recv_json(&mut server).await;
        assert_eq!(req["method"], "tx");
        server.send_json(&json!({
            "id": req["id"],
            "result": { "derivedTx": [{ "_class": "core:class:TxUpdateDoc" }] },
        }));
        server
    });

    let result = link
        .tx(json!({ "_class": "core:class:TxCreateDoc", "_id": "tx-5" }))
        .await
        .unwrap();
    assert_eq!(result["derivedTx"][0]["_class"], "core:class:TxUpdateDoc");

    let derived = batch_rx.recv().await.unwrap();
    assert_eq!(derived[0]["_class"], "core:class:TxUpdateDoc");

    server_task.await.unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_chunked_tx_result_redelivers_derived_txes() {
    let hub = MemoryHub::new();
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let link = LinkBuilder::new("ws://store.test/ws", move |txes| {
        let _ = batch_tx.send(txes);
    })
    .factory(hub.clone() as Arc<dyn SocketFactory>)
    .config(test_config())
    .connect();

    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let server_task = tokio::spawn(async move {
        let req = recv_json(&mut server).await;
        assert_eq!(req["method"], "tx");
        // The whole result rides a single final chunk.
        server.send_json(&json!({
            "id": req["id"],
            "result": { "derivedTx": [{ "_class": "core:class:TxUpdateDoc" }] },
            "chunk": { "index": 0, "total": 1, "final": true },
        }));
    });

    let result = link
        .tx(json!({ "_class": "core:class:TxCreateDoc", "_id": "tx-7" }))
        .await
        .unwrap();
    assert_eq!(result["derivedTx"][0]["_class"], "core:class:TxUpdateDoc");

    let derived = batch_rx.recv().await.unwrap();
    assert_eq!(derived[0]["_class"], "core:class:TxUpdateDoc");

    server_task.await.unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_binary_ack_switches_session_to_msgpack() {
    let hub = MemoryHub::new();
    let link = builder(&hub).connect();
    let mut server = accept(&hub).await;

    // The hello exchange itself stays in text mode.
    let hello = recv_json(&mut server).await;
    assert_eq!(hello["method"], "hello");
    assert_eq!(hello["binary"], true);
    server.send_json(&json!({ "id": -1, "result": { "binary": true } }));

    let server_task = tokio::spawn(async move {
        let frame = recv_frame(&mut server).await;
        let req: Value = rmp_serde::from_slice(&frame).expect("msgpack request");
        assert_eq!(req["method"], "getAccount");
        let reply = rmp_serde::to_vec_named(&json!({
            "id": req["id"],
            "result": { "email": "dev@store.test" },
        }))
        .unwrap();
        server.send(Bytes::from(reply));
    });

    let account = link.get_account().await.unwrap();
    assert_eq!(account["email"], "dev@store.test");

    server_task.await.unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_broadcast_before_hello_ack_is_delivered() {
    let hub = MemoryHub::new();
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let link = LinkBuilder::new("ws://store.test/ws", move |txes| {
        let _ = batch_tx.send(txes);
    })
    .factory(hub.clone() as Arc<dyn SocketFactory>)
    .config(test_config())
    .connect();

    let mut server = accept(&hub).await;
    let hello = recv_json(&mut server).await;
    assert_eq!(hello["method"], "hello");

    // Broadcast lands between the hello and its ack.
    server.send_json(&json!({ "result": [{ "n": 1 }] }));
    server.send_json(&json!({ "id": -1, "result": { "binary": false } }));

    let batch = tokio::time::timeout(Duration::from_secs(5), batch_rx.recv())
        .await
        .expect("early broadcast delivered")
        .unwrap();
    assert_eq!(batch[0]["n"], 1);

    link.close().await;
}

#[tokio::test]
async fn test_call_during_socket_teardown_resolves_after_reconnect() {
    let hub = MemoryHub::new();
    let link = Arc::new(builder(&hub).connect());
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    // Tear down both halves of the server end at once and race a call
    // against the teardown.
    drop(server);
    let pending = {
        let link = link.clone();
        tokio::spawn(async move { link.get_account().await })
    };

    let mut server = accept(&hub).await;
    handshake(&mut server, true).await;

    // Whether the call went through replay or its own deferred write, it
    // reaches the fresh socket exactly once.
    let req = recv_json(&mut server).await;
    assert_eq!(req["method"], "getAccount");
    expect_no_frame(&mut server, Duration::from_millis(150)).await;
    server.send_json(&json!({ "id": req["id"], "result": {} }));

    pending.await.unwrap().unwrap();
    link.close().await;
}

#[tokio::test]
async fn test_rpc_error_rejects_only_that_call() {
    let hub = MemoryHub::new();
    let link = builder(&hub).connect();
    let mut server = accept(&hub).await;
    handshake(&mut server, false).await;

    let server_task = tokio::spawn(async move {
        for _ in 0..2 {
            let req = recv_json(&mut server).await;
            if req["method"] == "loadChunk" {
                server.send_json(&json!({
                    "id": req["id"],
                    "error": { "code": "NOT_FOUND", "message": "no such domain" },
                }));
            } else {
                assert_eq!(req["method"], "findAll");
                server.send_json(&json!({ "id": req["id"], "result": [] }));
            }
        }
    });

    let (bad, good) = tokio::join!(
        link.load_chunk("missing", None),
        link.find_all("core:class:Doc", json!({}), json!({})),
    );

    match bad.unwrap_err() {
        LinkError::Rpc(err) => assert_eq!(err.code, "NOT_FOUND"),
        other => panic!("expected rpc error, got {other}"),
    }
    assert!(good.unwrap().is_empty());

    server_task.await.unwrap();
    link.close().await;
}
