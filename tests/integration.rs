//! End-to-end scenarios against the in-process mock transport (the six
//! scenarios named alongside the invariants this crate is built against).

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{MockEndpoint, ScriptedTransports};
use hub_connection::{
    ConnectionState, DefaultRetryPolicy, HubConnectionBuilder, HubConnectionError, HubConnectionOptions,
    HubMessage, InvocationArg, JsonHandshakeProtocol, JsonHubProtocol, TransportFeatures,
};
use serde_json::json;

fn builder() -> HubConnectionBuilder {
    HubConnectionBuilder::new(Arc::new(JsonHubProtocol), Arc::new(JsonHandshakeProtocol))
}

/// Scenario 2: server close with reconnect.
#[tokio::test]
async fn server_close_with_allow_reconnect_triggers_successful_reconnect() {
    let (t1, e1) = MockEndpoint::pair(TransportFeatures::default(), Some("conn-1"));
    let (t2, e2) = MockEndpoint::pair(TransportFeatures::default(), Some("conn-2"));
    let (factory, script) = ScriptedTransports::scripted(vec![(t1, e1), (t2, e2)]);

    let connection = builder()
        .with_retry_policy(Arc::new(DefaultRetryPolicy::with_delays(vec![10])))
        .build("wss://example.invalid/hub", factory);

    let reconnected_id = Arc::new(Mutex::new(None));
    let reconnected_id_cb = Arc::clone(&reconnected_id);
    connection.on_reconnected(move |id| {
        *reconnected_id_cb.lock().unwrap() = id;
    });

    let start = tokio::spawn({
        let connection = connection.clone();
        async move { connection.start().await }
    });
    let first = script.next_endpoint();
    first.send_handshake_ok();
    start.await.unwrap().unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);

    first.send(&HubMessage::Close {
        error: Some("boom".to_owned()),
        allow_reconnect: Some(true),
    });

    // Allow the reconnect loop to observe the close, wait out the 10ms
    // delay, and hand the second scripted transport its handshake.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(connection.state(), ConnectionState::Reconnecting);
    let second = script.next_endpoint();
    second.send_handshake_ok();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(reconnected_id.lock().unwrap().as_deref(), Some("conn-2"));
}

/// Scenario 3: stateful resend replays the buffered window, Sequence-
/// prefixed, before anything new goes out on the fresh transport.
#[tokio::test]
async fn stateful_resend_replays_buffered_window_in_order() {
    let features = TransportFeatures {
        inherent_keep_alive: true,
        reconnect: true,
    };
    let (t1, e1) = MockEndpoint::pair(features, Some("conn-1"));
    let (t2, e2) = MockEndpoint::pair(features, Some("conn-2"));
    let (factory, script) = ScriptedTransports::scripted(vec![(t1, e1), (t2, e2)]);

    let connection = builder()
        .with_retry_policy(Arc::new(DefaultRetryPolicy::with_delays(vec![5])))
        .build("wss://example.invalid/hub", factory);

    let start = tokio::spawn({
        let connection = connection.clone();
        async move { connection.start().await }
    });
    let first = script.next_endpoint();
    first.send_handshake_ok();
    start.await.unwrap().unwrap();

    for i in 0..3u32 {
        let connection = connection.clone();
        let payload = json!(i);
        tokio::spawn(async move {
            let _ = connection.send("Echo", vec![InvocationArg::Value(payload)]).await;
        });
    }
    // Drain the three sends off the first transport so they land in the
    // buffer before it's torn down.
    for _ in 0..3 {
        let _ = first.recv_message().await;
    }

    // Simulate a transport drop by closing the channel end (recv() -> Ok(None)).
    drop(first);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = script.next_endpoint();
    second.send_handshake_ok();

    let HubMessage::Sequence { sequence_id } = second.recv_message().await else {
        panic!("resend must lead with a Sequence frame");
    };
    assert_eq!(sequence_id, 1);
    for expected in 0..3u32 {
        let HubMessage::Invocation { arguments, .. } = second.recv_message().await else {
            panic!("expected replayed Invocation frames");
        };
        assert_eq!(arguments, vec![json!(expected)]);
    }
}

/// Scenario 5: backpressure — send() only completes once an ACK covering
/// that item arrives.
#[tokio::test]
async fn backpressure_blocks_send_until_covering_ack() {
    let features = TransportFeatures {
        inherent_keep_alive: true,
        reconnect: true,
    };
    let (transport, endpoint) = MockEndpoint::pair(features, Some("conn-1"));
    let (factory, script) = ScriptedTransports::scripted(vec![(transport, endpoint)]);

    let options = HubConnectionOptions {
        buffer_size_bytes: 100,
        ..HubConnectionOptions::default()
    };
    let connection = builder().with_options(options).build("wss://example.invalid/hub", factory);

    let start = tokio::spawn({
        let connection = connection.clone();
        async move { connection.start().await }
    });
    let endpoint = script.next_endpoint();
    endpoint.send_handshake_ok();
    start.await.unwrap().unwrap();

    let oversized_arg: String = "x".repeat(150);
    let send = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .send("Echo", vec![InvocationArg::Value(json!(oversized_arg))])
                .await
        }
    });

    let HubMessage::Invocation { .. } = endpoint.recv_message().await else {
        panic!("expected the oversized Invocation on the wire immediately");
    };

    assert!(
        endpoint.try_recv_message(Duration::from_millis(50)).await.is_none(),
        "no further frames expected while send() is pending"
    );
    assert!(
        !send.is_finished(),
        "send() must not resolve before its covering ack arrives"
    );

    endpoint.send(&HubMessage::Ack { sequence_id: 1 });
    send.await.unwrap().unwrap();
}

/// Scenario 6: handshake timeout.
#[tokio::test]
async fn handshake_timeout_rejects_start_and_returns_to_disconnected() {
    let (transport, _endpoint) = MockEndpoint::pair(TransportFeatures::default(), None);
    let (factory, _script) = ScriptedTransports::scripted(vec![(transport, _endpoint)]);

    let options = HubConnectionOptions {
        server_timeout_ms: 20,
        ..HubConnectionOptions::default()
    };
    let connection = builder().with_options(options).build("wss://example.invalid/hub", factory);

    let result = connection.start().await;
    assert!(matches!(result, Err(HubConnectionError::Timeout)));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

/// Invariant: re-registering the same handler instance does not duplicate
/// dispatch, and `off` removes it cleanly.
#[tokio::test]
async fn on_is_idempotent_for_the_same_handler_instance() {
    let (transport, endpoint) = MockEndpoint::pair(TransportFeatures::default(), None);
    let (factory, script) = ScriptedTransports::scripted(vec![(transport, endpoint)]);
    let connection = builder().build("wss://example.invalid/hub", factory);

    let start = tokio::spawn({
        let connection = connection.clone();
        async move { connection.start().await }
    });
    let endpoint = script.next_endpoint();
    endpoint.send_handshake_ok();
    start.await.unwrap().unwrap();

    let call_count = Arc::new(AtomicUsize::new(0));
    let call_count_cb = Arc::clone(&call_count);
    let handler: hub_connection::ClientHandler = Arc::new(move |_args| {
        call_count_cb.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    connection.on("Notify", handler.clone());
    // Registering the identical Arc a second time must not duplicate it.
    connection.on("Notify", handler.clone());
    connection.on("Notify", handler);

    let notify = HubMessage::Invocation {
        invocation_id: None,
        target: "Notify".to_owned(),
        arguments: vec![],
        stream_ids: None,
    };
    endpoint.send(&notify);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(call_count.load(Ordering::SeqCst), 1);

    connection.off("Notify", None);
    endpoint.send(&notify);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(call_count.load(Ordering::SeqCst), 1, "off(.., None) must remove every handler");
}
