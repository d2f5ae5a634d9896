//! WebSocket pipeline-stream tests against a live listener.
//!
//! The router is served on an ephemeral port and driven with a real
//! tungstenite client, which is the only way to exercise the subprotocol
//! handshake, ring replay, live delivery, and ping frames together.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use third_eye_core::config::ThirdEyeConfig;
use third_eye_core::models::ApiKeyRecord;
use third_eye_core::provider::ProviderClient;
use third_eye_core::response::{event_types, PipelineEvent};
use third_eye_core::Persistence;
use third_eye_server::http::{build_router, AppState};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const CONSUMER_KEY: &str = "te_ws_consumer";

async fn spawn_server() -> (Arc<AppState>, String) {
    let config = ThirdEyeConfig::for_tests();
    let provider = Arc::new(
        ProviderClient::new(&config.provider, Some("sk-test".to_string())).unwrap(),
    );
    let state = AppState::new(config, Persistence::disabled(), provider, "ws-test-secret");
    state
        .auth
        .register_key(ApiKeyRecord {
            id: "key_ws".to_string(),
            hashed_secret: state.auth.hash(CONSUMER_KEY),
            role: "consumer".to_string(),
            tenant: None,
            display_name: None,
            limits: json!({}),
            created_at: chrono::Utc::now(),
            expires_at: None,
            revoked_at: None,
        })
        .await;

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("127.0.0.1:{}", addr.port()))
}

fn progress_event(session_id: &str, n: u64) -> PipelineEvent {
    PipelineEvent::new(
        event_types::ORCHESTRATION_PROGRESS,
        session_id,
        None,
        json!({"stage": format!("stage-{}", n)}),
    )
}

async fn next_json(
    stream: &mut (impl futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("frame error");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn replay_then_live_events_arrive_in_original_order() {
    let (state, addr) = spawn_server().await;
    let session_id = "sess-ws-replay";

    // Three events exist before the observer attaches.
    for n in 1..=3 {
        state.bus.publish(session_id, progress_event(session_id, n));
    }

    let mut request = format!("ws://{}/ws/pipeline/{}", addr, session_id)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        format!("api-key-{}", CONSUMER_KEY).parse().unwrap(),
    );
    let (mut stream, response) = connect_async(request).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);

    // Replay in original order with original sequence numbers.
    for expected_seq in 1..=3u64 {
        let frame = next_json(&mut stream).await;
        assert_eq!(frame["seq"].as_u64().unwrap(), expected_seq);
        assert_eq!(frame["session_id"], session_id);
        assert_eq!(frame["type"], "orchestration_progress");
    }

    // A live publish follows the replay.
    state.bus.publish(session_id, progress_event(session_id, 4));
    let frame = next_json(&mut stream).await;
    assert_eq!(frame["seq"].as_u64().unwrap(), 4);

    // Ping frames are answered.
    stream
        .send(WsMessage::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();
    let frame = next_json(&mut stream).await;
    assert_eq!(frame["type"], "pong");
}

#[tokio::test]
async fn replay_honors_the_last_seq_cursor() {
    let (state, addr) = spawn_server().await;
    let session_id = "sess-ws-cursor";
    for n in 1..=5 {
        state.bus.publish(session_id, progress_event(session_id, n));
    }

    let mut request = format!("ws://{}/ws/pipeline/{}?last_seq=3", addr, session_id)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        format!("api-key-{}", CONSUMER_KEY).parse().unwrap(),
    );
    let (mut stream, _) = connect_async(request).await.unwrap();

    let frame = next_json(&mut stream).await;
    assert_eq!(frame["seq"].as_u64().unwrap(), 4);
    let frame = next_json(&mut stream).await;
    assert_eq!(frame["seq"].as_u64().unwrap(), 5);
}

#[tokio::test]
async fn handshake_without_api_key_subprotocol_is_rejected() {
    let (_state, addr) = spawn_server().await;
    let request = format!("ws://{}/ws/pipeline/sess-anon", addr)
        .into_client_request()
        .unwrap();
    let result = connect_async(request).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected HTTP 401 rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn observer_disconnect_leaves_publishers_unaffected() {
    let (state, addr) = spawn_server().await;
    let session_id = "sess-ws-detach";
    state.bus.publish(session_id, progress_event(session_id, 1));

    let mut request = format!("ws://{}/ws/pipeline/{}", addr, session_id)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        format!("api-key-{}", CONSUMER_KEY).parse().unwrap(),
    );
    let (mut stream, _) = connect_async(request).await.unwrap();
    let _ = next_json(&mut stream).await;
    drop(stream);

    // Publishing after the observer left must not fail or block.
    let stamped = state.bus.publish(session_id, progress_event(session_id, 2));
    assert_eq!(stamped.seq, 2);
}
