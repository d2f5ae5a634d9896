//! Pipeline observer stream: `GET /ws/pipeline/:session_id`.
//!
//! Observers authenticate through the WebSocket subprotocol
//! (`api-key-<key>`), replay the retained ring from their optional
//! `last_seq` cursor, then receive live events in sequence order. A
//! client closing its socket tears down only its own subscriber queue;
//! publishers never notice.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::http::{ApiError, AppState};

const SUBPROTOCOL_PREFIX: &str = "api-key-";

#[derive(Debug, Deserialize)]
pub struct PipelineWsQuery {
    /// Replay resumes after this sequence number.
    pub last_seq: Option<u64>,
}

pub async fn pipeline_ws(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<PipelineWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let raw_key = extract_subprotocol_key(&headers);
    let record = state
        .auth
        .authenticate(raw_key.as_deref())
        .await
        .map_err(|e| state.auth_error(e))?;

    tracing::debug!(
        "pipeline observer attached (session={}, key={})",
        session_id,
        record.id
    );

    let selected = raw_key
        .map(|key| format!("{}{}", SUBPROTOCOL_PREFIX, key))
        .unwrap_or_default();
    let state_for_socket = state.clone();
    Ok(ws
        .protocols([selected])
        .on_upgrade(move |socket| {
            stream_pipeline(state_for_socket, socket, session_id, query.last_seq)
        }))
}

fn extract_subprotocol_key(headers: &HeaderMap) -> Option<String> {
    let protocols = headers.get("sec-websocket-protocol")?.to_str().ok()?;
    protocols
        .split(',')
        .map(str::trim)
        .find_map(|p| p.strip_prefix(SUBPROTOCOL_PREFIX))
        .map(str::to_string)
}

async fn stream_pipeline(
    state: Arc<AppState>,
    mut socket: WebSocket,
    session_id: String,
    last_seq: Option<u64>,
) {
    let mut subscription = state.bus.subscribe(&session_id, last_seq);

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    // Topic closed (session reclaimed); end the stream.
                    break;
                };
                let Ok(frame) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text) {
                            let pong = serde_json::json!({"type": "pong"}).to_string();
                            if socket.send(Message::Text(pong)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    tracing::debug!("pipeline observer detached (session={})", session_id);
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}
