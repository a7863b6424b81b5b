use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::{ScoringError, ServiceError};
use crate::pipeline::Pipeline;
use crate::types::{ErrorBody, ErrorKind, HealthOut, Reading, ScoreResult, VehicleSnapshot};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

// ---------- Server state ----------

#[derive(Clone)]
pub struct AppState {
    pipeline: Pipeline,
    ws_ping_interval: Duration,
    ws_max_message_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: Pipeline, cfg: &ServiceConfig) -> Self {
        Self {
            pipeline,
            ws_ping_interval: cfg.ws_ping_interval(),
            ws_max_message_bytes: cfg.ws_max_message_bytes,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/telemetry", post(telemetry))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/vehicles/:vehicle_id", get(vehicle))
        .route("/admin/reload", post(reload))
        .with_state(state)
}

// ---------- Single-shot ----------

async fn telemetry(
    State(state): State<AppState>,
    payload: Result<Json<Reading>, JsonRejection>,
) -> Result<Json<ScoreResult>, ServiceError> {
    let Json(reading) = payload.map_err(|e| ServiceError::Validation(e.body_text()))?;
    let out = state.pipeline.process(reading).await?;
    Ok(Json(out))
}

// ---------- Streaming ----------

/// Lifecycle of one streaming connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
struct StreamSession {
    id: u64,
    phase: SessionPhase,
    replies: u64,
    errors: u64,
}

impl StreamSession {
    fn new() -> Self {
        Self {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            phase: SessionPhase::Connecting,
            replies: 0,
            errors: 0,
        }
    }

    fn open(&mut self) {
        if self.phase == SessionPhase::Connecting {
            self.phase = SessionPhase::Open;
        }
    }

    fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let session = StreamSession::new();
    ws.max_message_size(state.ws_max_message_bytes)
        .on_upgrade(move |socket| stream_session(socket, state, session))
}

/// One reply per inbound reading, in arrival order. A reading that fails
/// validation or scoring gets an error frame and the session carries on;
/// only transport failures end it.
async fn stream_session(mut socket: WebSocket, state: AppState, mut session: StreamSession) {
    session.open();
    info!(session = session.id, "stream opened");

    let mut ping = tokio::time::interval(state.ws_ping_interval);
    // first tick fires immediately
    ping.tick().await;

    let failure = loop {
        tokio::select! {
            msg = socket.next() => {
                let parsed = match msg {
                    Some(Ok(Message::Text(text))) => serde_json::from_str::<Reading>(&text),
                    Some(Ok(Message::Binary(bytes))) => serde_json::from_slice::<Reading>(&bytes),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = socket.send(Message::Pong(data)).await {
                            break Some(ServiceError::Connection(e.to_string()));
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Err(e)) => break Some(ServiceError::Connection(e.to_string())),
                };

                // Runs to completion before the next receive, so a disconnect
                // never interrupts a reading halfway.
                let reply = match parsed {
                    Ok(reading) => state.pipeline.process(reading).await,
                    Err(e) => Err(ServiceError::Validation(e.to_string())),
                };
                let frame = match reply {
                    Ok(out) => serde_json::to_string(&out),
                    Err(e) => {
                        session.errors += 1;
                        warn!(session = session.id, error = %e, "reading rejected");
                        serde_json::to_string(&e.body())
                    }
                };
                let frame = frame.unwrap_or_else(|e| {
                    json!({ "error": e.to_string(), "kind": ErrorKind::Validation }).to_string()
                });
                if let Err(e) = socket.send(Message::Text(frame)).await {
                    break Some(ServiceError::Connection(e.to_string()));
                }
                session.replies += 1;
            }
            _ = ping.tick() => {
                if let Err(e) = socket.send(Message::Ping(Vec::new())).await {
                    break Some(ServiceError::Connection(e.to_string()));
                }
            }
        }
    };

    session.close();
    match failure {
        None => info!(
            session = session.id,
            replies = session.replies,
            errors = session.errors,
            "stream closed"
        ),
        Some(e) => warn!(
            session = session.id,
            replies = session.replies,
            error = %e,
            "stream closed on transport error"
        ),
    }
}

// ---------- Utility handlers ----------

async fn health(State(state): State<AppState>) -> Json<HealthOut> {
    Json(HealthOut {
        status: "ok".to_string(),
        model_version: state.pipeline.scorer().current().version().to_string(),
        tracked_vehicles: state.pipeline.store().len(),
    })
}

async fn vehicle(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> Result<Json<VehicleSnapshot>, (StatusCode, Json<ErrorBody>)> {
    match state.pipeline.store().snapshot(&vehicle_id) {
        Some((window, stats)) => Ok(Json(VehicleSnapshot {
            vehicle_id,
            window,
            rolling_mean: stats.mean,
            rolling_std: stats.std,
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("vehicle {vehicle_id} is not tracked"),
                kind: ErrorKind::Validation,
            }),
        )),
    }
}

async fn reload(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ServiceError> {
    let handle = Arc::clone(state.pipeline.scorer());
    let version = tokio::task::spawn_blocking(move || handle.reload())
        .await
        .map_err(|e| ScoringError::Classifier(e.to_string()))??;
    Ok(Json(json!({ "model_version": version })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_phases_only_move_forward() {
        let mut s = StreamSession::new();
        assert_eq!(s.phase, SessionPhase::Connecting);
        s.open();
        assert_eq!(s.phase, SessionPhase::Open);
        s.close();
        assert_eq!(s.phase, SessionPhase::Closed);
        s.open();
        assert_eq!(s.phase, SessionPhase::Closed);
    }

    #[test]
    fn session_ids_are_unique() {
        let a = StreamSession::new();
        let b = StreamSession::new();
        assert_ne!(a.id, b.id);
    }
}
