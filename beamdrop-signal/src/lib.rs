use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use beamdrop_core::{Room, SignalingPayload};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::RwLock, time::Duration};
use tracing::{error, info};

pub mod relay;
pub mod store;

pub use store::RoomStore;

use relay::RelayState;

/// How often expired rooms are swept out of the store.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Missing offer in request body")]
    MissingOffer,
    #[error("Missing answer in request body")]
    MissingAnswer,
    #[error("Room not found or expired")]
    RoomNotFound,
    #[error("room store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("no free room code after {0} attempts")]
    CodeGenerationExhausted(u32),
}

impl SignalError {
    fn status(&self) -> StatusCode {
        match self {
            SignalError::MissingOffer | SignalError::MissingAnswer => StatusCode::BAD_REQUEST,
            SignalError::RoomNotFound => StatusCode::NOT_FOUND,
            SignalError::StoreUnavailable(_) | SignalError::CodeGenerationExhausted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        if self.status() == StatusCode::INTERNAL_SERVER_ERROR {
            error!("signaling request failed: {}", self);
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: RoomStore,
    pub(crate) relay: Arc<RwLock<RelayState>>,
    next_party: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: RoomStore::new(),
            relay: Arc::new(RwLock::new(RelayState::default())),
            next_party: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn next_party_id(&self) -> u64 {
        self.next_party.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    #[serde(default)]
    offer: Option<SignalingPayload>,
}

#[derive(Debug, Serialize)]
struct CreateRoomResponse {
    code: String,
}

#[derive(Debug, Deserialize)]
struct AttachAnswerRequest {
    #[serde(default)]
    answer: Option<SignalingPayload>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/rooms", post(create_room_handler))
        .route(
            "/rooms/{code}",
            get(fetch_room_handler).post(attach_answer_handler),
        )
        .route("/ws/{code}", get(relay::ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "signaling server listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );

    let store = state.store.clone();
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            store.sweep().await;
        }
    });

    let result = axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string());
    // The sweeper has no natural end; stop it with the server.
    sweeper.abort();
    result
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn create_room_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, SignalError> {
    let offer = request.offer.ok_or(SignalError::MissingOffer)?;
    let mut rng = StdRng::from_os_rng();
    let code = state.store.create_room(&mut rng, offer).await?;
    info!("created room {}", code);
    Ok((StatusCode::CREATED, Json(CreateRoomResponse { code })))
}

async fn fetch_room_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Room>, SignalError> {
    match state.store.get(&code).await {
        Some(room) => Ok(Json(room)),
        None => Err(SignalError::RoomNotFound),
    }
}

async fn attach_answer_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(request): Json<AttachAnswerRequest>,
) -> Result<Json<serde_json::Value>, SignalError> {
    let answer = request.answer.ok_or(SignalError::MissingAnswer)?;
    state.store.attach_answer(&code, answer).await?;
    info!("answer attached to room {}", code);
    Ok(Json(serde_json::json!({ "success": true })))
}
