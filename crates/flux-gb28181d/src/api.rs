// HTTP 控制接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flux_gb28181::{SipError, SipServer};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub sip: Arc<SipServer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/invite/:device_id/:channel_id", post(invite))
        .route("/api/v1/catalog/:device_id", post(query_catalog))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:device_id", get(get_device))
        .with_state(state)
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "pong" }))
}

async fn invite(
    State(state): State<AppState>,
    Path((device_id, channel_id)): Path<(String, String)>,
) -> Response {
    match state.sip.invite(&device_id, &channel_id).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            tracing::warn!(
                target: "gb28181d",
                %device_id,
                %channel_id,
                error = %e,
                "invite failed"
            );
            (
                StatusCode::BAD_REQUEST,
                format!("device:{} channel:{} err:{}", device_id, channel_id, e),
            )
                .into_response()
        }
    }
}

async fn query_catalog(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    match state.sip.query_catalog(&device_id).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            format!("device:{} err:{}", device_id, e),
        )
            .into_response(),
    }
}

async fn list_devices(State(state): State<AppState>) -> Response {
    Json(state.sip.list_sessions().await).into_response()
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    match state.sip.session_info(&device_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(SipError::UnknownSession(_)) => (
            StatusCode::NOT_FOUND,
            format!("device:{} not found", device_id),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
