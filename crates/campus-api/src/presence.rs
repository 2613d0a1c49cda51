use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use campus_types::api::{SetStatusRequest, TypingRequest};

use crate::error::ApiError;
use crate::middleware::Caller;
use crate::state::{AppState, ok};

pub async fn set_status(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<SetStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .gateway
        .set_status(caller.tenant(), caller.user_id(), req.status, req.sent_at)
        .await;
    Ok(ok("Status updated.", record))
}

pub async fn heartbeat(State(state): State<AppState>, caller: Caller) -> Result<impl IntoResponse, ApiError> {
    let record = state.gateway.heartbeat(caller.tenant(), caller.user_id()).await;
    Ok(ok("Heartbeat recorded.", record))
}

pub async fn start_typing(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<TypingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .gateway
        .start_typing(caller.tenant(), &caller.identity.user, req.container)
        .await?;
    Ok(ok("Typing started.", json!({ "container": req.container })))
}

pub async fn stop_typing(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<TypingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .gateway
        .stop_typing(caller.tenant(), &caller.identity.user, req.container)
        .await;
    Ok(ok("Typing stopped.", json!({ "container": req.container })))
}
