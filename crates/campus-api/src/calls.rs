use axum::{extract::State, response::IntoResponse};
use chrono::Utc;

use campus_db::DomainError;
use campus_gateway::signaling::turn_credentials;

use crate::error::ApiError;
use crate::middleware::Caller;
use crate::state::{AppState, ok};

/// GET /calls/turn-credentials. Without a configured TURN secret calls
/// fall back to STUN only, reported as 404.
pub async fn get_turn_credentials(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<impl IntoResponse, ApiError> {
    let Some(secret) = state.turn.secret.as_deref() else {
        return Err(DomainError::NotFound.into());
    };
    let credentials = turn_credentials(secret, caller.user_id(), state.turn.ttl_secs, &state.turn.urls, Utc::now())
        .map_err(DomainError::Internal)?;
    Ok(ok("TURN credentials issued.", credentials))
}
