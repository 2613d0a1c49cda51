use axum::{extract::State, response::IntoResponse};
use tracing::info;

use crate::error::ApiError;
use crate::middleware::Caller;
use crate::state::{AppState, blocking, ok};

/// GET /admin/channels: every channel across tenants, super-admins only.
pub async fn list_all_channels(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<impl IntoResponse, ApiError> {
    let principal = caller.principal;
    let channels = blocking(&state, move |db| {
        let scope = db.bypass_tenant_scope(&principal)?;
        db.list_all_channels(scope)
    })
    .await?;
    info!(user_id = %caller.user_id(), "Cross-tenant channel listing ({} channels)", channels.len());
    Ok(ok("Channels retrieved.", channels))
}
