use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use campus_db::{Database, DomainError};
use campus_gateway::Gateway;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: Gateway,
    pub jwt_secret: String,
    pub upload_dir: PathBuf,
    pub turn: TurnSettings,
}

#[derive(Debug, Clone, Default)]
pub struct TurnSettings {
    /// Shared secret with the TURN server; calls are unavailable without it.
    pub secret: Option<String>,
    pub urls: Vec<String>,
    pub ttl_secs: u64,
}

impl AppStateInner {
    pub fn db(&self) -> &Arc<Database> {
        &self.gateway.db
    }
}

/// Run a store call off the async runtime.
pub async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, DomainError> + Send + 'static,
{
    let db = state.db().clone();
    Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
}

/// `{success: true, message, data}`.
pub fn ok<T: Serialize>(message: &str, data: T) -> axum::Json<campus_types::api::ApiResponse<T>> {
    axum::Json(campus_types::api::ApiResponse::ok(message, data))
}
