use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use campus_db::{DomainError, FieldErrors};
use campus_types::api::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("validation failed")]
    Invalid(#[from] validator::ValidationErrors),

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("upload exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Domain(DomainError::Internal(anyhow::anyhow!("blocking task failed: {}", e)))
    }
}

fn envelope(status: StatusCode, message: &str, errors: Option<serde_json::Value>) -> Response {
    let body: ApiResponse<()> = ApiResponse {
        success: false,
        message: message.to_string(),
        data: None,
        errors,
    };
    (status, Json(body)).into_response()
}

fn field_errors(errors: &validator::ValidationErrors) -> FieldErrors {
    let mut details = FieldErrors::new();
    for (field, field_errors) in errors.field_errors() {
        let messages = field_errors
            .iter()
            .map(|e| match &e.message {
                Some(m) => m.to_string(),
                None => format!("{} is invalid", field),
            })
            .collect();
        details.insert(field.to_string(), messages);
    }
    details
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Invalid(errors) => envelope(
                StatusCode::UNPROCESSABLE_ENTITY,
                "One or more fields are invalid.",
                serde_json::to_value(field_errors(&errors)).ok(),
            ),
            ApiError::Unauthorized => envelope(StatusCode::UNAUTHORIZED, "Authentication required.", None),
            ApiError::BadRequest(message) => envelope(StatusCode::BAD_REQUEST, &message, None),
            ApiError::PayloadTooLarge(limit) => envelope(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("Upload exceeds {} bytes.", limit),
                None,
            ),
            ApiError::Domain(e) => match e {
                DomainError::Validation(fields) => envelope(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "One or more fields are invalid.",
                    serde_json::to_value(fields).ok(),
                ),
                DomainError::Forbidden => envelope(StatusCode::FORBIDDEN, "You do not have access to this resource.", None),
                DomainError::NotFound => envelope(StatusCode::NOT_FOUND, "Resource not found.", None),
                DomainError::DuplicateReaction => {
                    envelope(StatusCode::CONFLICT, "You already reacted with this emoji.", None)
                }
                DomainError::InvariantViolation(reason) => envelope(StatusCode::CONFLICT, &reason, None),
                DomainError::MissingTenantContext => {
                    warn!("Request denied: no tenant context");
                    envelope(StatusCode::FORBIDDEN, "No tenant context for this user.", None)
                }
                ref e @ (DomainError::Database(_) | DomainError::Internal(_)) => {
                    error!("Internal server error: {}", e);
                    envelope(StatusCode::INTERNAL_SERVER_ERROR, "An unexpected error occurred.", None)
                }
            },
        }
    }
}
