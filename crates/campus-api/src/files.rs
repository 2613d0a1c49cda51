use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use image::GenericImageView;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use campus_db::DomainError;
use campus_types::api::AttachmentInput;

use crate::error::ApiError;
use crate::middleware::Caller;
use crate::state::{AppState, ok};

/// 25 MB upload limit for attachments
pub const MAX_FILE_SIZE: usize = 25 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

/// POST /attachments?filename=... — raw bytes in the body. Stored under
/// `{upload_dir}/{tenant}/{sha256}`; the returned attachment is ready to be
/// sent along with a message.
pub async fn upload_attachment(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("Empty upload.".into()));
    }
    if bytes.len() > MAX_FILE_SIZE {
        return Err(ApiError::PayloadTooLarge(MAX_FILE_SIZE));
    }
    let filename = sanitize_filename(&query.filename)
        .ok_or_else(|| DomainError::validation("filename", "filename is required"))?;

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let digest = hex::encode(Sha256::digest(&bytes));
    let dir = state.upload_dir.join(caller.tenant().to_string());
    let storage_path = format!("{}/{}", caller.tenant(), digest);

    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        error!("Failed to create upload directory {}: {}", dir.display(), e);
        DomainError::Internal(e.into())
    })?;

    // Same content, same name: identical uploads share one file.
    let file_path = dir.join(&digest);
    if tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
        debug!("Attachment {} already stored", storage_path);
    } else {
        let mut file = tokio::fs::File::create(&file_path).await.map_err(|e| {
            error!("Failed to create file {}: {}", file_path.display(), e);
            DomainError::Internal(e.into())
        })?;
        file.write_all(&bytes).await.map_err(|e| {
            error!("Failed to write file {}: {}", file_path.display(), e);
            DomainError::Internal(e.into())
        })?;
    }

    let metadata = if mime_type.starts_with("image/") {
        let data = bytes.clone();
        tokio::task::spawn_blocking(move || image_metadata(&data)).await?
    } else {
        None
    };

    info!(
        user_id = %caller.user_id(),
        "Stored attachment {} ({} bytes, {})",
        storage_path,
        bytes.len(),
        mime_type
    );

    let attachment = AttachmentInput {
        filename,
        mime_type,
        size: bytes.len() as i64,
        storage_path,
        metadata,
    };
    Ok((StatusCode::CREATED, ok("Attachment uploaded.", attachment)))
}

/// Keep only the final path component.
fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.chars().take(255).collect())
}

/// `{width, height}` for decodable images; anything else carries no metadata.
fn image_metadata(bytes: &[u8]) -> Option<serde_json::Value> {
    match image::load_from_memory(bytes) {
        Ok(img) => {
            let (width, height) = img.dimensions();
            Some(json!({ "width": width, "height": height }))
        }
        Err(e) => {
            debug!("Upload declared as image but could not be decoded: {}", e);
            None
        }
    }
}
