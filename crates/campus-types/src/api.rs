use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ids::{ContainerRef, MessageId, TenantId, UserId};
use crate::models::{MessageType, PresenceStatus, Role, Visibility};

/// Upper bound on message content, in characters.
pub const MAX_MESSAGE_CHARS: usize = 5000;

// -- JWT Claims --

/// Claims carried by tokens issued by the ERP's session service. This service
/// only verifies them; `tenant_id` is absent for principals whose tenant is
/// derived from a linked parent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub exp: usize,
}

// -- Envelope --

/// Uniform response body: `{success, message, data, errors?}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            errors: None,
        }
    }
}

// -- Channels --

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    pub name: String,
    #[validate(length(max = 500, message = "description must be at most 500 characters"))]
    pub description: Option<String>,
    pub visibility: Visibility,
    #[validate(length(max = 64))]
    pub icon: Option<String>,
    #[validate(length(max = 20))]
    pub color: Option<String>,
    #[serde(default)]
    #[validate(length(max = 500, message = "too many members"))]
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateChannelRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    pub name: Option<String>,
    #[validate(length(max = 500, message = "description must be at most 500 characters"))]
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
    #[validate(length(max = 64))]
    pub icon: Option<String>,
    #[validate(length(max = 20))]
    pub color: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddMemberRequest {
    pub user_id: UserId,
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetRoleRequest {
    pub role: Role,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    /// Defaults to "now" when omitted.
    pub read_at: Option<DateTime<Utc>>,
}

// -- Messages --

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AttachmentInput {
    #[validate(length(min = 1, max = 255))]
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub storage_path: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[validate(length(min = 1, max = 5000, message = "content must be 1-5000 characters"))]
    pub content: String,
    pub message_type: Option<MessageType>,
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    #[validate(length(max = 10, message = "at most 10 attachments per message"))]
    pub attachments: Vec<AttachmentInput>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    #[validate(length(min = 1, max = 5000, message = "content must be 1-5000 characters"))]
    pub content: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ReactionRequest {
    #[validate(length(min = 1, max = 32, message = "emoji must be 1-32 characters"))]
    pub emoji: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    pub before_id: Option<MessageId>,
    pub after_id: Option<MessageId>,
}

fn default_limit() -> u32 {
    50
}

/// Outcome of a send: the message plus any attachment that failed to persist.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: crate::models::Message,
    pub attachment_failures: Vec<AttachmentFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentFailure {
    pub filename: String,
    pub reason: String,
}

// -- Direct messages --

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    #[validate(length(min = 1, max = 50, message = "1-50 participants required"))]
    pub participant_ids: Vec<UserId>,
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
}

// -- Presence --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetStatusRequest {
    pub status: PresenceStatus,
    /// Client-side time of the change; stale updates are discarded.
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypingRequest {
    pub container: ContainerRef,
}

// -- Calls --

#[derive(Debug, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
    pub ttl: u64,
    pub urls: Vec<String>,
}
