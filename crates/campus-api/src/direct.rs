use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use validator::Validate;

use campus_gateway::fanout::Mutation;
use campus_types::api::{CreateConversationRequest, MarkReadRequest};
use campus_types::models::ConversationSnapshot;
use campus_types::{ContainerRef, ConversationId};

use crate::error::ApiError;
use crate::middleware::{Caller, ListCaller};
use crate::state::{AppState, blocking, ok};

pub async fn list_conversations(
    State(state): State<AppState>,
    ListCaller(caller): ListCaller,
) -> Result<impl IntoResponse, ApiError> {
    let Some(caller) = caller else {
        return Ok(ok("Conversations retrieved.", Vec::<ConversationSnapshot>::new()));
    };
    let (tenant, viewer) = (caller.tenant(), caller.user_id());
    let conversations = blocking(&state, move |db| db.list_conversations(tenant, viewer)).await?;
    Ok(ok("Conversations retrieved.", conversations))
}

/// Opens a conversation. A one-to-one thread that already exists is
/// returned with 200 instead of 201 and nothing is published.
pub async fn create_conversation(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let (tenant, creator) = (caller.tenant(), caller.user_id());

    let (opened, snapshot) = blocking(&state, move |db| {
        let opened = db.create_conversation(tenant, creator, &req.participant_ids, req.name.as_deref())?;
        let snapshot = db.conversation_snapshot(tenant, opened.conversation.id, creator)?;
        Ok((opened, snapshot))
    })
    .await?;

    if !opened.created {
        return Ok((StatusCode::OK, ok("Conversation retrieved.", snapshot)));
    }
    state
        .gateway
        .publish(
            tenant,
            Mutation::ConversationCreated {
                conversation: opened.conversation,
                participants: opened.participants,
            },
        )
        .await;
    Ok((StatusCode::CREATED, ok("Conversation created.", snapshot)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ConversationId>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, viewer) = (caller.tenant(), caller.user_id());
    let snapshot = blocking(&state, move |db| {
        // Membership and tenant gate before the snapshot is built.
        db.get_conversation(tenant, viewer, id)?;
        db.conversation_snapshot(tenant, id, viewer)
    })
    .await?;
    Ok(ok("Conversation retrieved.", snapshot))
}

pub async fn mark_read(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ConversationId>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    advance_read(&state, &caller, ContainerRef::Conversation(id), req.read_at).await
}

/// Advance the caller's read cursor and tell their other tabs.
pub(crate) async fn advance_read(
    state: &AppState,
    caller: &Caller,
    container: ContainerRef,
    at: Option<DateTime<Utc>>,
) -> Result<axum::Json<campus_types::api::ApiResponse<serde_json::Value>>, ApiError> {
    let (tenant, user) = (caller.tenant(), caller.user_id());
    let (read_at, unread_count) = blocking(state, move |db| {
        let read_at = db.mark_read(tenant, container, user, at)?;
        Ok((read_at, db.unread_count(tenant, container, user)?))
    })
    .await?;

    state
        .gateway
        .publish(tenant, Mutation::ReadAdvanced { container, user, read_at, unread_count })
        .await;
    Ok(ok("Read position updated.", json!({ "read_at": read_at, "unread_count": unread_count })))
}
