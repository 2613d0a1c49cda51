//! Message handlers, shared by channels and direct conversations. Routes
//! pick the container kind with a type parameter; everything below the
//! path is identical for both.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use validator::Validate;

use campus_db::messages::{NewMessage, Page};
use campus_gateway::fanout::Mutation;
use campus_types::api::{EditMessageRequest, MessageQuery, ReactionRequest, SendMessageRequest, SendMessageResponse};
use campus_types::{ChannelId, ContainerRef, ConversationId, MessageId};

use crate::error::ApiError;
use crate::middleware::Caller;
use crate::state::{AppState, blocking, ok};

pub trait ContainerKind: Send + Sync + 'static {
    fn container(id: i64) -> ContainerRef;
}

pub struct Channels;
pub struct Conversations;

impl ContainerKind for Channels {
    fn container(id: i64) -> ContainerRef {
        ContainerRef::Channel(ChannelId(id))
    }
}

impl ContainerKind for Conversations {
    fn container(id: i64) -> ContainerRef {
        ContainerRef::Conversation(ConversationId(id))
    }
}

pub async fn list_messages<K: ContainerKind>(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<i64>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let container = K::container(id);
    let (tenant, viewer) = (caller.tenant(), caller.user_id());
    let page = Page {
        limit: query.limit,
        before_id: query.before_id,
        after_id: query.after_id,
    };
    let messages = blocking(&state, move |db| db.list_messages(tenant, container, viewer, page)).await?;
    Ok(ok("Messages retrieved.", messages))
}

pub async fn send_message<K: ContainerKind>(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let container = K::container(id);
    let (tenant, author) = (caller.tenant(), caller.user_id());
    let new = NewMessage {
        content: req.content,
        message_type: req.message_type.unwrap_or_default(),
        parent_id: req.parent_id,
        attachments: req.attachments,
    };

    let sent = blocking(&state, move |db| db.send_message(tenant, container, author, &new)).await?;
    state.gateway.publish(tenant, Mutation::MessageSent(sent.message.clone())).await;

    Ok((
        StatusCode::CREATED,
        ok(
            "Message sent.",
            SendMessageResponse {
                message: sent.message,
                attachment_failures: sent.attachment_failures,
            },
        ),
    ))
}

pub async fn edit_message<K: ContainerKind>(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, message_id)): Path<(i64, MessageId)>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let container = K::container(id);
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let message = blocking(&state, move |db| {
        db.edit_message(tenant, container, actor, message_id, &req.content)
    })
    .await?;
    state.gateway.publish(tenant, Mutation::MessageEdited(message.clone())).await;
    Ok(ok("Message updated.", message))
}

pub async fn delete_message<K: ContainerKind>(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, message_id)): Path<(i64, MessageId)>,
) -> Result<impl IntoResponse, ApiError> {
    let container = K::container(id);
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let deleted = blocking(&state, move |db| db.delete_message(tenant, container, actor, message_id)).await?;
    state.gateway.publish(tenant, Mutation::MessageDeleted(deleted)).await;
    Ok(ok("Message deleted.", serde_json::json!({ "message_id": message_id })))
}

pub async fn add_reaction<K: ContainerKind>(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, message_id)): Path<(i64, MessageId)>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let container = K::container(id);
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let change = blocking(&state, move |db| {
        db.add_reaction(tenant, container, actor, message_id, &req.emoji)
    })
    .await?;
    let reactions = change.reactions.clone();
    state.gateway.publish(tenant, Mutation::ReactionAdded(change)).await;
    Ok((StatusCode::CREATED, ok("Reaction added.", reactions)))
}

pub async fn remove_reaction<K: ContainerKind>(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, message_id)): Path<(i64, MessageId)>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let container = K::container(id);
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let change = blocking(&state, move |db| {
        db.remove_reaction(tenant, container, actor, message_id, &req.emoji)
    })
    .await?;
    let reactions = change.reactions.clone();
    state.gateway.publish(tenant, Mutation::ReactionRemoved(change)).await;
    Ok(ok("Reaction removed.", reactions))
}

pub async fn toggle_pin<K: ContainerKind>(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, message_id)): Path<(i64, MessageId)>,
) -> Result<impl IntoResponse, ApiError> {
    let container = K::container(id);
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let message = blocking(&state, move |db| db.toggle_pin(tenant, container, actor, message_id)).await?;
    state.gateway.publish(tenant, Mutation::PinToggled(message.clone())).await;
    let verb = if message.is_pinned { "Message pinned." } else { "Message unpinned." };
    Ok(ok(verb, message))
}

pub async fn list_replies<K: ContainerKind>(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, message_id)): Path<(i64, MessageId)>,
) -> Result<impl IntoResponse, ApiError> {
    let container = K::container(id);
    let (tenant, viewer) = (caller.tenant(), caller.user_id());
    let replies = blocking(&state, move |db| db.list_replies(tenant, container, viewer, message_id)).await?;
    Ok(ok("Replies retrieved.", replies))
}
