use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use validator::Validate;

use campus_db::channels::{ChannelUpdate, NewChannel};
use campus_gateway::fanout::Mutation;
use campus_types::api::{AddMemberRequest, CreateChannelRequest, MarkReadRequest, SetRoleRequest, UpdateChannelRequest};
use campus_types::models::{ChannelListing, Role};
use campus_types::{ChannelId, ContainerRef, UserId};

use crate::error::ApiError;
use crate::middleware::{Caller, ListCaller};
use crate::state::{AppState, blocking, ok};

pub async fn list_channels(
    State(state): State<AppState>,
    ListCaller(caller): ListCaller,
) -> Result<impl IntoResponse, ApiError> {
    let Some(caller) = caller else {
        return Ok(ok("Channels retrieved.", Vec::<ChannelListing>::new()));
    };
    let (tenant, user) = (caller.tenant(), caller.user_id());
    let channels = blocking(&state, move |db| db.list_channels(tenant, user)).await?;
    Ok(ok("Channels retrieved.", channels))
}

pub async fn create_channel(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let tenant = caller.tenant();
    let creator = caller.user_id();
    let spec = NewChannel {
        name: req.name,
        description: req.description,
        visibility: req.visibility,
        icon: req.icon,
        color: req.color,
        member_ids: req.member_ids,
    };

    let (channel, members) = blocking(&state, move |db| db.create_channel(tenant, creator, &spec)).await?;
    state
        .gateway
        .publish(tenant, Mutation::ChannelCreated { channel: channel.clone(), members })
        .await;

    Ok((StatusCode::CREATED, ok("Channel created.", channel)))
}

pub async fn get_channel(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, user) = (caller.tenant(), caller.user_id());
    let channel = blocking(&state, move |db| db.get_channel(tenant, user, id)).await?;
    Ok(ok("Channel retrieved.", channel))
}

pub async fn update_channel(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
    Json(req): Json<UpdateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let update = ChannelUpdate {
        name: req.name,
        description: req.description,
        visibility: req.visibility,
        icon: req.icon,
        color: req.color,
        is_active: req.is_active,
    };

    let channel = blocking(&state, move |db| db.update_channel(tenant, actor, id, &update)).await?;
    state.gateway.publish(tenant, Mutation::ChannelUpdated(channel.clone())).await;
    Ok(ok("Channel updated.", channel))
}

pub async fn delete_channel(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let channel = blocking(&state, move |db| db.delete_channel(tenant, actor, id)).await?;
    state.gateway.publish(tenant, Mutation::ChannelDeleted(channel.clone())).await;
    Ok(ok("Channel deleted.", channel))
}

pub async fn list_members(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, viewer) = (caller.tenant(), caller.user_id());
    let members = blocking(&state, move |db| db.channel_members(tenant, viewer, id)).await?;
    Ok(ok("Members retrieved.", members))
}

pub async fn add_member(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
    Json(req): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let role = req.role.unwrap_or(Role::Member);
    let change = blocking(&state, move |db| db.add_member(tenant, actor, id, req.user_id, role)).await?;
    state.gateway.publish(tenant, Mutation::MemberAdded(change.clone())).await;
    Ok((StatusCode::CREATED, ok("Member added.", json!({ "user": change.user, "role": change.role }))))
}

pub async fn remove_member(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, user_id)): Path<(ChannelId, UserId)>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let change = blocking(&state, move |db| db.remove_member(tenant, actor, id, user_id)).await?;
    state.gateway.publish(tenant, Mutation::MemberRemoved(change.clone())).await;
    Ok(ok("Member removed.", json!({ "user": change.user })))
}

pub async fn set_member_role(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, user_id)): Path<(ChannelId, UserId)>,
    Json(req): Json<SetRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, actor) = (caller.tenant(), caller.user_id());
    let change = blocking(&state, move |db| db.set_member_role(tenant, actor, id, user_id, req.role)).await?;
    state.gateway.publish(tenant, Mutation::RoleChanged(change.clone())).await;
    Ok(ok("Role updated.", json!({ "user": change.user, "role": change.role })))
}

pub async fn leave_channel(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, user) = (caller.tenant(), caller.user_id());
    let change = blocking(&state, move |db| db.leave_channel(tenant, user, id)).await?;
    state.gateway.publish(tenant, Mutation::MemberRemoved(change)).await;
    Ok(ok("Left channel.", json!({ "channel_id": id })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    crate::direct::advance_read(&state, &caller, ContainerRef::Channel(id), req.read_at).await
}

pub async fn mute_channel(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, user) = (caller.tenant(), caller.user_id());
    blocking(&state, move |db| db.set_channel_muted(tenant, user, id, true)).await?;
    Ok(ok("Channel muted.", json!({ "channel_id": id, "muted": true })))
}

pub async fn unmute_channel(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ChannelId>,
) -> Result<impl IntoResponse, ApiError> {
    let (tenant, user) = (caller.tenant(), caller.user_id());
    let changed = blocking(&state, move |db| db.set_channel_muted(tenant, user, id, false)).await?;
    if changed {
        state.gateway.publish(tenant, Mutation::ChannelUnmuted { channel_id: id, user }).await;
    }
    Ok(ok("Channel unmuted.", json!({ "channel_id": id, "muted": false })))
}
