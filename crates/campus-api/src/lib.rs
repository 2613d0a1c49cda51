pub mod admin;
pub mod calls;
pub mod channels;
pub mod direct;
pub mod error;
pub mod files;
pub mod messages;
pub mod middleware;
pub mod presence;
pub mod state;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

use crate::messages::{Channels, Conversations};
use crate::state::AppState;

/// Every HTTP route, nested under `/api`.
pub fn router(state: AppState) -> Router {
    let channel_routes = Router::new()
        .route("/channels", get(channels::list_channels).post(channels::create_channel))
        .route(
            "/channels/{id}",
            get(channels::get_channel)
                .put(channels::update_channel)
                .delete(channels::delete_channel),
        )
        .route("/channels/{id}/members", get(channels::list_members).post(channels::add_member))
        .route("/channels/{id}/members/{user_id}", axum::routing::delete(channels::remove_member))
        .route("/channels/{id}/members/{user_id}/role", put(channels::set_member_role))
        .route("/channels/{id}/leave", post(channels::leave_channel))
        .route("/channels/{id}/read", post(channels::mark_read))
        .route("/channels/{id}/mute", post(channels::mute_channel))
        .route("/channels/{id}/unmute", post(channels::unmute_channel))
        .route(
            "/channels/{id}/messages",
            get(messages::list_messages::<Channels>).post(messages::send_message::<Channels>),
        )
        .route(
            "/channels/{id}/messages/{message_id}",
            put(messages::edit_message::<Channels>).delete(messages::delete_message::<Channels>),
        )
        .route(
            "/channels/{id}/messages/{message_id}/reactions",
            post(messages::add_reaction::<Channels>).delete(messages::remove_reaction::<Channels>),
        )
        .route("/channels/{id}/messages/{message_id}/pin", post(messages::toggle_pin::<Channels>))
        .route("/channels/{id}/messages/{message_id}/replies", get(messages::list_replies::<Channels>));

    let dm_routes = Router::new()
        .route("/dm/conversations", get(direct::list_conversations).post(direct::create_conversation))
        .route("/dm/conversations/{id}", get(direct::get_conversation))
        .route("/dm/conversations/{id}/read", post(direct::mark_read))
        .route(
            "/dm/conversations/{id}/messages",
            get(messages::list_messages::<Conversations>).post(messages::send_message::<Conversations>),
        )
        .route(
            "/dm/conversations/{id}/messages/{message_id}",
            put(messages::edit_message::<Conversations>).delete(messages::delete_message::<Conversations>),
        )
        .route(
            "/dm/conversations/{id}/messages/{message_id}/reactions",
            post(messages::add_reaction::<Conversations>).delete(messages::remove_reaction::<Conversations>),
        )
        .route("/dm/conversations/{id}/messages/{message_id}/pin", post(messages::toggle_pin::<Conversations>))
        .route(
            "/dm/conversations/{id}/messages/{message_id}/replies",
            get(messages::list_replies::<Conversations>),
        );

    let presence_routes = Router::new()
        .route("/presence/status", put(presence::set_status))
        .route("/presence/heartbeat", post(presence::heartbeat))
        .route("/presence/typing/start", post(presence::start_typing))
        .route("/presence/typing/stop", post(presence::stop_typing));

    let misc_routes = Router::new()
        .route(
            "/attachments",
            post(files::upload_attachment).layer(DefaultBodyLimit::max(files::MAX_FILE_SIZE)),
        )
        .route("/calls/turn-credentials", get(calls::get_turn_credentials))
        .route("/admin/channels", get(admin::list_all_channels));

    let api = Router::new()
        .merge(channel_routes)
        .merge(dm_routes)
        .merge(presence_routes)
        .merge(misc_routes)
        .with_state(state);

    Router::new().nest("/api", api)
}
