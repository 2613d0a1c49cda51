use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use campus_types::events::{GatewayCommand, ServerFrame};

use crate::Gateway;
use crate::authorize::authorize;
use crate::dispatcher::Identity;
use crate::identify::authenticate;
use crate::signaling::relay_signal;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Time allowed for the `Identify` command on unauthenticated upgrades.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a connection whose token was already checked at the HTTP upgrade.
pub async fn handle_connection_authenticated(socket: WebSocket, gateway: Gateway, identity: Identity) {
    let (mut sender, receiver) = socket.split();
    info!(
        "{} ({}) connected to gateway in tenant {}",
        identity.user.name,
        identity.user_id(),
        identity.tenant_id
    );

    if send_frame(&mut sender, &ready(&identity)).await.is_err() {
        return;
    }
    run_connection_loop(sender, receiver, gateway, identity).await;
}

/// Handle a connection that must identify itself with its first command.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let Some(identity) = wait_for_identify(&mut receiver, &gateway, &jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };
    info!(
        "{} ({}) identified on gateway in tenant {}",
        identity.user.name,
        identity.user_id(),
        identity.tenant_id
    );

    if send_frame(&mut sender, &ready(&identity)).await.is_err() {
        return;
    }
    run_connection_loop(sender, receiver, gateway, identity).await;
}

fn ready(identity: &Identity) -> ServerFrame {
    ServerFrame::Ready {
        user_id: identity.user_id(),
        name: identity.user.name.clone(),
        tenant_id: identity.tenant_id,
    }
}

async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|e| warn!("Frame serialization failed: {}", e))?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    identity: Identity,
) {
    let (conn_id, mut frames) = gateway.dispatcher.register(identity.clone()).await;
    gateway.user_connected(&identity).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued frames -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Commands are handled one at a time, which keeps per-sender order.
    let recv_gateway = gateway.clone();
    let recv_identity = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_gateway, conn_id, &recv_identity, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_identity.user.name,
                            recv_identity.user_id(),
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.connection_closed(conn_id).await;
    info!("{} ({}) disconnected from gateway", identity.user.name, identity.user_id());
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    gateway: &Gateway,
    jwt_secret: &str,
) -> Option<Identity> {
    let token = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text) {
                    return Some(token);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()?;

    let db = gateway.db.clone();
    let secret = jwt_secret.to_string();
    match tokio::task::spawn_blocking(move || authenticate(&db, &secret, &token, None)).await {
        Ok(Ok(identity)) => Some(identity),
        Ok(Err(e)) => {
            warn!("Gateway identify rejected: {}", e);
            None
        }
        Err(e) => {
            warn!("Gateway identify task failed: {}", e);
            None
        }
    }
}

async fn handle_command(gateway: &Gateway, conn_id: Uuid, identity: &Identity, cmd: GatewayCommand) {
    let tenant = identity.tenant_id;

    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Subscribe { topic } => {
            let frame = match authorize(&gateway.db, identity, topic).await {
                Ok(()) => {
                    gateway.dispatcher.add_subscription(conn_id, topic).await;
                    let members = if topic.is_presence() {
                        Some(gateway.dispatcher.roster(tenant, topic).await)
                    } else {
                        None
                    };
                    debug!("{} ({}) subscribed to {}", identity.user.name, identity.user_id(), topic);
                    ServerFrame::Subscribed { topic, members }
                }
                Err(_) => ServerFrame::SubscriptionRejected { topic },
            };
            gateway.dispatcher.send_to_connection(conn_id, frame).await;
        }

        GatewayCommand::Unsubscribe { topic } => {
            gateway.dispatcher.remove_subscription(conn_id, topic).await;
        }

        GatewayCommand::StartTyping { container } => {
            if let Err(e) = gateway.start_typing(tenant, &identity.user, container).await {
                debug!("{} typing in {} ignored: {}", identity.user_id(), container, e);
            }
        }

        GatewayCommand::StopTyping { container } => {
            gateway.stop_typing(tenant, &identity.user, container).await;
        }

        GatewayCommand::Heartbeat => {
            gateway.heartbeat(tenant, identity.user_id()).await;
        }

        GatewayCommand::SetStatus { status, sent_at } => {
            gateway.set_status(tenant, identity.user_id(), status, sent_at).await;
        }

        GatewayCommand::Signal {
            conversation_id,
            target_user_id,
            signal,
        } => {
            relay_signal(&gateway.dispatcher, conn_id, identity, conversation_id, target_user_id, signal).await;
        }
    }
}
