mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use campus_api::state::{AppStateInner, TurnSettings};
use campus_db::Database;
use campus_gateway::Gateway;
use campus_gateway::connection;
use campus_gateway::identify::authenticate;
use campus_notify::{DeliveryWorker, Providers, WebhookProvider};
use campus_types::models::NotificationChannel;

use crate::config::Config;

/// How often expired typing markers and idle users are swept.
const PRESENCE_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct ServerState {
    gateway: Gateway,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campus=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    // Shared state
    let gateway = Gateway::new(db.clone());
    let _sweeper = gateway.spawn_sweeper(PRESENCE_SWEEP_INTERVAL);

    let providers = providers(&config)?;
    if providers.is_empty() {
        warn!("No notification webhooks configured; offline deliveries will fail");
    }
    let _notifier = DeliveryWorker::new(db, providers).spawn(config.notify_interval);

    let app_state = Arc::new(AppStateInner {
        gateway: gateway.clone(),
        jwt_secret: config.jwt_secret.clone(),
        upload_dir: config.upload_dir.clone(),
        turn: TurnSettings {
            secret: config.turn_secret.clone(),
            urls: config.turn_urls.clone(),
            ttl_secs: config.turn_ttl_secs,
        },
    });

    let state = ServerState {
        gateway,
        jwt_secret: config.jwt_secret.clone(),
    };

    // Routes
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .route("/health", get(health))
        .merge(campus_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Campus server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Campus server stopped");
    Ok(())
}

fn providers(config: &Config) -> anyhow::Result<Providers> {
    let mut providers = Providers::new();
    let webhooks = [
        (NotificationChannel::Email, &config.email_webhook),
        (NotificationChannel::Sms, &config.sms_webhook),
        (NotificationChannel::Whatsapp, &config.whatsapp_webhook),
    ];
    for (channel, url) in webhooks {
        if let Some(url) = url {
            providers = providers.with(channel, Arc::new(WebhookProvider::new(url.clone())?));
            info!("Notification channel {} delivers via webhook", channel);
        }
    }
    Ok(providers)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `/gateway?token=...` authenticates at upgrade time; without a token the
/// client must send `Identify` first.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token else {
        return ws
            .on_upgrade(move |socket| connection::handle_connection(socket, state.gateway, state.jwt_secret))
            .into_response();
    };

    let db = state.gateway.db.clone();
    let secret = state.jwt_secret.clone();
    let identity = match tokio::task::spawn_blocking(move || authenticate(&db, &secret, &token, None)).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => {
            warn!("Gateway upgrade rejected: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(e) => {
            warn!("Gateway upgrade task failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.on_upgrade(move |socket| connection::handle_connection_authenticated(socket, state.gateway, identity))
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
