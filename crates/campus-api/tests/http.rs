use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

use campus_api::state::{AppStateInner, TurnSettings};
use campus_db::Database;
use campus_db::users::NewUser;
use campus_gateway::Gateway;
use campus_types::api::Claims;
use campus_types::{TenantId, UserId};

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    db: Arc<Database>,
}

fn app() -> TestApp {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let state = Arc::new(AppStateInner {
        gateway: Gateway::new(db.clone()),
        jwt_secret: SECRET.to_string(),
        upload_dir: std::env::temp_dir().join(format!("campus-http-{}", std::process::id())),
        turn: TurnSettings {
            secret: Some("turn-secret".into()),
            urls: vec!["turn:turn.example.com:3478".into()],
            ttl_secs: 600,
        },
    });
    TestApp { router: campus_api::router(state), db }
}

fn user(db: &Database, tenant: Option<TenantId>, name: &str) -> UserId {
    db.create_user(&NewUser {
        tenant_id: tenant,
        name: name.to_string(),
        handle: name.to_lowercase(),
        ..Default::default()
    })
    .unwrap()
}

fn token(user: UserId) -> String {
    let claims = Claims {
        sub: user,
        name: "test".into(),
        tenant_id: None,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn call(app: &TestApp, method: &str, uri: &str, user: Option<UserId>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn create_channel(app: &TestApp, owner: UserId, members: &[UserId]) -> i64 {
    let (status, body) = call(
        app,
        "POST",
        "/api/channels",
        Some(owner),
        Some(json!({ "name": "general", "visibility": "private", "member_ids": members })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["data"]["id"].as_i64().unwrap()
}

#[tokio::test]
async fn requests_without_token_are_rejected() {
    let app = app();
    let (status, body) = call(&app, "GET", "/api/channels", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn members_send_and_read_messages() {
    let app = app();
    let ana = user(&app.db, Some(TenantId(1)), "Ana");
    let bob = user(&app.db, Some(TenantId(1)), "Bob");
    let channel = create_channel(&app, ana, &[bob]).await;

    let uri = format!("/api/channels/{}/messages", channel);
    let (status, body) = call(&app, "POST", &uri, Some(ana), Some(json!({ "content": "hello @bob" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["message"]["content"], "hello @bob");
    assert_eq!(body["data"]["attachment_failures"], json!([]));

    let (status, body) = call(&app, "GET", &uri, Some(bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (_, body) = call(&app, "GET", "/api/channels", Some(bob), None).await;
    assert_eq!(body["data"][0]["unread_count"], 1);

    let read_uri = format!("/api/channels/{}/read", channel);
    let (status, body) = call(&app, "POST", &read_uri, Some(bob), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["unread_count"], 0);
}

#[tokio::test]
async fn non_members_are_forbidden() {
    let app = app();
    let ana = user(&app.db, Some(TenantId(1)), "Ana");
    let eve = user(&app.db, Some(TenantId(1)), "Eve");
    let outsider = user(&app.db, Some(TenantId(2)), "Zed");
    let channel = create_channel(&app, ana, &[]).await;

    let uri = format!("/api/channels/{}/messages", channel);
    let (status, _) = call(&app, "POST", &uri, Some(eve), Some(json!({ "content": "let me in" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&app, "GET", &uri, Some(outsider), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn invalid_bodies_return_field_errors() {
    let app = app();
    let ana = user(&app.db, Some(TenantId(1)), "Ana");
    let channel = create_channel(&app, ana, &[]).await;

    let uri = format!("/api/channels/{}/messages", channel);
    let (status, body) = call(&app, "POST", &uri, Some(ana), Some(json!({ "content": "" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["errors"]["content"].is_array());

    let long = "x".repeat(5001);
    let (status, _) = call(&app, "POST", &uri, Some(ana), Some(json!({ "content": long }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn duplicate_reactions_conflict() {
    let app = app();
    let ana = user(&app.db, Some(TenantId(1)), "Ana");
    let channel = create_channel(&app, ana, &[]).await;

    let uri = format!("/api/channels/{}/messages", channel);
    let (_, body) = call(&app, "POST", &uri, Some(ana), Some(json!({ "content": "vote here" }))).await;
    let message = body["data"]["message"]["id"].as_i64().unwrap();

    let reactions = format!("{}/{}/reactions", uri, message);
    let (status, body) = call(&app, "POST", &reactions, Some(ana), Some(json!({ "emoji": "👍" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"][0]["count"], 1);

    let (status, _) = call(&app, "POST", &reactions, Some(ana), Some(json!({ "emoji": "👍" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, "DELETE", &reactions, Some(ana), Some(json!({ "emoji": "👍" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "DELETE", &reactions, Some(ana), Some(json!({ "emoji": "👍" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_tenant_context_lists_nothing_and_denies_writes() {
    let app = app();
    let orphan = user(&app.db, None, "Orphan");

    let (status, body) = call(&app, "GET", "/api/channels", Some(orphan), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let (status, _) = call(
        &app,
        "POST",
        "/api/channels",
        Some(orphan),
        Some(json!({ "name": "nowhere", "visibility": "public" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn direct_conversations_are_reused() {
    let app = app();
    let ana = user(&app.db, Some(TenantId(1)), "Ana");
    let bob = user(&app.db, Some(TenantId(1)), "Bob");

    let body = json!({ "participant_ids": [bob] });
    let (status, first) = call(&app, "POST", "/api/dm/conversations", Some(ana), Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = call(&app, "POST", "/api/dm/conversations", Some(bob), Some(json!({ "participant_ids": [ana] }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["conversation"]["id"], second["data"]["conversation"]["id"]);
}

#[tokio::test]
async fn last_admin_cannot_leave() {
    let app = app();
    let ana = user(&app.db, Some(TenantId(1)), "Ana");
    let channel = create_channel(&app, ana, &[]).await;

    let (status, _) = call(&app, "POST", &format!("/api/channels/{}/leave", channel), Some(ana), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn tenant_bypass_requires_super_admin() {
    let app = app();
    let ana = user(&app.db, Some(TenantId(1)), "Ana");
    let (status, _) = call(&app, "GET", "/api/admin/channels", Some(ana), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let root = app
        .db
        .create_user(&NewUser {
            tenant_id: Some(TenantId(1)),
            name: "Root".into(),
            handle: "root".into(),
            is_super_admin: true,
            ..Default::default()
        })
        .unwrap();
    create_channel(&app, ana, &[]).await;
    let (status, body) = call(&app, "GET", "/api/admin/channels", Some(root), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn turn_credentials_are_issued() {
    let app = app();
    let ana = user(&app.db, Some(TenantId(1)), "Ana");
    let (status, body) = call(&app, "GET", "/api/calls/turn-credentials", Some(ana), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["username"].as_str().unwrap().ends_with(&format!(":{}", ana)));
    assert_eq!(body["data"]["ttl"], 600);
}
