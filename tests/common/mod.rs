#![allow(dead_code)]

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use meshgate::auth::jwt::generate_token;
use meshgate::config::Config;
use meshgate::db::{Database, NewNode};
use meshgate::models::ADMIN_ROLE_ID;
use meshgate::routes::create_router;
use meshgate::services::dispatcher::RecordingTransport;
use meshgate::AppState;

pub const SECRET: &str = "integration_secret_key_at_least_32_chars!";

pub struct TestApp {
    pub state: Arc<AppState>,
    pub transport: Arc<RecordingTransport>,
    pub admin_token: String,
}

impl TestApp {
    pub async fn new() -> Self {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let state = AppState::new(db, Config::for_tests(SECRET), transport.clone()).unwrap();

        let admin = state
            .db
            .create_user("admin", ADMIN_ROLE_ID, 0, 0, 0)
            .await
            .unwrap();
        let admin_token = generate_token(SECRET, admin.id, "admin", ADMIN_ROLE_ID).unwrap();

        Self {
            state,
            transport,
            admin_token,
        }
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Creates a regular account and returns `(id, token)`.
    pub async fn user(&self, name: &str, flow_gb: i64) -> (i64, String) {
        let user = self.db().create_user(name, 1, flow_gb, 0, 0).await.unwrap();
        let token = generate_token(SECRET, user.id, name, 1).unwrap();
        (user.id, token)
    }

    pub async fn node(&self, name: &str, range: &str) -> i64 {
        self.db()
            .create_node(&NewNode {
                name: name.to_string(),
                secret: format!("{}-secret", name),
                server_ip: "10.0.0.1".to_string(),
                api_port: 8088,
                port_range: range.to_string(),
                tcp_listen_addr: "[::]".to_string(),
                udp_listen_addr: "[::]".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, String) {
        let response = create_router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    pub async fn post(&self, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        let (status, text) = self.send(request).await;
        (status, serde_json::from_str(&text).unwrap_or(Value::Null))
    }

    pub async fn admin_post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let token = self.admin_token.clone();
        self.post(path, Some(&token), body).await
    }

    /// Partner request arriving from `peer`, optionally through a proxy header.
    pub async fn peer_post(
        &self,
        path: &str,
        share_token: &str,
        peer: &str,
        forwarded_for: Option<&str>,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header("Authorization", format!("Bearer {}", share_token));
        if let Some(forwarded) = forwarded_for {
            builder = builder.header("x-forwarded-for", forwarded);
        }
        let mut request = builder.body(Body::from(body.to_string())).unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        let (status, text) = self.send(request).await;
        (status, serde_json::from_str(&text).unwrap_or(Value::Null))
    }
}
