mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::json;

use common::TestApp;

fn agent_post(path: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_flow_test_endpoint_answers_plain_text() {
    let app = TestApp::new().await;
    let request = Request::builder()
        .method("GET")
        .uri("/flow/test")
        .body(Body::empty())
        .unwrap();
    let (status, text) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "test");
}

#[tokio::test]
async fn test_flow_upload_requires_known_secret() {
    let app = TestApp::new().await;
    let (status, _) = app
        .send(agent_post(
            "/flow/upload?secret=nope",
            json!({ "n": "1_1_0", "u": 1, "d": 1 }).to_string(),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_flow_upload_accounts_forward_usage() {
    let app = TestApp::new().await;
    let entry = app.node("entry", "30000-30010").await;
    let (_, body) = app
        .admin_post(
            "/api/v1/tunnel/create",
            json!({ "name": "t", "type": 1, "trafficRatio": 2.0, "inNodeId": [{ "nodeId": entry }] }),
        )
        .await;
    let tunnel_id = body["data"]["id"].as_i64().unwrap();
    let (_, body) = app
        .admin_post(
            "/api/v1/forward/create",
            json!({ "name": "web", "tunnelId": tunnel_id, "remoteAddr": "192.0.2.10:443" }),
        )
        .await;
    let forward_id = body["data"]["id"].as_i64().unwrap();
    let user_id = body["data"]["userId"].as_i64().unwrap();

    let samples = json!([
        { "n": format!("{}_{}_0", forward_id, user_id), "u": 100, "d": 50 },
        { "n": "web_api", "u": 999, "d": 999 },
    ]);
    let (status, text) = app
        .send(agent_post("/flow/upload?secret=entry-secret", samples.to_string()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "ok");

    let forward = app.db().get_forward(forward_id).await.unwrap();
    assert_eq!(forward.in_flow, 100);
    assert_eq!(forward.out_flow, 200);
    let node = app.db().get_node(entry).await.unwrap();
    assert_eq!(node.status, 1);
}

#[tokio::test]
async fn test_config_report_removes_orphans() {
    let app = TestApp::new().await;
    let entry = app.node("entry", "30000-30010").await;

    let live = json!({
        "services": [{ "name": "404_1_0_tcp" }, { "name": "web_api" }],
        "chains": [{ "name": "chains_77" }],
        "limiters": [],
    });
    let (status, text) = app
        .send(agent_post("/flow/config?secret=entry-secret", live.to_string()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "ok");

    let sent = app.transport.sent_to(entry).await;
    let kinds: Vec<_> = sent.iter().map(|c| c.kind.as_str()).collect();
    assert_eq!(kinds, vec!["DeleteService", "DeleteChains"]);
}

#[tokio::test]
async fn test_unreadable_config_report_is_acknowledged() {
    let app = TestApp::new().await;
    let entry = app.node("entry", "30000-30010").await;

    let (status, text) = app
        .send(agent_post("/flow/config?secret=entry-secret", "{not json".to_string()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "ok");
    assert!(app.transport.sent_to(entry).await.is_empty());
}

#[tokio::test]
async fn test_group_membership_grants_and_revokes_per_user() {
    let app = TestApp::new().await;
    let entry = app.node("entry", "30000-30010").await;
    let (_, body) = app
        .admin_post(
            "/api/v1/tunnel/create",
            json!({ "name": "t", "type": 1, "inNodeId": [{ "nodeId": entry }] }),
        )
        .await;
    let tunnel_id = body["data"]["id"].as_i64().unwrap();
    let (alice, _) = app.user("alice", 10).await;
    let (bob, _) = app.user("bob", 10).await;

    let (_, body) = app
        .admin_post("/api/v1/group/user/create", json!({ "name": "staff" }))
        .await;
    let user_group = body["data"]["id"].as_i64().unwrap();
    let (_, body) = app
        .admin_post("/api/v1/group/tunnel/create", json!({ "name": "edge" }))
        .await;
    let tunnel_group = body["data"]["id"].as_i64().unwrap();

    let (status, _) = app
        .admin_post(
            "/api/v1/group/tunnel/assign",
            json!({ "groupId": tunnel_group, "tunnelIds": [tunnel_id] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app
        .admin_post(
            "/api/v1/group/user/assign",
            json!({ "groupId": user_group, "userIds": [alice, bob] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app
        .admin_post(
            "/api/v1/group/permission/assign",
            json!({ "userGroupId": user_group, "tunnelGroupId": tunnel_group }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let permission_id = body["data"]["id"].as_i64().unwrap();

    let alice_grant = app
        .db()
        .find_user_tunnel_by_pair(alice, tunnel_id)
        .await
        .unwrap()
        .unwrap();
    assert!(app.db().find_user_tunnel_by_pair(bob, tunnel_id).await.unwrap().is_some());

    // Dropping bob leaves alice untouched.
    let (status, _) = app
        .admin_post(
            "/api/v1/group/user/assign",
            json!({ "groupId": user_group, "userIds": [alice] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(app.db().find_user_tunnel_by_pair(bob, tunnel_id).await.unwrap().is_none());
    let still = app
        .db()
        .find_user_tunnel_by_pair(alice, tunnel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still.id, alice_grant.id);

    let (status, _) = app
        .admin_post("/api/v1/group/permission/remove", json!({ "id": permission_id }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(app.db().find_user_tunnel_by_pair(alice, tunnel_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reassigning_grant_keeps_its_id() {
    let app = TestApp::new().await;
    let entry = app.node("entry", "30000-30010").await;
    let (_, body) = app
        .admin_post(
            "/api/v1/tunnel/create",
            json!({ "name": "t", "type": 1, "inNodeId": [{ "nodeId": entry }] }),
        )
        .await;
    let tunnel_id = body["data"]["id"].as_i64().unwrap();
    let (dave, _) = app.user("dave", 10).await;

    let (_, first) = app
        .admin_post(
            "/api/v1/user/tunnel/assign",
            json!({ "userId": dave, "tunnelId": tunnel_id, "flow": 5 }),
        )
        .await;
    let (_, second) = app
        .admin_post(
            "/api/v1/user/tunnel/assign",
            json!({ "userId": dave, "tunnelId": tunnel_id, "flow": 8 }),
        )
        .await;
    assert_eq!(first["data"]["id"], second["data"]["id"]);
    assert_eq!(second["data"]["flow"], 8);
    assert_eq!(app.db().list_user_tunnels(dave).await.unwrap().len(), 1);
}
