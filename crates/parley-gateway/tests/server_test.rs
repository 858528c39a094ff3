#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parley_agent::{LlmBackend, Turn};
use parley_channels::LoopbackTransport;
use parley_core::ParleyResult;
use parley_gateway::{AppState, AuthConfig, GatewayServer, IngressConfig, MessageIngressPipeline};
use parley_session::{ConnectionController, ControllerConfig, ReconnectPolicy, SessionRegistry};
use parley_store::{FileCredentialStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct CannedLlm;

#[async_trait]
impl LlmBackend for CannedLlm {
    async fn complete(&self, _system: &str, _history: &[Turn], _user: &str) -> ParleyResult<String> {
        Ok("ok".into())
    }
}

struct TestServer {
    addr: String,
    transport: LoopbackTransport,
    controller: ConnectionController,
    _tmp: tempfile::TempDir,
}

/// Helper: serve the gateway on a random port.
async fn start_test_server(transport: LoopbackTransport, auth: AuthConfig) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let credentials = Arc::new(
        FileCredentialStore::new(tmp.path().join("sessions"))
            .await
            .unwrap(),
    );
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    let registry = Arc::new(SessionRegistry::new());
    let pipeline = MessageIngressPipeline::new(
        registry.clone(),
        store.clone(),
        Arc::new(CannedLlm),
        IngressConfig::default(),
    );
    let controller = ConnectionController::new(
        registry,
        Arc::new(transport.clone()),
        credentials,
        store,
        Arc::new(pipeline.clone()),
        ControllerConfig {
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(20)),
            event_buffer: 16,
            ..ControllerConfig::default()
        },
    );
    let state = AppState {
        controller: controller.clone(),
        pipeline,
        restore_wait: Duration::from_secs(5),
    };
    let app = GatewayServer::build(state, auth);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        transport,
        controller,
        _tmp: tmp,
    }
}

async fn open_server() -> TestServer {
    start_test_server(LoopbackTransport::new().with_auto_pair(), AuthConfig::default()).await
}

fn send_body(message: &str) -> serde_json::Value {
    serde_json::json!({
        "connectionId": "shop1",
        "phoneNumber": "5511999990000",
        "message": message,
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = open_server().await;
    let resp = reqwest::get(format!("http://{}/health", server.addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "parley");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["inFlightConversations"], 0);
}

#[tokio::test]
async fn test_auth_required_when_keys_configured() {
    let server = start_test_server(
        LoopbackTransport::new(),
        AuthConfig::new(vec!["secret".to_string()]),
    )
    .await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/health", server.addr);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let resp = client.get(&url).bearer_auth("secret").send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_connect_reports_qr() {
    let server = start_test_server(LoopbackTransport::new(), AuthConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/connect", server.addr))
        .json(&serde_json::json!({"connectionId": "shop1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["connectionId"], "shop1");
    assert_eq!(body["connected"], false);
    assert_eq!(body["status"], "connecting");

    server.transport.issue_qr("shop1", "2@pairing-ref").await.unwrap();

    let url = format!("http://{}/connect?connectionId=shop1", server.addr);
    let mut status = serde_json::Value::Null;
    for _ in 0..100 {
        status = client.get(&url).send().await.unwrap().json().await.unwrap();
        if status["status"] == "qr_pending" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status["status"], "qr_pending");
    assert!(status["qrCode"]
        .as_str()
        .unwrap()
        .starts_with("data:image/svg+xml;base64,"));
}

#[tokio::test]
async fn test_unknown_connection_is_disconnected() {
    let server = open_server().await;
    let body: serde_json::Value = reqwest::get(format!(
        "http://{}/connect?connectionId=nobody",
        server.addr
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(body["status"], "disconnected");
    assert_eq!(body["connected"], false);
    assert!(body["qrCode"].is_null());
}

#[tokio::test]
async fn test_connect_rejects_invalid_id() {
    let server = open_server().await;
    let resp = reqwest::Client::new()
        .post(format!("http://{}/connect", server.addr))
        .json(&serde_json::json!({"connectionId": "../etc"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_input");
}

#[tokio::test]
async fn test_send_without_session_is_conflict() {
    let server = open_server().await;
    let resp = reqwest::Client::new()
        .post(format!("http://{}/send", server.addr))
        .json(&send_body("oi"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "not_connected");
    assert_eq!(server.transport.open_count("shop1"), 0);
}

#[tokio::test]
async fn test_send_restores_paired_session() {
    let server = open_server().await;
    server.controller.start("shop1").await.unwrap();
    assert!(
        server
            .controller
            .wait_for_connected("shop1", Duration::from_secs(5))
            .await
    );
    // Drop the live session but keep the pairing on disk.
    server.controller.shutdown();
    assert!(server.controller.has_credentials("shop1").await);

    let resp = reqwest::Client::new()
        .post(format!("http://{}/send", server.addr))
        .json(&send_body("Seu pedido chegou"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["messageId"].as_str().unwrap().starts_with("LOOP"));
    assert!(body["conversationId"].is_string());

    assert_eq!(server.transport.open_count("shop1"), 2);
    let sent = server.transport.sent("shop1");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "5511999990000@s.whatsapp.net");
}

#[tokio::test]
async fn test_conversation_endpoints() {
    let server = open_server().await;
    let client = reqwest::Client::new();
    server.controller.start("shop1").await.unwrap();
    assert!(
        server
            .controller
            .wait_for_connected("shop1", Duration::from_secs(5))
            .await
    );

    let sent: serde_json::Value = client
        .post(format!("http://{}/send", server.addr))
        .json(&send_body("Olá"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conversation_id = sent["conversationId"].as_str().unwrap().to_string();

    let conversations: Vec<serde_json::Value> = client
        .get(format!("http://{}/connections/shop1/conversations", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["id"], conversation_id.as_str());

    let messages: Vec<serde_json::Value> = client
        .get(format!(
            "http://{}/conversations/{conversation_id}/messages?limit=10",
            server.addr
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["body"], "Olá");

    let resp = client
        .patch(format!("http://{}/conversations/{conversation_id}", server.addr))
        .json(&serde_json::json!({"automationEnabled": false, "tags": ["vip"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let updated: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(updated["automation_enabled"], false);
    assert_eq!(updated["tags"][0], "vip");

    let resp = client
        .get(format!(
            "http://{}/conversations/{}/messages",
            server.addr,
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_disconnect_purges_pairing() {
    let server = open_server().await;
    server.controller.start("shop1").await.unwrap();
    assert!(
        server
            .controller
            .wait_for_connected("shop1", Duration::from_secs(5))
            .await
    );

    let resp = reqwest::Client::new()
        .delete(format!("http://{}/connect?connectionId=shop1", server.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "disconnected");

    assert!(!server.controller.has_credentials("shop1").await);
    assert!(server.transport.handle("shop1").unwrap().was_logged_out());
}
