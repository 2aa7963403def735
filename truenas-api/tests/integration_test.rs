//! Integration tests for truenas-api
//!
//! Drives `HttpNasClient` through the trait object the driver uses, against a
//! scripted local HTTP responder. Tests focus on:
//! - Route and query construction for the iSCSI objects
//! - Request bodies for create/update/delete
//! - Status handling across a multi-request exchange

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use truenas_api::models::{
    AuthFilter, IscsiAuthCreate, IscsiAuthUpdate, IscsiTargetCreate, TargetGroup,
};
use truenas_api::{Credentials, HttpNasClient, NasApi, NasError};

// ============================================================================
// Scripted responder
// ============================================================================

/// Serve one connection per scripted `(status line, body)` pair, in order,
/// and return the raw requests received.
async fn scripted_server(script: Vec<(&'static str, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for (status, body) in script {
            let (mut socket, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut socket).await);

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
        requests
    });

    (format!("http://{}/api/v2.0/", addr), handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut request = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&request).to_string();
        if let Some(end) = text.find("\r\n\r\n") {
            let content_length = text[..end]
                .lines()
                .find_map(|l| {
                    l.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            if request.len() >= end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&request).to_string()
}

fn request_line(request: &str) -> String {
    request.lines().next().unwrap_or_default().to_string()
}

fn request_body(request: &str) -> serde_json::Value {
    let body = request.split("\r\n\r\n").nth(1).unwrap_or_default();
    serde_json::from_str(body).unwrap_or(serde_json::Value::Null)
}

fn client(url: &str) -> Arc<dyn NasApi> {
    Arc::new(
        HttpNasClient::new(url, Credentials::ApiKey("k".into()), Duration::from_secs(5))
            .unwrap(),
    )
}

// ============================================================================
// CHAP auth and target provisioning
// ============================================================================

#[tokio::test]
async fn test_auth_create_then_tag_update() {
    let (url, server) = scripted_server(vec![
        ("200 OK", "[]"),
        ("200 OK", r#"{"id": 9, "tag": 0, "user": "abc", "secret": "x"}"#),
        ("200 OK", r#"{"id": 9, "tag": 9}"#),
    ])
    .await;
    let nas = client(&url);

    let existing = nas
        .find_iscsi_auths(&AuthFilter::User("abc".into()))
        .await
        .unwrap();
    assert!(existing.is_empty());

    let id = nas
        .create_iscsi_auth(&IscsiAuthCreate {
            tag: 0,
            user: "abc".into(),
            secret: "0123456789abcdef".into(),
        })
        .await
        .unwrap();
    assert_eq!(id, 9);

    nas.update_iscsi_auth(id, &IscsiAuthUpdate { tag: Some(id) })
        .await
        .unwrap();

    let requests = server.await.unwrap();
    assert_eq!(request_line(&requests[0]), "GET /api/v2.0/iscsi/auth?user=abc HTTP/1.1");
    assert_eq!(request_line(&requests[1]), "POST /api/v2.0/iscsi/auth HTTP/1.1");
    assert_eq!(request_body(&requests[1])["tag"], 0);
    assert_eq!(request_line(&requests[2]), "PUT /api/v2.0/iscsi/auth/id/9 HTTP/1.1");
    assert_eq!(request_body(&requests[2]), serde_json::json!({"tag": 9}));
}

#[tokio::test]
async fn test_target_create_sends_chap_group() {
    let (url, server) = scripted_server(vec![("200 OK", r#"{"id": 4}"#)]).await;
    let nas = client(&url);

    let id = nas
        .create_iscsi_target(&IscsiTargetCreate {
            name: "f2868e1aa7cab669517cd9f5ab1b7957c0b92df3".into(),
            groups: vec![TargetGroup {
                portal: 1,
                initiator: None,
                authmethod: "CHAP".into(),
                auth: Some(9),
            }],
        })
        .await
        .unwrap();
    assert_eq!(id, 4);

    let requests = server.await.unwrap();
    let body = request_body(&requests[0]);
    assert_eq!(body["groups"][0]["portal"], 1);
    assert_eq!(body["groups"][0]["authmethod"], "CHAP");
    assert_eq!(body["groups"][0]["auth"], 9);
}

#[tokio::test]
async fn test_target_extent_lookup_query() {
    let (url, server) = scripted_server(vec![(
        "200 OK",
        r#"[{"id": 3, "target": 4, "extent": 5, "lunid": 0}]"#,
    )])
    .await;
    let nas = client(&url);

    let assocs = nas.find_target_extents(4, 5).await.unwrap();
    assert_eq!(assocs.len(), 1);
    assert_eq!(assocs[0].lunid, Some(0));

    let requests = server.await.unwrap();
    assert_eq!(
        request_line(&requests[0]),
        "GET /api/v2.0/iscsi/targetextent?target=4&extent=5 HTTP/1.1"
    );
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_dataset_delete_is_recursive() {
    let (url, server) = scripted_server(vec![("200 OK", "true")]).await;
    let nas = client(&url);

    nas.delete_dataset("tank/k8s/abc", true).await.unwrap();

    let requests = server.await.unwrap();
    assert_eq!(
        request_line(&requests[0]),
        "DELETE /api/v2.0/pool/dataset/id/tank%2Fk8s%2Fabc HTTP/1.1"
    );
    assert_eq!(request_body(&requests[0]), serde_json::json!({"recursive": true}));
}

#[tokio::test]
async fn test_delete_of_missing_object_reports_not_found() {
    let (url, server) = scripted_server(vec![
        ("404 Not Found", r#"{"message": "not found"}"#),
        ("500 Internal Server Error", r#"{"message": "middleware down"}"#),
    ])
    .await;
    let nas = client(&url);

    let err = nas.delete_iscsi_target(4).await.unwrap_err();
    assert!(err.is_not_found());

    let err = nas.delete_iscsi_extent(5).await.unwrap_err();
    assert!(!err.is_not_found());
    assert!(matches!(err, NasError::Status { status: 500, .. }));

    server.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_nas_is_transport_error() {
    // Bind and drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let nas = client(&format!("http://{}/api/v2.0", addr));
    let err = nas.iscsi_global().await.unwrap_err();
    assert!(matches!(err, NasError::Transport(_)));
    assert!(!err.is_rejected());
}
