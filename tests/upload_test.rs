//! Multipart upload tests
//!
//! An in-process axum server stands in for the middleware's REST endpoints.

mod common;

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use common::{fast_settings, test_config, FakeMiddleware};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use truenas_client::error::ClientError;
use truenas_client::truenas::TrueNasClient;

#[derive(Debug, Default, Clone)]
struct Captured {
    authorization: Option<String>,
    data: Option<String>,
    file_name: Option<String>,
    file: Option<Vec<u8>>,
}

type Uploads = Arc<Mutex<Vec<Captured>>>;

async fn capture(
    State(uploads): State<Uploads>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Captured {
    let mut captured = Captured {
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    };

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().map(str::to_string);
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.unwrap();
        match name.as_deref() {
            Some("data") => captured.data = Some(String::from_utf8(bytes.to_vec()).unwrap()),
            Some("file") => {
                captured.file_name = file_name;
                captured.file = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    uploads.lock().unwrap().push(captured.clone());
    captured
}

async fn put_file(state: State<Uploads>, headers: HeaderMap, multipart: Multipart) -> Json<Value> {
    capture(state, headers, multipart).await;
    // The middleware answers with the id of the job doing the work
    Json(json!(42))
}

async fn reject_config(
    state: State<Uploads>,
    headers: HeaderMap,
    multipart: Multipart,
) -> impl IntoResponse {
    capture(state, headers, multipart).await;
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        "[EINVAL] config.upload: Invalid configuration database",
    )
}

async fn garbled(state: State<Uploads>, headers: HeaderMap, multipart: Multipart) -> &'static str {
    capture(state, headers, multipart).await;
    "<html>maintenance</html>"
}

async fn spawn_upload_server() -> (SocketAddr, Uploads) {
    let uploads: Uploads = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/api/v2.0/filesystem/put", post(put_file))
        .route("/api/v2.0/config/upload", post(reject_config))
        .route("/api/v2.0/mail/send", post(garbled))
        .with_state(uploads.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, uploads)
}

fn upload_client(addr: SocketAddr, middleware: Arc<FakeMiddleware>) -> TrueNasClient {
    TrueNasClient::with_transport(middleware, &test_config(&addr.to_string()), fast_settings())
        .unwrap()
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("params must be an object"),
    }
}

#[tokio::test]
async fn test_upload_sends_data_and_file_parts() {
    // Given: A running upload endpoint
    let (addr, uploads) = spawn_upload_server().await;
    let client = upload_client(addr, FakeMiddleware::new());

    // When: Uploading a file with parameters
    let result = client
        .upload_file(
            "/api/v2.0/filesystem/put",
            &params(json!({"path": "/mnt/tank/motd"})),
            b"welcome\n".to_vec(),
            "/mnt/tank/motd",
        )
        .await
        .unwrap();

    // Then: The decoded reply is returned
    assert_eq!(result, json!(42));

    // Then: The body carried both parts and the bearer token
    let uploads = uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    let upload = &uploads[0];
    assert_eq!(upload.authorization.as_deref(), Some("Bearer test-key"));
    let data: Value = serde_json::from_str(upload.data.as_deref().unwrap()).unwrap();
    assert_eq!(data, json!({"path": "/mnt/tank/motd"}));
    assert_eq!(upload.file_name.as_deref(), Some("/mnt/tank/motd"));
    assert_eq!(upload.file.as_deref(), Some(&b"welcome\n"[..]));
}

#[tokio::test]
async fn test_upload_does_not_wait_for_returned_job() {
    // Given: A middleware whose job would never finish
    let (addr, _uploads) = spawn_upload_server().await;
    let middleware = FakeMiddleware::new();
    let client = upload_client(addr, middleware.clone());

    // When: The upload reply is a job id
    let started = Instant::now();
    let result = client
        .upload_file(
            "/api/v2.0/filesystem/put",
            &params(json!({"path": "/mnt/tank/big.iso"})),
            vec![0u8; 64 * 1024],
            "big.iso",
        )
        .await
        .unwrap();

    // Then: The id comes back and no job polling happened
    assert_eq!(result, json!(42));
    assert!(middleware.calls().is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_upload_accepts_empty_file() {
    let (addr, uploads) = spawn_upload_server().await;
    let client = upload_client(addr, FakeMiddleware::new());

    client
        .upload_file(
            "/api/v2.0/filesystem/put",
            &params(json!({"path": "/mnt/tank/empty"})),
            Vec::new(),
            "empty",
        )
        .await
        .unwrap();

    let uploads = uploads.lock().unwrap();
    assert_eq!(uploads[0].file.as_deref(), Some(&b""[..]));
}

#[tokio::test]
async fn test_rejected_upload_reports_status_and_body() {
    // Given: An endpoint that refuses the payload
    let (addr, _uploads) = spawn_upload_server().await;
    let client = upload_client(addr, FakeMiddleware::new());

    // When: Uploading
    let err = client
        .upload_file(
            "/api/v2.0/config/upload",
            &Map::new(),
            b"not a database".to_vec(),
            "upload",
        )
        .await
        .unwrap_err();

    // Then: Status and middleware text are preserved
    match &err {
        ClientError::UploadRejected { status, body } => {
            assert_eq!(*status, 422);
            assert!(body.contains("[EINVAL]"));
        }
        other => panic!("expected UploadRejected, got {:?}", other),
    }
    assert!(!err.is_not_found());
}

#[tokio::test]
async fn test_non_json_reply_is_a_decode_error() {
    let (addr, _uploads) = spawn_upload_server().await;
    let client = upload_client(addr, FakeMiddleware::new());

    let err = client
        .upload_file(
            "/api/v2.0/mail/send",
            &params(json!({"subject": "hi", "text": "hello"})),
            b"attachment".to_vec(),
            "notes.txt",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Decode(_)));
}

#[tokio::test]
async fn test_missing_endpoint_is_rejected() {
    let (addr, _uploads) = spawn_upload_server().await;
    let client = upload_client(addr, FakeMiddleware::new());

    let err = client
        .upload_file("/api/v2.0/nope", &Map::new(), Vec::new(), "x")
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::UploadRejected { status: 404, .. }));
}
