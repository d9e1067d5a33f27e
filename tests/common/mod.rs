//! In-process stand-in for the download backend.
//!
//! Serves the health check, the download and cloud storage endpoints and a
//! SignalR-style progress hub on a random local port.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use mediagate::prelude::*;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

const RS: char = '\u{1e}';

/// What `POST /api/download/{platform}` answers when a file is requested inline.
#[derive(Clone)]
pub enum InlineReply {
    /// `video/mp4` body with a declared length.
    File(Vec<u8>),
    /// `video/mp4` body streamed without a length.
    Streamed(Vec<u8>),
    /// 200 with a JSON body.
    Json(Value),
    /// Non-2xx with a JSON body.
    Error(u16, Value),
}

struct MockState {
    healthy: bool,
    inline: InlineReply,
    hits: AtomicUsize,
    /// While false, `/negotiate` answers 503.
    hub_available: AtomicBool,
    hub_sessions: AtomicUsize,
    /// `blip-` batches whose first join already cut the socket.
    blipped: Mutex<HashSet<String>>,
}

pub struct MockBackend {
    /// e.g. `http://127.0.0.1:12345`
    pub base_url: String,
    state: Arc<MockState>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockBackend {
    pub async fn spawn(inline: InlineReply) -> Self {
        Self::spawn_with(true, inline).await
    }

    pub async fn spawn_unhealthy() -> Self {
        Self::spawn_with(false, InlineReply::File(Vec::new())).await
    }

    async fn spawn_with(healthy: bool, inline: InlineReply) -> Self {
        let state = Arc::new(MockState {
            healthy,
            inline,
            hits: AtomicUsize::new(0),
            hub_available: AtomicBool::new(true),
            hub_sessions: AtomicUsize::new(0),
            blipped: Mutex::new(HashSet::new()),
        });

        let app = Router::new()
            .route("/health", get(health))
            .route("/api/download/{platform}", post(download))
            .route("/api/download/batch/{id}/progress", get(batch_progress))
            .route("/api/cloudstorage/download-and-upload", post(cloud_download))
            .route("/api/cloudstorage/delete/{key}", delete(cloud_delete))
            .route("/hubs/downloads/negotiate", post(negotiate))
            .route("/hubs/downloads", get(hub))
            .layer(middleware::from_fn_with_state(state.clone(), count_hits))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock backend");
        let port = listener.local_addr().expect("local addr").port();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("mock backend crashed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            state,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Requests served so far, of any kind.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// Hub sockets opened so far.
    pub fn hub_sessions(&self) -> usize {
        self.state.hub_sessions.load(Ordering::SeqCst)
    }

    pub fn set_hub_available(&self, available: bool) {
        self.state.hub_available.store(available, Ordering::SeqCst);
    }

    /// Config whose only candidate is this backend.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::default().with_candidates(vec![CandidateEndpoint::new(
            self.base_url.clone(),
            EndpointKind::PrimaryDomain,
        )])
    }

    pub fn client(&self) -> DownloadClient {
        Self::client_from(&self.config())
    }

    pub fn client_from(config: &ClientConfig) -> DownloadClient {
        let prober = Arc::new(ConnectionProber::new(config).expect("prober"));
        DownloadClient::new(config, prober).expect("client")
    }
}

async fn count_hits(State(state): State<Arc<MockState>>, request: Request<Body>, next: Next) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    next.run(request).await
}

async fn health(State(state): State<Arc<MockState>>) -> StatusCode {
    if state.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn download(
    State(state): State<Arc<MockState>>,
    Path(platform): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if body["DirectDownload"] != json!(true) {
        let url = body["Url"].as_str().unwrap_or_default();
        let batch_id = if url.contains("fail") { "fail-1" } else { "batch-1" };
        return Json(json!({ "batchId": batch_id, "platform": platform })).into_response();
    }
    match state.inline.clone() {
        InlineReply::File(bytes) => (
            [
                (CONTENT_TYPE, "video/mp4".to_string()),
                (CONTENT_LENGTH, bytes.len().to_string()),
                (CONTENT_DISPOSITION, "attachment; filename=\"clip.mp4\"".to_string()),
            ],
            bytes,
        )
            .into_response(),
        InlineReply::Streamed(bytes) => {
            let chunks: Vec<Result<Vec<u8>, std::io::Error>> = bytes.chunks(256).map(|c| Ok(c.to_vec())).collect();
            (
                [(CONTENT_TYPE, "video/mp4")],
                Body::from_stream(futures_util::stream::iter(chunks)),
            )
                .into_response()
        }
        InlineReply::Json(value) => Json(value).into_response(),
        InlineReply::Error(status, value) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(value)).into_response()
        }
    }
}

async fn batch_progress(Path(id): Path<String>) -> Json<Value> {
    if id.starts_with("done-") {
        return Json(json!({
            "task_id": id,
            "status": "completed",
            "progress": 100.0,
            "completed_items": 5,
            "total_items": 5,
            "download_url": format!("/files/{id}.zip")
        }));
    }
    Json(json!({
        "task_id": id,
        "status": "running",
        "progress": 40.0,
        "completed_items": 2,
        "total_items": 5,
        "current_item": "https://www.youtube.com/watch?v=abc123"
    }))
}

async fn cloud_download(Json(body): Json<Value>) -> Json<Value> {
    if body["videoUrl"].as_str().unwrap_or_default().contains("fail") {
        return Json(json!({ "success": false, "errorMessage": "upload refused" }));
    }
    Json(json!({
        "success": true,
        "publicUrl": "https://cdn.example.com/clip.mp4",
        "fileKey": "clip-key",
        "fileName": "clip.mp4",
        "fileSize": 1234,
        "expirationTime": "2030-01-01T00:00:00Z"
    }))
}

async fn cloud_delete(Path(key): Path<String>) -> Json<Value> {
    Json(json!({ "deleted": key }))
}

async fn negotiate(State(state): State<Arc<MockState>>) -> Response {
    if !state.hub_available.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(json!({
        "negotiateVersion": 1,
        "connectionId": "conn-1",
        "connectionToken": "token-1",
        "availableTransports": [{ "transport": "WebSockets", "transferFormats": ["Text"] }]
    }))
    .into_response()
}

async fn hub(State(state): State<Arc<MockState>>, ws: WebSocketUpgrade) -> Response {
    state.hub_sessions.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| run_hub(socket, state))
}

async fn send_record(socket: &mut WebSocket, record: Value) -> bool {
    socket
        .send(Message::Text(format!("{record}{RS}").into()))
        .await
        .is_ok()
}

/// Answers the handshake, then plays a short script for every joined
/// batch: noise for another batch, 50 % progress, then completion (or an
/// error for ids starting with `fail`).
///
/// Some ids change the hub's behaviour on join:
/// - `drop-`: the hub goes away (negotiate fails) and the socket is closed;
/// - `blip-`: the first join closes the socket, later joins play the script;
/// - `done-`: nothing is sent, the batch finished before anyone joined.
async fn run_hub(mut socket: WebSocket, state: Arc<MockState>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else { continue };
        for record in text.as_str().split(RS).filter(|r| !r.is_empty()) {
            let Ok(value) = serde_json::from_str::<Value>(record) else { continue };
            if value.get("protocol").is_some() {
                if !send_record(&mut socket, json!({})).await {
                    return;
                }
                continue;
            }
            if value["type"] != json!(1) || value["target"] != json!("JoinBatchGroup") {
                continue;
            }
            let batch_id = value["arguments"][0].as_str().unwrap_or_default().to_string();
            if let Some(id) = value.get("invocationId") {
                send_record(&mut socket, json!({ "type": 3, "invocationId": id, "result": null })).await;
            }
            if batch_id.starts_with("drop-") {
                state.hub_available.store(false, Ordering::SeqCst);
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            let first_blip = batch_id.starts_with("blip-") && state.blipped.lock().unwrap().insert(batch_id.clone());
            if first_blip {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            if batch_id.starts_with("done-") {
                continue;
            }
            let script = [
                json!({ "type": 1, "target": "BatchProgressUpdate", "arguments": ["someone-else", { "percentage": 99.0, "message": "not yours" }] }),
                json!({ "type": 1, "target": "BatchProgressUpdate", "arguments": [batch_id, { "percentage": 50.0, "message": "halfway" }] }),
                if batch_id.starts_with("fail") {
                    json!({ "type": 1, "target": "BatchError", "arguments": [batch_id, { "message": "conversion failed" }] })
                } else {
                    json!({ "type": 1, "target": "BatchCompleted", "arguments": [batch_id, { "success": true, "fileId": format!("file-{batch_id}") }] })
                },
            ];
            for record in script {
                if !send_record(&mut socket, record).await {
                    return;
                }
            }
        }
    }
}
