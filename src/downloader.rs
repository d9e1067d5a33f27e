// src/downloader.rs

use crate::config::ClientConfig;
use crate::models::{
    BackendDownloadBody, BatchAccepted, CloudDownloadBody, CloudUploadBody, CloudUploadResult, DownloadOutcome,
    DownloadRequest, FailureKind, MediaItemsBody, PlaylistDownloadBody, PlaylistItem, PlaylistTaskStatus, Progress,
    SelectedConnection,
};
use crate::platform::{page_for_route, Page};
use crate::prober::ConnectionProber;
use crate::gate::{Guarded, MonetizationGate};
use crate::realtime::{BatchCompletion, HubError, ProgressHub, ReconnectPolicy, SubscriptionEnd};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

/// Cap on the up-front buffer reservation for inline payloads.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Validation(String),
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// The backend answered 2xx but reported a failure in its body.
    #[error("{0}")]
    Rejected(String),
    #[error("unexpected response: {0}")]
    UnexpectedContentType(String),
    #[error("request timed out")]
    Timeout,
    #[error("progress hub error: {0}")]
    Hub(#[from] HubError),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else if e.is_decode() {
            ClientError::UnexpectedContentType(e.to_string())
        } else {
            ClientError::Network(e)
        }
    }
}

impl ClientError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ClientError::Validation(_) | ClientError::Hub(HubError::EmptyBatchId) => FailureKind::Validation,
            ClientError::Network(_) | ClientError::Hub(_) => FailureKind::Network,
            ClientError::Server { .. } | ClientError::Rejected(_) => FailureKind::Server,
            ClientError::UnexpectedContentType(_) => FailureKind::UnexpectedContentType,
            ClientError::Timeout => FailureKind::Timeout,
        }
    }

    /// The terminal outcome shown to the user. Server-provided messages are
    /// passed through verbatim.
    pub fn into_outcome(self) -> DownloadOutcome {
        let kind = self.kind();
        let message = match self {
            ClientError::Validation(message)
            | ClientError::Rejected(message)
            | ClientError::Server { message, .. } => message,
            other => other.to_string(),
        };
        DownloadOutcome::Failure { kind, message }
    }
}

/// Checks a request against the page it was submitted on. Runs before any
/// network activity.
pub fn validate(page_route: &str, request: &DownloadRequest) -> Result<&'static Page, ClientError> {
    let page = page_for_route(page_route)
        .ok_or_else(|| ClientError::Validation(format!("Unknown download page: {page_route}")))?;
    let target = request.target_url.trim();
    if target.is_empty() {
        return Err(ClientError::Validation("Please enter a URL".to_string()));
    }
    if !page.accepts(target) {
        return Err(ClientError::Validation(format!(
            "This URL is not supported here. Accepted sources: {}",
            page.domains.join(", ")
        )));
    }
    Ok(page)
}

/// Options for [`DownloadClient::upload_to_cloud_storage`].
#[derive(Debug, Clone)]
pub struct CloudUploadOptions {
    pub custom_key: Option<String>,
    pub make_public: bool,
    pub retention_hours: u32,
}

impl Default for CloudUploadOptions {
    fn default() -> Self {
        Self {
            custom_key: None,
            make_public: true,
            retention_hours: 24,
        }
    }
}

/// Turns one user request into one [`DownloadOutcome`] against whichever
/// backend the prober selected.
pub struct DownloadClient {
    http: Client,
    prober: Arc<ConnectionProber>,
    hub_path: String,
    subscription_timeout: Duration,
    reconnect: ReconnectPolicy,
    hub: Mutex<Option<Arc<ProgressHub>>>,
}

impl DownloadClient {
    pub fn new(config: &ClientConfig, prober: Arc<ConnectionProber>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            prober,
            hub_path: config.hub_path.clone(),
            subscription_timeout: config.subscription_timeout,
            reconnect: ReconnectPolicy::default(),
            hub: Mutex::new(None),
        })
    }

    /// Replaces the hub's reconnect curve. Takes effect on the next
    /// hub connection.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn prober(&self) -> &Arc<ConnectionProber> {
        &self.prober
    }

    /// Runs a download in the mode the request's options ask for.
    /// Remote storage wins over inline; with neither the backend is asked
    /// for an asynchronous batch.
    pub async fn download<F>(&self, page_route: &str, request: &DownloadRequest, on_progress: F) -> DownloadOutcome
    where
        F: FnMut(Progress),
    {
        let page = match validate(page_route, request) {
            Ok(page) => page,
            Err(e) => {
                debug!(page_route, url = %request.target_url, reason = %e, "request rejected before sending");
                return e.into_outcome();
            }
        };

        let connection = self.prober.detect_best_connection().await;
        let result = if request.options.wants_remote_storage {
            self.download_to_remote_storage(&connection, request, on_progress).await
        } else if request.options.wants_inline_file {
            self.download_inline(&connection, page, request, on_progress).await
        } else {
            self.start_batch(&connection, page, request).await
        };

        result.unwrap_or_else(|e| {
            warn!(platform = page.platform, url = %request.target_url, error = %e, "download failed");
            e.into_outcome()
        })
    }

    async fn download_inline<F>(
        &self,
        connection: &SelectedConnection,
        page: &Page,
        request: &DownloadRequest,
        mut on_progress: F,
    ) -> Result<DownloadOutcome, ClientError>
    where
        F: FnMut(Progress),
    {
        let url = api_url(connection, &["download", page.platform])?;
        let body = backend_body(request, true);
        info!(platform = page.platform, url = %request.target_url, "requesting inline file");

        let resp = ensure_success(self.http.post(url).json(&body).send().await?).await?;
        if is_json(resp.headers()) {
            let text = resp.text().await?;
            return Err(failure_from_json(&text));
        }

        let total = resp.content_length().filter(|len| *len > 0);
        let file_name = file_name_from_headers(resp.headers())
            .unwrap_or_else(|| fallback_file_name(page.platform, &request.desired_format));

        let mut bytes = Vec::with_capacity(total.unwrap_or(0).min(MAX_PREALLOCATION) as usize);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?);
            on_progress(match total {
                Some(total) => Progress::Fraction((bytes.len() as f32 / total as f32).min(1.0)),
                None => Progress::Indeterminate,
            });
        }

        info!(file_name = %file_name, size = bytes.len(), "inline file received");
        Ok(DownloadOutcome::BinaryPayload { bytes, suggested_file_name: file_name })
    }

    async fn download_to_remote_storage<F>(
        &self,
        connection: &SelectedConnection,
        request: &DownloadRequest,
        mut on_progress: F,
    ) -> Result<DownloadOutcome, ClientError>
    where
        F: FnMut(Progress),
    {
        let url = api_url(connection, &["cloudstorage", "download-and-upload"])?;
        let body = CloudDownloadBody {
            video_url: &request.target_url,
            format: &request.desired_format,
            quality: &request.desired_quality,
            custom_file_name: format!("download_{}", unix_millis()),
            make_public: true,
            retention_hours: 24,
        };
        on_progress(Progress::Fraction(0.1));

        let result: CloudUploadResult = self.send_json(self.http.post(url).json(&body)).await?;
        if !result.success {
            return Err(ClientError::Rejected(
                result
                    .error_message
                    .unwrap_or_else(|| "Cloud storage upload failed".to_string()),
            ));
        }
        let public_url = result
            .public_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ClientError::UnexpectedContentType("upload succeeded without a public URL".to_string()))?;

        on_progress(Progress::Fraction(1.0));
        Ok(DownloadOutcome::RemoteReference { public_url, expiry: result.expiration_time })
    }

    async fn start_batch(
        &self,
        connection: &SelectedConnection,
        page: &Page,
        request: &DownloadRequest,
    ) -> Result<DownloadOutcome, ClientError> {
        let url = api_url(connection, &["download", page.platform])?;
        let body = backend_body(request, false);
        let accepted: BatchAccepted = self.send_json(self.http.post(url).json(&body)).await?;
        match accepted.batch_id.filter(|id| !id.trim().is_empty()) {
            Some(batch_id) => {
                info!(%batch_id, platform = page.platform, "batch accepted");
                Ok(DownloadOutcome::AsyncHandle { progress_channel_id: batch_id })
            }
            None => Err(ClientError::UnexpectedContentType("No batch ID returned from server".to_string())),
        }
    }

    /// Follows an async batch on the progress hub until it finishes.
    ///
    /// The group is joined only after the backend handed out the id, so
    /// the batch status is read once after joining. A batch that already
    /// finished in between resolves from that status instead of waiting
    /// for events that were never delivered.
    pub async fn await_batch<F>(&self, batch_id: &str, mut on_progress: F) -> DownloadOutcome
    where
        F: FnMut(Progress),
    {
        if batch_id.trim().is_empty() {
            warn!("no batch id to follow, not subscribing");
            return ClientError::Hub(HubError::EmptyBatchId).into_outcome();
        }
        let subscription = match self.hub().await.and_then(|hub| hub.subscribe(batch_id).map_err(ClientError::from)) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(batch_id, error = %e, "cannot follow batch");
                return e.into_outcome();
            }
        };

        match self.playlist_status(batch_id).await {
            Ok(status) => {
                let connection = self.prober.detect_best_connection().await;
                if let Some(outcome) = outcome_from_status(&connection, &status) {
                    debug!(batch_id, status = %status.status, "batch already finished before joining");
                    return outcome;
                }
            }
            Err(e) => debug!(batch_id, error = %e, "batch status unavailable, waiting for events"),
        }

        let end = subscription
            .wait_terminal(|p| on_progress(Progress::Fraction((p.percentage / 100.0).clamp(0.0, 1.0))))
            .await;

        match end {
            SubscriptionEnd::Completed(done) => {
                let connection = self.prober.detect_best_connection().await;
                completion_outcome(&connection, done)
            }
            SubscriptionEnd::Failed(message) => DownloadOutcome::Failure { kind: FailureKind::Server, message },
            SubscriptionEnd::TimedOut => DownloadOutcome::Failure {
                kind: FailureKind::Timeout,
                message: "Timed out waiting for the batch to finish".to_string(),
            },
            SubscriptionEnd::Disconnected => DownloadOutcome::Failure {
                kind: FailureKind::Network,
                message: "Connection to the progress hub was lost".to_string(),
            },
        }
    }

    /// Runs `download` behind the click gate. A request that fails
    /// validation is answered at once and never counts as a click.
    pub async fn download_gated<F>(
        &self,
        gate: &MonetizationGate,
        page_route: &str,
        request: &DownloadRequest,
        is_conversion: bool,
        on_progress: F,
    ) -> Guarded<DownloadOutcome>
    where
        F: FnMut(Progress),
    {
        let page = match validate(page_route, request) {
            Ok(page) => page,
            Err(e) => {
                debug!(page_route, url = %request.target_url, reason = %e, "invalid request, gate untouched");
                return Guarded::Ran(e.into_outcome());
            }
        };
        let guarded = gate
            .guard(page.category, is_conversion, move || async move {
                let outcome = self.download(page_route, request, on_progress).await;
                if outcome.is_failure() {
                    Err(outcome)
                } else {
                    Ok(outcome)
                }
            })
            .await;
        match guarded {
            Guarded::Pending { clicks_left } => Guarded::Pending { clicks_left },
            Guarded::Ran(Ok(outcome)) | Guarded::Ran(Err(outcome)) => Guarded::Ran(outcome),
        }
    }

    /// The shared hub, connected on first use. A hub whose connection task
    /// has ended is replaced by a fresh connection.
    async fn hub(&self) -> Result<Arc<ProgressHub>, ClientError> {
        let mut slot = self.hub.lock().await;
        if let Some(hub) = slot.as_ref().filter(|hub| !hub.is_closed()) {
            return Ok(Arc::clone(hub));
        }
        if slot.take().is_some() {
            info!("progress hub was closed, reconnecting");
        }
        let connection = self.prober.detect_best_connection().await;
        let hub = Arc::new(
            ProgressHub::connect_with_policy(
                &connection.realtime_base_url,
                &self.hub_path,
                self.subscription_timeout,
                self.reconnect,
            )
            .await?,
        );
        *slot = Some(Arc::clone(&hub));
        Ok(hub)
    }

    /// Expands a multi-item post (Instagram, Facebook, Reddit) into its
    /// individual media entries.
    pub async fn post_media_items(
        &self,
        platform: &str,
        url: &str,
        instagram_cookies: Option<&str>,
    ) -> Result<Value, ClientError> {
        let connection = self.prober.detect_best_connection().await;
        let endpoint = api_url(&connection, &["download", platform, "media"])?;
        let body = MediaItemsBody {
            url,
            instagram_cookies: instagram_cookies.filter(|_| platform == "instagram"),
        };
        self.send_json(self.http.post(endpoint).json(&body)).await
    }

    pub async fn youtube_video(&self, url: &str, format: &str, quality: &str) -> Result<Value, ClientError> {
        self.youtube_call(&["download", "youtube"], url, format, quality).await
    }

    /// Lists a YouTube playlist's items for individual selection.
    pub async fn youtube_playlist(&self, url: &str, format: &str, quality: &str) -> Result<Value, ClientError> {
        self.youtube_call(&["download", "youtube", "playlist"], url, format, quality).await
    }

    async fn youtube_call(&self, path: &[&str], url: &str, format: &str, quality: &str) -> Result<Value, ClientError> {
        let connection = self.prober.detect_best_connection().await;
        let endpoint = api_url(&connection, path)?;
        let body = serde_json::json!({ "Url": url, "Format": format, "Quality": quality });
        self.send_json(self.http.post(endpoint).json(&body)).await
    }

    /// Queues a playlist batch and returns its batch id.
    pub async fn create_playlist_download(
        &self,
        items: &[PlaylistItem],
        output_format: Option<&str>,
    ) -> Result<String, ClientError> {
        if items.is_empty() {
            return Err(ClientError::Validation("Playlist has no items".to_string()));
        }
        let connection = self.prober.detect_best_connection().await;
        let endpoint = api_url(&connection, &["download", "playlist"])?;
        let body = PlaylistDownloadBody {
            urls: items.iter().map(|item| item.url.as_str()).collect(),
            format: output_format.unwrap_or("mp4"),
            quality: &items[0].quality,
        };
        let accepted: BatchAccepted = self.send_json(self.http.post(endpoint).json(&body)).await?;
        accepted
            .batch_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ClientError::UnexpectedContentType("No batch ID returned from server".to_string()))
    }

    pub async fn playlist_status(&self, batch_id: &str) -> Result<PlaylistTaskStatus, ClientError> {
        let connection = self.prober.detect_best_connection().await;
        let endpoint = api_url(&connection, &["download", "batch", batch_id, "progress"])?;
        self.send_json(self.http.get(endpoint)).await
    }

    /// Uploads a file that already sits on the backend to remote storage.
    pub async fn upload_to_cloud_storage(
        &self,
        file_path: &str,
        options: &CloudUploadOptions,
    ) -> Result<CloudUploadResult, ClientError> {
        let connection = self.prober.detect_best_connection().await;
        let endpoint = api_url(&connection, &["cloudstorage", "upload"])?;
        let body = CloudUploadBody {
            file_path,
            custom_key: options.custom_key.as_deref(),
            make_public: options.make_public,
            retention_hours: options.retention_hours,
        };
        self.send_json(self.http.post(endpoint).json(&body)).await
    }

    pub async fn cloud_storage_status(&self) -> Result<Value, ClientError> {
        let connection = self.prober.detect_best_connection().await;
        let endpoint = api_url(&connection, &["cloudstorage", "status"])?;
        self.send_json(self.http.get(endpoint)).await
    }

    pub async fn delete_from_cloud_storage(&self, file_key: &str) -> Result<Value, ClientError> {
        if file_key.is_empty() {
            return Err(ClientError::Validation("Missing file key".to_string()));
        }
        let connection = self.prober.detect_best_connection().await;
        let endpoint = api_url(&connection, &["cloudstorage", "delete", file_key])?;
        self.send_json(self.http.delete(endpoint)).await
    }

    /// Liveness of the selected backend.
    pub async fn health(&self) -> Result<(), ClientError> {
        let connection = self.prober.detect_best_connection().await;
        let resp = self
            .http
            .get(format!("{}/health", connection.realtime_base_url))
            .send()
            .await?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let resp = ensure_success(request.send().await?).await?;
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| ClientError::UnexpectedContentType(e.to_string()))
    }
}

/// `{api_base}/seg/seg/...` with every segment percent-encoded.
fn completion_outcome(connection: &SelectedConnection, done: BatchCompletion) -> DownloadOutcome {
    if let Some(file_id) = done.file_id.filter(|id| !id.is_empty()) {
        match api_url(connection, &["download", file_id.as_str()]) {
            Ok(url) => DownloadOutcome::RemoteReference { public_url: url.to_string(), expiry: None },
            Err(e) => e.into_outcome(),
        }
    } else if let Some(link) = done.download_url.filter(|u| !u.is_empty()) {
        DownloadOutcome::RemoteReference { public_url: absolute_link(connection, link), expiry: None }
    } else {
        DownloadOutcome::Failure {
            kind: FailureKind::Server,
            message: done
                .message
                .unwrap_or_else(|| "Batch finished without a file".to_string()),
        }
    }
}

/// Outcome for a batch whose polled status is already final, if it is.
fn outcome_from_status(connection: &SelectedConnection, status: &PlaylistTaskStatus) -> Option<DownloadOutcome> {
    match status.status.as_str() {
        "completed" => {
            let link = status.download_url.clone().filter(|u| !u.is_empty())?;
            Some(DownloadOutcome::RemoteReference { public_url: absolute_link(connection, link), expiry: None })
        }
        "error" | "failed" => Some(DownloadOutcome::Failure {
            kind: FailureKind::Server,
            message: status
                .error
                .clone()
                .unwrap_or_else(|| "An unknown error occurred".to_string()),
        }),
        _ => None,
    }
}

fn absolute_link(connection: &SelectedConnection, link: String) -> String {
    if link.starts_with('/') {
        format!("{}{}", connection.realtime_base_url, link)
    } else {
        link
    }
}

fn api_url(connection: &SelectedConnection, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url = Url::parse(&connection.api_base_url)
        .map_err(|e| ClientError::Validation(format!("bad api base {}: {e}", connection.api_base_url)))?;
    url.path_segments_mut()
        .map_err(|_| ClientError::Validation(format!("bad api base {}", connection.api_base_url)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn backend_body(request: &DownloadRequest, direct_download: bool) -> BackendDownloadBody<'_> {
    BackendDownloadBody {
        url: &request.target_url,
        format: &request.desired_format,
        quality: &request.desired_quality,
        remove_watermark: request.options.strip_watermark,
        direct_download,
    }
}

async fn ensure_success(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Server {
        status: status.as_u16(),
        message: error_message(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
    })
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
}

/// Human-readable message from a backend JSON error body.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["detail", "message", "errorMessage"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .or_else(|| match value.get("error") {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(obj) => obj.get("message").and_then(Value::as_str),
            None => None,
        })
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// A JSON body where a file was expected.
fn failure_from_json(body: &str) -> ClientError {
    let reported_failure = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("success").and_then(Value::as_bool))
        == Some(false);
    match error_message(body) {
        Some(message) => ClientError::Rejected(message),
        None if reported_failure => ClientError::Rejected("Download failed".to_string()),
        None => ClientError::UnexpectedContentType("expected a media file but received JSON".to_string()),
    }
}

fn file_name_from_headers(headers: &HeaderMap) -> Option<String> {
    let disposition = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    disposition
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').trim().to_string())
        .filter(|name| !name.is_empty() && !name.contains(['/', '\\']))
}

fn fallback_file_name(platform: &str, format: &str) -> String {
    let extension: String = format.chars().filter(char::is_ascii_alphanumeric).collect();
    let extension = if extension.is_empty() { "mp4".to_string() } else { extension };
    format!("{}_{}.{}", platform, unix_millis() / 1000, extension)
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
