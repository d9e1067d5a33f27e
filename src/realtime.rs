// src/realtime.rs

//! Progress hub: a SignalR (JSON protocol) connection over WebSocket that
//! fans batch events out to per-batch subscriptions.

use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// SignalR record terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const KEEP_ALIVE: Duration = Duration::from_secs(15);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("negotiate request failed: {0}")]
    Negotiate(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("cannot subscribe without a batch id")]
    EmptyBatchId,
    #[error("hub connection closed")]
    Closed,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BatchProgress {
    #[serde(default)]
    pub percentage: f32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchCompletion {
    pub download_url: Option<String>,
    #[serde(default)]
    pub success: bool,
    pub message: Option<String>,
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Progress(BatchProgress),
    Completed(BatchCompletion),
    Error(String),
}

impl BatchEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchEvent::Progress(_))
    }
}

/// One decoded hub record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Handshake { error: Option<String> },
    Invocation { target: String, arguments: Vec<Value> },
    Completion { invocation_id: String, error: Option<String> },
    Ping,
    Close { error: Option<String> },
}

pub fn handshake_frame() -> String {
    format!("{}{}", json!({ "protocol": "json", "version": 1 }), RECORD_SEPARATOR)
}

pub fn ping_frame() -> String {
    format!("{}{}", json!({ "type": 6 }), RECORD_SEPARATOR)
}

/// Invocation record; without an id the server sends no completion.
pub fn invocation_frame(invocation_id: Option<u64>, target: &str, arguments: Vec<Value>) -> String {
    let mut record = json!({ "type": 1, "target": target, "arguments": arguments });
    if let Some(id) = invocation_id {
        record["invocationId"] = Value::String(id.to_string());
    }
    format!("{}{}", record, RECORD_SEPARATOR)
}

/// Splits a text frame into records. Malformed records are skipped.
pub fn parse_frames(text: &str) -> Vec<HubMessage> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .filter_map(|record| match serde_json::from_str::<Value>(record) {
            Ok(value) => Some(decode_record(value)),
            Err(e) => {
                warn!(error = %e, "skipping malformed hub record");
                None
            }
        })
        .flatten()
        .collect()
}

fn decode_record(value: Value) -> Option<HubMessage> {
    let error = value.get("error").and_then(Value::as_str).map(str::to_string);
    match value.get("type").and_then(Value::as_u64) {
        None => Some(HubMessage::Handshake { error }),
        Some(1) => {
            let target = value.get("target")?.as_str()?.to_string();
            let arguments = value
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Some(HubMessage::Invocation { target, arguments })
        }
        Some(3) => Some(HubMessage::Completion {
            invocation_id: value
                .get("invocationId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            error,
        }),
        Some(6) => Some(HubMessage::Ping),
        Some(7) => Some(HubMessage::Close { error }),
        Some(_) => None,
    }
}

/// Maps a hub invocation onto the batch it belongs to.
pub fn decode_event(target: &str, arguments: &[Value]) -> Option<(String, BatchEvent)> {
    let batch_id = arguments.first()?.as_str()?.to_string();
    let payload = arguments.get(1).cloned().unwrap_or(Value::Null);
    let event = match target {
        "BatchProgressUpdate" => BatchEvent::Progress(serde_json::from_value(payload).unwrap_or_default()),
        "BatchCompleted" => BatchEvent::Completed(serde_json::from_value(payload).unwrap_or_default()),
        "BatchError" => BatchEvent::Error(
            payload
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or("An error occurred")
                .to_string(),
        ),
        _ => return None,
    };
    Some((batch_id, event))
}

type Listener = (u64, mpsc::UnboundedSender<BatchEvent>);

/// Per-batch listener table. Events are only ever delivered to listeners
/// of their own batch id. Each registration carries its own token so a
/// stale listener can only ever remove itself.
#[derive(Clone, Default)]
pub struct BatchRouter {
    listeners: Arc<Mutex<HashMap<String, Vec<Listener>>>>,
    next_token: Arc<AtomicU64>,
}

impl BatchRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener for `batch_id`. Returns its token and receiver.
    pub fn register(&self, batch_id: &str) -> (u64, mpsc::UnboundedReceiver<BatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.lock();
        let entry = listeners.entry(batch_id.to_string()).or_default();
        if !entry.is_empty() {
            debug!(batch_id, listeners = entry.len() + 1, "batch has several listeners");
        }
        entry.push((token, tx));
        (token, rx)
    }

    /// Delivers an event to every listener of the batch. A terminal event
    /// removes the batch; dead receivers are pruned. Returns whether anyone
    /// received it.
    pub fn dispatch(&self, batch_id: &str, event: BatchEvent) -> bool {
        let mut listeners = self.lock();
        let Some(entry) = listeners.get_mut(batch_id) else {
            debug!(batch_id, "event for unknown batch dropped");
            return false;
        };
        let terminal = event.is_terminal();
        entry.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        let delivered = !entry.is_empty();
        if terminal || !delivered {
            listeners.remove(batch_id);
        }
        delivered
    }

    /// Removes one listener. Other listeners of the same batch stay.
    pub fn remove(&self, batch_id: &str, token: u64) {
        let mut listeners = self.lock();
        if let Some(entry) = listeners.get_mut(batch_id) {
            entry.retain(|(t, _)| *t != token);
            if entry.is_empty() {
                listeners.remove(batch_id);
            }
        }
    }

    pub fn batch_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every listener. Their subscriptions end as `Disconnected`.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.iter().map(|(_, entry)| entry.len()).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Listener>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exponential reconnect delays: 1s, 2s, 4s, … capped at 10s per step,
/// abandoned once a minute has passed since the connection dropped.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub give_up_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            give_up_after: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, previous_attempts: u32, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.give_up_after {
            return None;
        }
        let factor = 2u32.saturating_pow(previous_attempts.min(16));
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// How a subscription ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEnd {
    Completed(BatchCompletion),
    Failed(String),
    TimedOut,
    Disconnected,
}

/// Listener for one batch. Dropping it unregisters the listener.
pub struct Subscription {
    batch_id: String,
    token: u64,
    events: mpsc::UnboundedReceiver<BatchEvent>,
    router: BatchRouter,
    timeout: Duration,
}

impl Subscription {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Next event, or `None` once the listener is gone.
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Feeds progress to `on_progress` until a terminal event arrives or
    /// the safety timeout expires.
    pub async fn wait_terminal<F>(mut self, mut on_progress: F) -> SubscriptionEnd
    where
        F: FnMut(&BatchProgress),
    {
        let timeout = self.timeout;
        let wait = async {
            while let Some(event) = self.events.recv().await {
                match event {
                    BatchEvent::Progress(progress) => on_progress(&progress),
                    BatchEvent::Completed(result) => return SubscriptionEnd::Completed(result),
                    BatchEvent::Error(message) => return SubscriptionEnd::Failed(message),
                }
            }
            SubscriptionEnd::Disconnected
        };
        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(end) => end,
            Err(_) => {
                warn!(batch_id = %self.batch_id, ?timeout, "batch subscription timed out");
                SubscriptionEnd::TimedOut
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.remove(&self.batch_id, self.token);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_token: Option<String>,
    connection_id: Option<String>,
}

#[derive(Clone)]
struct HubEndpoint {
    client: Client,
    base_url: String,
    hub_path: String,
}

impl HubEndpoint {
    async fn negotiate(&self) -> Result<Option<String>, HubError> {
        let url = format!("{}{}/negotiate?negotiateVersion=1", self.base_url, self.hub_path);
        let response: NegotiateResponse = self
            .client
            .post(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.connection_token.or(response.connection_id))
    }

    fn socket_url(&self, token: Option<&str>) -> Result<Url, HubError> {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(HubError::InvalidUrl(self.base_url.clone()));
        };
        let mut url = Url::parse(&format!("{}{}", base, self.hub_path))
            .map_err(|_| HubError::InvalidUrl(self.base_url.clone()))?;
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("id", token);
        }
        Ok(url)
    }

    /// Negotiate, open the socket and complete the protocol handshake.
    async fn establish(&self) -> Result<WsStream, HubError> {
        let token = self.negotiate().await?;
        let url = self.socket_url(token.as_deref())?;
        debug!(%url, "opening hub socket");
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        ws.send(Message::text(handshake_frame())).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
            .await
            .map_err(|_| HubError::Handshake("no handshake response".to_string()))?;
        match reply {
            Some(Ok(Message::Text(text))) => match parse_frames(text.as_str()).first() {
                Some(HubMessage::Handshake { error: None }) => Ok(ws),
                Some(HubMessage::Handshake { error: Some(e) }) => Err(HubError::Handshake(e.clone())),
                _ => Err(HubError::Handshake("unexpected first record".to_string())),
            },
            Some(Ok(_)) => Err(HubError::Handshake("non-text handshake response".to_string())),
            Some(Err(e)) => Err(e.into()),
            None => Err(HubError::Closed),
        }
    }
}

/// A live hub connection shared by every async download.
pub struct ProgressHub {
    router: BatchRouter,
    outgoing: mpsc::UnboundedSender<String>,
    next_invocation: AtomicU64,
    subscription_timeout: Duration,
    shutdown: CancellationToken,
}

impl ProgressHub {
    /// Connects to `{realtime_base_url}{hub_path}` and starts the reader task.
    pub async fn connect(
        realtime_base_url: &str,
        hub_path: &str,
        subscription_timeout: Duration,
    ) -> Result<Self, HubError> {
        Self::connect_with_policy(realtime_base_url, hub_path, subscription_timeout, ReconnectPolicy::default()).await
    }

    pub async fn connect_with_policy(
        realtime_base_url: &str,
        hub_path: &str,
        subscription_timeout: Duration,
        policy: ReconnectPolicy,
    ) -> Result<Self, HubError> {
        let endpoint = HubEndpoint {
            client: Client::new(),
            base_url: realtime_base_url.trim_end_matches('/').to_string(),
            hub_path: hub_path.to_string(),
        };
        let ws = endpoint.establish().await?;
        info!(base = %endpoint.base_url, hub = %endpoint.hub_path, "progress hub connected");

        let router = BatchRouter::new();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(run_connection(
            ws,
            endpoint,
            router.clone(),
            outgoing_rx,
            shutdown.clone(),
            policy,
        ));

        Ok(Self {
            router,
            outgoing,
            next_invocation: AtomicU64::new(1),
            subscription_timeout,
            shutdown,
        })
    }

    /// Joins the batch's group and returns its listener. An empty id is
    /// logged and rejected before anything is sent.
    pub fn subscribe(&self, batch_id: &str) -> Result<Subscription, HubError> {
        if batch_id.trim().is_empty() {
            warn!("refusing to join batch group without a batch id");
            return Err(HubError::EmptyBatchId);
        }
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let (token, events) = self.router.register(batch_id);
        let subscription = Subscription {
            batch_id: batch_id.to_string(),
            token,
            events,
            router: self.router.clone(),
            timeout: self.subscription_timeout,
        };

        let id = self.next_invocation.fetch_add(1, Ordering::SeqCst);
        let frame = invocation_frame(Some(id), "JoinBatchGroup", vec![Value::String(batch_id.to_string())]);
        if self.outgoing.send(frame).is_err() {
            return Err(HubError::Closed);
        }
        debug!(batch_id, "joined batch group");
        Ok(subscription)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.router.len()
    }

    /// True once the connection task has stopped, either by shutdown or
    /// because reconnection was abandoned. A closed hub never recovers.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outgoing.is_closed()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ProgressHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn dispatch_text(router: &BatchRouter, text: &str) -> bool {
    for message in parse_frames(text) {
        match message {
            HubMessage::Invocation { target, arguments } => match decode_event(&target, &arguments) {
                Some((batch_id, event)) => {
                    router.dispatch(&batch_id, event);
                }
                None => debug!(%target, "ignoring hub invocation"),
            },
            HubMessage::Completion { invocation_id, error: Some(e) } => {
                warn!(%invocation_id, error = %e, "hub invocation failed");
            }
            HubMessage::Close { error } => {
                info!(error = error.as_deref().unwrap_or(""), "hub closed the connection");
                return false;
            }
            _ => {}
        }
    }
    true
}

async fn run_connection(
    mut ws: WsStream,
    endpoint: HubEndpoint,
    router: BatchRouter,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    policy: ReconnectPolicy,
) {
    loop {
        let (mut sink, mut stream) = ws.split();
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE);

        let stopped = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break true;
                }
                frame = outgoing.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::text(frame)).await {
                            warn!(error = %e, "hub send failed");
                            break false;
                        }
                    }
                    None => break true,
                },
                _ = keep_alive.tick() => {
                    if sink.send(Message::text(ping_frame())).await.is_err() {
                        break false;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch_text(&router, text.as_str()) {
                            break false;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "hub read failed");
                        break false;
                    }
                },
            }
        };
        if stopped {
            debug!("progress hub stopped");
            return;
        }

        match reconnect(&endpoint, &policy, &shutdown).await {
            Some(mut fresh) => {
                let mut rejoined = 0;
                for batch_id in router.batch_ids() {
                    let frame = invocation_frame(None, "JoinBatchGroup", vec![Value::String(batch_id)]);
                    if fresh.send(Message::text(frame)).await.is_ok() {
                        rejoined += 1;
                    }
                }
                info!(rejoined, "progress hub reconnected");
                ws = fresh;
            }
            None => {
                error!("progress hub lost, giving up on reconnection");
                shutdown.cancel();
                let ended = router.close_all();
                debug!(ended, "subscriptions ended by lost hub");
                return;
            }
        }
    }
}

async fn reconnect(endpoint: &HubEndpoint, policy: &ReconnectPolicy, shutdown: &CancellationToken) -> Option<WsStream> {
    let started = Instant::now();
    let mut attempts = 0;
    while let Some(delay) = policy.next_delay(attempts, started.elapsed()) {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        attempts += 1;
        match endpoint.establish().await {
            Ok(ws) => return Some(ws),
            Err(e) => warn!(attempt = attempts, error = %e, "hub reconnect failed"),
        }
    }
    None
}
