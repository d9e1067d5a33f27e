// src/prober.rs

use crate::config::{ClientConfig, ConfigError};
use crate::models::{CandidateEndpoint, ProbeResult, SelectedConnection, SelectionReason};
use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A single liveness check against one candidate backend.
///
/// Implementations must capture failures in the returned [`ProbeResult`]
/// instead of surfacing them.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, endpoint: &CandidateEndpoint) -> ProbeResult;
}

/// `GET {base}/health` with a short timeout.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    client: Client,
    timeout: Duration,
}

impl HttpHealthCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { client: Client::new(), timeout }
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, endpoint: &CandidateEndpoint) -> ProbeResult {
        let started = Instant::now();
        let result = self
            .client
            .get(format!("{}/health", endpoint.url))
            .timeout(self.timeout)
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match result {
            Ok(resp) if resp.status().is_success() => None,
            Ok(resp) => Some(format!("HTTP {}", resp.status().as_u16())),
            Err(e) if e.is_timeout() => Some(format!("timed out after {:?}", self.timeout)),
            Err(e) => Some(e.to_string()),
        };

        ProbeResult {
            endpoint: endpoint.clone(),
            success: error.is_none(),
            latency_ms,
            error,
        }
    }
}

/// Picks the best responding candidate: successful ones only, lowest
/// kind priority first, then lowest latency. Earlier entries win exact ties.
pub fn select_best(results: &[ProbeResult]) -> Option<&ProbeResult> {
    results
        .iter()
        .filter(|r| r.success)
        .min_by_key(|r| (r.endpoint.kind.priority(), r.latency_ms))
}

/// Chooses, once per session, which backend the rest of the client talks to.
pub struct ConnectionProber {
    candidates: Vec<CandidateEndpoint>,
    api_prefix: String,
    health: Arc<dyn HealthCheck>,
    // Held for the whole probe round so concurrent callers wait for it
    // instead of starting their own.
    selected: Mutex<Option<SelectedConnection>>,
}

impl ConnectionProber {
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        Self::with_health_check(
            config.candidates.clone(),
            config.api_prefix.clone(),
            Arc::new(HttpHealthCheck::new(config.probe_timeout)),
        )
    }

    pub fn with_health_check(
        candidates: Vec<CandidateEndpoint>,
        api_prefix: String,
        health: Arc<dyn HealthCheck>,
    ) -> Result<Self, ConfigError> {
        if candidates.is_empty() {
            return Err(ConfigError::NoCandidates);
        }
        Ok(Self {
            candidates,
            api_prefix,
            health,
            selected: Mutex::new(None),
        })
    }

    /// Returns the cached selection, or probes every candidate and caches
    /// the winner. Never fails: with no healthy candidate the first one is
    /// returned tagged [`SelectionReason::Fallback`].
    pub async fn detect_best_connection(&self) -> SelectedConnection {
        let mut selected = self.selected.lock().await;
        if let Some(connection) = selected.as_ref() {
            debug!(api = %connection.api_base_url, "using cached connection");
            return connection.clone();
        }
        let connection = self.probe_round().await;
        *selected = Some(connection.clone());
        connection
    }

    /// Drops the cached selection and runs a full probe round.
    pub async fn force_redetection(&self) -> SelectedConnection {
        info!("forcing connection re-detection");
        let mut selected = self.selected.lock().await;
        *selected = None;
        let connection = self.probe_round().await;
        *selected = Some(connection.clone());
        connection
    }

    /// The cached selection, if one exists and no probe round is running.
    pub fn current(&self) -> Option<SelectedConnection> {
        self.selected.try_lock().ok().and_then(|s| s.clone())
    }

    async fn probe_round(&self) -> SelectedConnection {
        info!(candidates = self.candidates.len(), "starting connection detection");
        let results = join_all(self.candidates.iter().map(|c| self.health.check(c))).await;

        for result in &results {
            if result.success {
                debug!(url = %result.endpoint.url, kind = %result.endpoint.kind, latency_ms = result.latency_ms, "candidate healthy");
            } else {
                debug!(
                    url = %result.endpoint.url,
                    kind = %result.endpoint.kind,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "candidate failed"
                );
            }
        }

        match select_best(&results) {
            Some(best) => {
                info!(url = %best.endpoint.url, kind = %best.endpoint.kind, latency_ms = best.latency_ms, "selected connection");
                self.connection_for(&best.endpoint, SelectionReason::Probed(best.endpoint.kind))
            }
            None => {
                let fallback = &self.candidates[0];
                warn!(url = %fallback.url, "no candidate answered, falling back to first configured");
                self.connection_for(fallback, SelectionReason::Fallback)
            }
        }
    }

    fn connection_for(&self, endpoint: &CandidateEndpoint, reason: SelectionReason) -> SelectedConnection {
        SelectedConnection {
            api_base_url: format!("{}{}", endpoint.url, self.api_prefix),
            realtime_base_url: endpoint.url.clone(),
            selection_reason: reason,
        }
    }
}
