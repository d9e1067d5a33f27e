// src/sponsor.rs

use crate::config::SponsorConfig;
use crate::models::ContentCategory;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// External effect fired on every gate click.
///
/// `trigger` must return immediately; any work happens in the background
/// and its failure never reaches the caller.
pub trait SponsorAction: Send + Sync {
    fn trigger(&self, category: ContentCategory);
}

/// Does nothing. For headless sessions and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSponsor;

impl SponsorAction for NoopSponsor {
    fn trigger(&self, category: ContentCategory) {
        debug!(category = category.as_str(), "sponsor action skipped");
    }
}

/// Lifecycle of one pop-under script load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Loaded,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadEvent {
    Start,
    Succeeded,
    Errored,
}

impl LoadState {
    /// One retry is allowed: a failure while `Loading` moves to
    /// `Retrying`, a failure while `Retrying` is final.
    pub fn next(self, event: LoadEvent) -> LoadState {
        match (self, event) {
            (LoadState::Idle, LoadEvent::Start) => LoadState::Loading,
            (LoadState::Loading | LoadState::Retrying, LoadEvent::Succeeded) => LoadState::Loaded,
            (LoadState::Loading, LoadEvent::Errored) => LoadState::Retrying,
            (LoadState::Retrying, LoadEvent::Errored) => LoadState::Failed,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Failed)
    }
}

/// Fetches a remote script, retrying once after a short pause.
pub struct ScriptLoader {
    client: Client,
    timeout: Duration,
    retry_delay: Duration,
    state: LoadState,
}

impl ScriptLoader {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            retry_delay: Duration::from_secs(1),
            state: LoadState::Idle,
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub async fn load(&mut self, url: &str) -> LoadState {
        self.state = self.state.next(LoadEvent::Start);
        while !self.state.is_terminal() {
            let event = match self.fetch(url).await {
                Ok(()) => LoadEvent::Succeeded,
                Err(e) => {
                    debug!(url, error = %e, state = ?self.state, "pop-under script load failed");
                    LoadEvent::Errored
                }
            };
            self.state = self.state.next(event);
            if self.state == LoadState::Retrying {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        self.state
    }

    async fn fetch(&self, url: &str) -> Result<(), reqwest::Error> {
        self.client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(())
    }
}

/// Requests the category's sponsor link and loads its pop-under script
/// in a background task.
#[derive(Clone)]
pub struct HttpSponsor {
    client: Client,
    targets: SponsorConfig,
    timeout: Duration,
}

impl HttpSponsor {
    pub fn new(targets: SponsorConfig) -> Self {
        Self {
            client: Client::new(),
            targets,
            timeout: Duration::from_secs(2),
        }
    }
}

impl SponsorAction for HttpSponsor {
    fn trigger(&self, category: ContentCategory) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no async runtime, sponsor action dropped");
                return;
            }
        };
        let target = self.targets.target(category).clone();
        let client = self.client.clone();
        let timeout = self.timeout;

        handle.spawn(async move {
            let direct = async {
                match client.get(&target.direct_url).timeout(timeout).send().await {
                    Ok(resp) if resp.status().is_success() => debug!(url = %target.direct_url, "sponsor link opened"),
                    Ok(resp) => warn!(url = %target.direct_url, status = resp.status().as_u16(), "sponsor link refused"),
                    Err(e) => warn!(url = %target.direct_url, error = %e, "sponsor link failed"),
                }
            };
            let pop_under = async {
                let mut loader = ScriptLoader::new(client.clone(), timeout);
                if loader.load(&target.pop_under_script).await == LoadState::Failed {
                    warn!(url = %target.pop_under_script, "pop-under script failed to load");
                }
            };
            tokio::join!(direct, pop_under);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_retry_then_failure() {
        let mut state = LoadState::Idle.next(LoadEvent::Start);
        assert_eq!(state, LoadState::Loading);
        state = state.next(LoadEvent::Errored);
        assert_eq!(state, LoadState::Retrying);
        state = state.next(LoadEvent::Errored);
        assert_eq!(state, LoadState::Failed);
        assert!(state.is_terminal());
    }

    #[test]
    fn retry_can_recover() {
        let state = LoadState::Loading.next(LoadEvent::Errored).next(LoadEvent::Succeeded);
        assert_eq!(state, LoadState::Loaded);
    }

    #[test]
    fn terminal_states_ignore_events() {
        assert_eq!(LoadState::Loaded.next(LoadEvent::Errored), LoadState::Loaded);
        assert_eq!(LoadState::Failed.next(LoadEvent::Start), LoadState::Failed);
    }

    #[tokio::test]
    async fn unreachable_script_ends_failed() {
        let mut loader = ScriptLoader::new(Client::new(), Duration::from_millis(200));
        loader.retry_delay = Duration::from_millis(10);
        let state = loader.load("http://127.0.0.1:9/missing.js").await;
        assert_eq!(state, LoadState::Failed);
        assert_eq!(loader.state(), LoadState::Failed);
    }

    #[test]
    fn trigger_without_runtime_is_harmless() {
        HttpSponsor::new(SponsorConfig::default()).trigger(ContentCategory::General);
    }
}
