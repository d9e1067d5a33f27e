// src/gate.rs

use crate::config::GateThresholds;
use crate::models::{ContentCategory, MonetizationState};
use crate::sponsor::SponsorAction;
use crate::state_manager::{GateStore, PersistedGate};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of one `register_click` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickOutcome {
    pub state: MonetizationState,
    /// The guarded action may run now.
    pub proceed: bool,
}

/// What happened to a guarded action.
#[derive(Debug)]
pub enum Guarded<T> {
    /// More clicks are needed before the action runs.
    Pending { clicks_left: u32 },
    /// The gate opened and the action ran with this result.
    Ran(T),
}

/// Counts clicks on a guarded button until the threshold for its
/// (category, conversion) context is reached.
///
/// State is persisted after every change so a restarted session resumes
/// where it left off.
pub struct MonetizationGate {
    store: Arc<dyn GateStore>,
    sponsor: Arc<dyn SponsorAction>,
    thresholds: GateThresholds,
    state: Mutex<Option<MonetizationState>>,
}

impl MonetizationGate {
    /// Builds a gate, resuming whatever the store holds. An unreadable
    /// store is logged and treated as empty.
    pub async fn open(
        store: Arc<dyn GateStore>,
        sponsor: Arc<dyn SponsorAction>,
        thresholds: GateThresholds,
    ) -> Self {
        let restored = match store.load().await {
            Ok(Some(saved)) => {
                let state = MonetizationState {
                    clicks_so_far: saved.click_count,
                    clicks_required: thresholds.required(saved.category, saved.is_conversion),
                    category: saved.category,
                    is_conversion_action: saved.is_conversion,
                    is_complete: saved.is_complete,
                };
                debug!(clicks = state.clicks_so_far, category = state.category.as_str(), "restored gate state");
                Some(state)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to load gate state, starting fresh");
                None
            }
        };
        Self {
            store,
            sponsor,
            thresholds,
            state: Mutex::new(restored),
        }
    }

    pub fn clicks_required(&self, category: ContentCategory, is_conversion: bool) -> u32 {
        self.thresholds.required(category, is_conversion)
    }

    /// Counts one click for the given context and fires the sponsor action.
    ///
    /// A different context than the stored one restarts the count at 1.
    /// The call that reaches the threshold returns `proceed = true`. Once
    /// complete, further clicks in the same context pass straight through
    /// without counting until `reset_after_success`.
    pub async fn register_click(&self, category: ContentCategory, is_conversion: bool) -> ClickOutcome {
        let mut guard = self.state.lock().await;
        let clicks_required = self.thresholds.required(category, is_conversion);

        let clicks_so_far = match *guard {
            Some(s) if s.category == category && s.is_conversion_action == is_conversion => {
                if s.is_complete {
                    return ClickOutcome { state: s, proceed: true };
                }
                s.clicks_so_far + 1
            }
            Some(s) => {
                info!(
                    from = s.category.as_str(),
                    to = category.as_str(),
                    is_conversion,
                    "gate context changed, restarting count"
                );
                1
            }
            None => 1,
        };

        let state = MonetizationState {
            clicks_so_far,
            clicks_required,
            category,
            is_conversion_action: is_conversion,
            is_complete: clicks_so_far >= clicks_required,
        };
        *guard = Some(state);

        self.sponsor.trigger(category);
        self.persist(&state).await;

        debug!(clicks = clicks_so_far, required = clicks_required, complete = state.is_complete, "gate click");
        ClickOutcome { state, proceed: state.is_complete }
    }

    /// Call once the guarded action succeeded. The context is kept, so the
    /// next interaction needs the full threshold again.
    pub async fn reset_after_success(&self) {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            state.clicks_so_far = 0;
            state.is_complete = false;
            let state = *state;
            self.persist(&state).await;
        }
    }

    /// Forgets all progress, in memory and in the store.
    pub async fn clear(&self) {
        let mut guard = self.state.lock().await;
        *guard = None;
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear gate state");
        }
    }

    pub async fn snapshot(&self) -> Option<MonetizationState> {
        *self.state.lock().await
    }

    /// Clicks still needed before an action in this context may run.
    pub async fn clicks_left(&self, category: ContentCategory, is_conversion: bool) -> u32 {
        match *self.state.lock().await {
            Some(s) if s.category == category && s.is_conversion_action == is_conversion => s.clicks_left(),
            _ => self.thresholds.required(category, is_conversion),
        }
    }

    /// Button text such as `Download (2 clicks left)`.
    pub async fn button_label(&self, category: ContentCategory, is_conversion: bool, original: &str) -> String {
        match self.clicks_left(category, is_conversion).await {
            0 => original.to_string(),
            1 => format!("{original} (1 click left)"),
            n => format!("{original} ({n} clicks left)"),
        }
    }

    /// Registers a click and runs `action` only when that click opens the
    /// gate. A successful action resets the count.
    pub async fn guard<F, Fut, T, E>(
        &self,
        category: ContentCategory,
        is_conversion: bool,
        action: F,
    ) -> Guarded<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = self.register_click(category, is_conversion).await;
        if !outcome.proceed {
            return Guarded::Pending { clicks_left: outcome.state.clicks_left() };
        }
        let result = action().await;
        if result.is_ok() {
            self.reset_after_success().await;
        }
        Guarded::Ran(result)
    }

    async fn persist(&self, state: &MonetizationState) {
        let saved = PersistedGate {
            click_count: state.clicks_so_far,
            is_complete: state.is_complete,
            category: state.category,
            is_conversion: state.is_conversion_action,
        };
        if let Err(e) = self.store.save(&saved).await {
            warn!(error = %e, "failed to persist gate state");
        }
    }
}
