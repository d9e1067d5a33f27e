//! Connection selection against live local servers.

mod common;

use common::{InlineReply, MockBackend};
use mediagate::prelude::*;
use std::time::Duration;

fn config_for(candidates: Vec<CandidateEndpoint>) -> ClientConfig {
    let mut config = ClientConfig::default().with_candidates(candidates);
    config.probe_timeout = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn healthy_secondary_wins_over_unhealthy_primary() {
    let unhealthy = MockBackend::spawn_unhealthy().await;
    let healthy = MockBackend::spawn(InlineReply::File(Vec::new())).await;

    let config = config_for(vec![
        CandidateEndpoint::new(unhealthy.base_url.clone(), EndpointKind::PrimaryDomain),
        CandidateEndpoint::new(healthy.base_url.clone(), EndpointKind::SecondaryHostSecure),
        CandidateEndpoint::new("http://127.0.0.1:1", EndpointKind::SecondaryHostPlain),
    ]);
    let prober = ConnectionProber::new(&config).unwrap();

    let selected = prober.detect_best_connection().await;
    assert_eq!(selected.api_base_url, format!("{}/api", healthy.base_url));
    assert_eq!(selected.realtime_base_url, healthy.base_url);
    assert!(!selected.selection_reason.is_fallback());

    // Cached: no further health checks.
    let hits = healthy.hits();
    prober.detect_best_connection().await;
    assert_eq!(healthy.hits(), hits);
}

#[tokio::test]
async fn nothing_healthy_falls_back_to_first() {
    let unhealthy = MockBackend::spawn_unhealthy().await;
    let config = config_for(vec![
        CandidateEndpoint::new(unhealthy.base_url.clone(), EndpointKind::PrimaryDomain),
        CandidateEndpoint::new("http://127.0.0.1:1", EndpointKind::SecondaryHostPlain),
    ]);
    let prober = ConnectionProber::new(&config).unwrap();

    let selected = prober.detect_best_connection().await;
    assert!(selected.selection_reason.is_fallback());
    assert_eq!(selected.realtime_base_url, unhealthy.base_url);
}
