pub mod config;
pub mod downloader;
pub mod gate;
pub mod models;
pub mod platform;
pub mod prober;
pub mod realtime;
pub mod sponsor;
pub mod state_manager;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{ClientConfig, FileConfig, GateThresholds, SponsorConfig};
    pub use crate::downloader::{ClientError, CloudUploadOptions, DownloadClient};
    pub use crate::gate::{ClickOutcome, Guarded, MonetizationGate};
    pub use crate::models::{
        CandidateEndpoint, ContentCategory, DownloadOutcome, DownloadRequest, EndpointKind, FailureKind, Progress,
        SelectedConnection,
    };
    pub use crate::prober::ConnectionProber;
    pub use crate::realtime::{ProgressHub, ReconnectPolicy, SubscriptionEnd};
    pub use crate::sponsor::{HttpSponsor, NoopSponsor, SponsorAction};
    pub use crate::state_manager::{GateStore, MemoryGateStore, SqliteGateStore};
}
