// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a candidate backend is reached. Variants are declared in
/// selection priority order: an earlier kind wins over a later one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    PrimaryDomain,
    SecondaryHostSecure,
    SecondaryHostPlain,
}

impl EndpointKind {
    /// Lower rank is preferred.
    pub fn priority(&self) -> u8 {
        match self {
            EndpointKind::PrimaryDomain => 0,
            EndpointKind::SecondaryHostSecure => 1,
            EndpointKind::SecondaryHostPlain => 2,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointKind::PrimaryDomain => "primary-domain",
            EndpointKind::SecondaryHostSecure => "secondary-host-secure",
            EndpointKind::SecondaryHostPlain => "secondary-host-plain",
        };
        f.write_str(name)
    }
}

/// A backend base URL that may be probed. Fixed for the whole session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateEndpoint {
    pub url: String,
    pub kind: EndpointKind,
}

impl CandidateEndpoint {
    pub fn new(url: impl Into<String>, kind: EndpointKind) -> Self {
        Self { url: url.into().trim_end_matches('/').to_string(), kind }
    }
}

/// Outcome of one health request against one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub endpoint: CandidateEndpoint,
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Why a connection was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// A candidate of this kind answered its health check.
    Probed(EndpointKind),
    /// Nothing answered; the first configured candidate was taken blindly.
    Fallback,
}

impl SelectionReason {
    pub fn is_fallback(&self) -> bool {
        matches!(self, SelectionReason::Fallback)
    }
}

/// The backend chosen for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedConnection {
    pub api_base_url: String,
    pub realtime_base_url: String,
    pub selection_reason: SelectionReason,
}

/// Content category of the page a guarded button lives on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Restricted,
    General,
}

impl ContentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::Restricted => "restricted",
            ContentCategory::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "restricted" | "adult" => Some(ContentCategory::Restricted),
            "general" | "regular" => Some(ContentCategory::General),
            _ => None,
        }
    }
}

/// Click-gate progress for the current (category, conversion) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonetizationState {
    pub clicks_so_far: u32,
    pub clicks_required: u32,
    pub category: ContentCategory,
    pub is_conversion_action: bool,
    pub is_complete: bool,
}

impl MonetizationState {
    pub fn clicks_left(&self) -> u32 {
        self.clicks_required.saturating_sub(self.clicks_so_far)
    }
}

/// Per-request switches picked by the user on the page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadOptions {
    pub strip_watermark: bool,
    /// Response body is the media file itself.
    pub wants_inline_file: bool,
    /// Backend uploads the file and answers with a public link.
    pub wants_remote_storage: bool,
}

/// One user submission from a downloader page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRequest {
    pub target_url: String,
    pub desired_format: String,
    pub desired_quality: String,
    pub options: DownloadOptions,
}

impl DownloadRequest {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            desired_format: "mp4".to_string(),
            desired_quality: "best".to_string(),
            options: DownloadOptions::default(),
        }
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.desired_format = format.into();
        self
    }

    pub fn quality(mut self, quality: impl Into<String>) -> Self {
        self.desired_quality = quality.into();
        self
    }

    pub fn inline_file(mut self) -> Self {
        self.options.wants_inline_file = true;
        self
    }

    pub fn remote_storage(mut self) -> Self {
        self.options.wants_remote_storage = true;
        self
    }

    pub fn strip_watermark(mut self) -> Self {
        self.options.strip_watermark = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Network,
    Server,
    UnexpectedContentType,
    Timeout,
}

/// Terminal result of a download call.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    BinaryPayload { bytes: Vec<u8>, suggested_file_name: String },
    RemoteReference { public_url: String, expiry: Option<String> },
    AsyncHandle { progress_channel_id: String },
    Failure { kind: FailureKind, message: String },
}

impl DownloadOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DownloadOutcome::Failure { .. })
    }
}

/// Progress reported while a download is running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Fraction in range 0.0..=1.0.
    Fraction(f32),
    /// The backend did not declare a size.
    Indeterminate,
}

// --- Backend wire types ---

/// Body of single-item and playlist download requests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackendDownloadBody<'a> {
    pub url: &'a str,
    pub format: &'a str,
    pub quality: &'a str,
    pub remove_watermark: bool,
    pub direct_download: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDownloadBody<'a> {
    pub video_url: &'a str,
    pub format: &'a str,
    pub quality: &'a str,
    pub custom_file_name: String,
    pub make_public: bool,
    pub retention_hours: u32,
}

/// Multi-item post expansion request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MediaItemsBody<'a> {
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instagram_cookies: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistDownloadBody<'a> {
    pub urls: Vec<&'a str>,
    pub format: &'a str,
    pub quality: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudUploadBody<'a> {
    pub file_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_key: Option<&'a str>,
    pub make_public: bool,
    pub retention_hours: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAccepted {
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudUploadResult {
    #[serde(default)]
    pub success: bool,
    pub public_url: Option<String>,
    pub file_key: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub expiration_time: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlaylistTaskStatus {
    pub task_id: String,
    pub status: String,
    pub progress: f32,
    pub completed_items: u32,
    pub total_items: u32,
    pub current_item: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistItem {
    pub url: String,
    pub format: String,
    pub quality: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_priority_follows_declaration_order() {
        let mut kinds = vec![
            EndpointKind::SecondaryHostPlain,
            EndpointKind::PrimaryDomain,
            EndpointKind::SecondaryHostSecure,
        ];
        kinds.sort_by_key(|k| k.priority());
        assert_eq!(
            kinds,
            vec![
                EndpointKind::PrimaryDomain,
                EndpointKind::SecondaryHostSecure,
                EndpointKind::SecondaryHostPlain
            ]
        );
    }

    #[test]
    fn candidate_url_drops_trailing_slash() {
        let c = CandidateEndpoint::new("https://example.com/", EndpointKind::PrimaryDomain);
        assert_eq!(c.url, "https://example.com");
    }

    #[test]
    fn category_accepts_legacy_names() {
        assert_eq!(ContentCategory::parse("adult"), Some(ContentCategory::Restricted));
        assert_eq!(ContentCategory::parse("regular"), Some(ContentCategory::General));
        assert_eq!(ContentCategory::parse("other"), None);
    }

    #[test]
    fn download_body_uses_pascal_case() {
        let body = BackendDownloadBody {
            url: "https://youtu.be/x",
            format: "mp4",
            quality: "best",
            remove_watermark: false,
            direct_download: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Url"], "https://youtu.be/x");
        assert_eq!(json["DirectDownload"], true);
    }
}
