// src/config.rs

use crate::models::{CandidateEndpoint, ContentCategory, EndpointKind};
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid candidate url {0}")]
    InvalidCandidate(String),
    #[error("no candidate endpoints configured")]
    NoCandidates,
    #[error("click threshold `{0}` must be greater than zero")]
    ZeroThreshold(&'static str),
}

/// Raw TOML file contents. Every field is optional and falls back to
/// the built-in defaults in [`ClientConfig::default`].
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub candidates: Option<Vec<CandidateEndpoint>>,
    pub probe_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub subscription_timeout_secs: Option<u64>,
    pub hub_path: Option<String>,
    pub api_prefix: Option<String>,
    pub state_db_path: Option<String>,
    pub monetization: Option<MonetizationFileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MonetizationFileConfig {
    pub general_clicks_required: Option<u32>,
    pub restricted_clicks_required: Option<u32>,
    pub conversion_clicks_required: Option<u32>,
    pub general_direct_url: Option<String>,
    pub restricted_direct_url: Option<String>,
    pub general_pop_under_script: Option<String>,
    pub restricted_pop_under_script: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }
}

/// Click thresholds per gate context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateThresholds {
    pub general: u32,
    pub restricted: u32,
    pub conversion: u32,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self { general: 3, restricted: 3, conversion: 2 }
    }
}

impl GateThresholds {
    /// Conversion actions use their own threshold regardless of category.
    pub fn required(&self, category: ContentCategory, is_conversion: bool) -> u32 {
        if is_conversion {
            return self.conversion;
        }
        match category {
            ContentCategory::Restricted => self.restricted,
            ContentCategory::General => self.general,
        }
    }
}

/// Sponsor link and pop-under script for one content category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SponsorTarget {
    pub direct_url: String,
    pub pop_under_script: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SponsorConfig {
    pub general: SponsorTarget,
    pub restricted: SponsorTarget,
}

impl SponsorConfig {
    pub fn target(&self, category: ContentCategory) -> &SponsorTarget {
        match category {
            ContentCategory::General => &self.general,
            ContentCategory::Restricted => &self.restricted,
        }
    }
}

impl Default for SponsorConfig {
    fn default() -> Self {
        Self {
            general: SponsorTarget {
                direct_url: "https://www.profitableratecpm.com/ez1aaw8g?key=51edc43e9af4ba16487654d5ad13b998".to_string(),
                pop_under_script: "https://pl27204121.profitableratecpm.com/d0/57/c2/d057c2967ef81828dc840400a9c2c6e6.js".to_string(),
            },
            restricted: SponsorTarget {
                direct_url: "https://www.profitableratecpm.com/dbr0v40ree?key=0e82932f1f8aea216d88b58a4d024b63".to_string(),
                pop_under_script: "https://pl27204234.profitableratecpm.com/a2/a2/85/a2a28507a6bd2463e79401e2b296cb2c.js".to_string(),
            },
        }
    }
}

/// Fully resolved client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub candidates: Vec<CandidateEndpoint>,
    pub probe_timeout: Duration,
    /// Ceiling for long media-processing calls.
    pub request_timeout: Duration,
    /// A progress subscription is dropped after this long without a terminal event.
    pub subscription_timeout: Duration,
    pub hub_path: String,
    pub api_prefix: String,
    pub state_db_path: PathBuf,
    pub thresholds: GateThresholds,
    pub sponsors: SponsorConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            candidates: vec![
                CandidateEndpoint::new("https://hathormodel.com", EndpointKind::PrimaryDomain),
                CandidateEndpoint::new("https://185.165.169.153:5001", EndpointKind::SecondaryHostSecure),
                CandidateEndpoint::new("http://185.165.169.153:5000", EndpointKind::SecondaryHostPlain),
            ],
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            subscription_timeout: Duration::from_secs(30 * 60),
            hub_path: "/hubs/downloads".to_string(),
            api_prefix: "/api".to_string(),
            state_db_path: PathBuf::from("mediagate.db"),
            thresholds: GateThresholds::default(),
            sponsors: SponsorConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Merge an optional file config over the defaults and validate the result.
    pub fn resolve(file_config: Option<FileConfig>) -> Result<Self, ConfigError> {
        let file = file_config.unwrap_or_default();
        let defaults = Self::default();

        let candidates = match file.candidates {
            Some(list) => list
                .into_iter()
                .map(|c| CandidateEndpoint::new(c.url, c.kind))
                .collect(),
            None => defaults.candidates,
        };

        let monetization = file.monetization.unwrap_or_default();
        let thresholds = GateThresholds {
            general: monetization.general_clicks_required.unwrap_or(defaults.thresholds.general),
            restricted: monetization
                .restricted_clicks_required
                .unwrap_or(defaults.thresholds.restricted),
            conversion: monetization
                .conversion_clicks_required
                .unwrap_or(defaults.thresholds.conversion),
        };

        let mut sponsors = defaults.sponsors;
        if let Some(url) = monetization.general_direct_url {
            sponsors.general.direct_url = url;
        }
        if let Some(url) = monetization.restricted_direct_url {
            sponsors.restricted.direct_url = url;
        }
        if let Some(script) = monetization.general_pop_under_script {
            sponsors.general.pop_under_script = script;
        }
        if let Some(script) = monetization.restricted_pop_under_script {
            sponsors.restricted.pop_under_script = script;
        }

        let config = Self {
            candidates,
            probe_timeout: file
                .probe_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_timeout),
            request_timeout: file
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            subscription_timeout: file
                .subscription_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.subscription_timeout),
            hub_path: file.hub_path.unwrap_or(defaults.hub_path),
            api_prefix: file.api_prefix.unwrap_or(defaults.api_prefix),
            state_db_path: file
                .state_db_path
                .map(PathBuf::from)
                .unwrap_or(defaults.state_db_path),
            thresholds,
            sponsors,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.candidates.is_empty() {
            return Err(ConfigError::NoCandidates);
        }
        for candidate in &self.candidates {
            Url::parse(&candidate.url)
                .map_err(|_| ConfigError::InvalidCandidate(candidate.url.clone()))?;
        }
        if self.thresholds.general == 0 {
            return Err(ConfigError::ZeroThreshold("general_clicks_required"));
        }
        if self.thresholds.restricted == 0 {
            return Err(ConfigError::ZeroThreshold("restricted_clicks_required"));
        }
        if self.thresholds.conversion == 0 {
            return Err(ConfigError::ZeroThreshold("conversion_clicks_required"));
        }
        Ok(())
    }

    /// Candidate list for tests and embedders that bypass the file config.
    pub fn with_candidates(mut self, candidates: Vec<CandidateEndpoint>) -> Self {
        self.candidates = candidates;
        self
    }
}
