// src/platform.rs

//! Registry of downloader pages and the source domains each one accepts.

use crate::models::ContentCategory;
use crate::models::ContentCategory::{General, Restricted};
use reqwest::Url;

/// A downloader page: its route, the backend platform id it maps to,
/// and the source domains it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub route: &'static str,
    pub platform: &'static str,
    pub domains: &'static [&'static str],
    pub category: ContentCategory,
}

const fn page(
    route: &'static str,
    platform: &'static str,
    domains: &'static [&'static str],
    category: ContentCategory,
) -> Page {
    Page { route, platform, domains, category }
}

pub const PAGES: &[Page] = &[
    page("youtube-downloader", "youtube", &["youtube.com", "youtu.be"], General),
    page("tiktok-downloader", "tiktok", &["tiktok.com"], General),
    page("instagram-downloader", "instagram", &["instagram.com"], General),
    page("twitter-downloader", "twitter", &["twitter.com", "x.com"], General),
    page("vimeo-downloader", "vimeo", &["vimeo.com"], General),
    page("facebook-downloader", "facebook", &["facebook.com", "fb.watch"], General),
    page("twitch-downloader", "twitch", &["twitch.tv"], General),
    page("reddit-downloader", "reddit", &["reddit.com"], General),
    page("pornhub-downloader", "pornhub", &["pornhub.com", "phncdn.com"], Restricted),
    page("xvideos-downloader", "xvideos", &["xvideos.com"], Restricted),
    page(
        "xhamster-downloader",
        "xhamster",
        &["xhamster.com", "xhamster.desi", "xhamster.one", "xhamster2.com"],
        Restricted,
    ),
    page("redgifs-downloader", "redgifs", &["redgifs.com", "redgifs.io"], Restricted),
    page("youporn-downloader", "youporn", &["youporn.com", "youporn2.com"], Restricted),
    page("spankbang-downloader", "spankbang", &["spankbang.com", "spankbang.party"], Restricted),
];

/// Look a page up by route. A leading `/` is ignored.
pub fn page_for_route(route: &str) -> Option<&'static Page> {
    let route = route.trim_start_matches('/');
    PAGES.iter().find(|p| p.route == route)
}

pub fn page_for_platform(platform: &str) -> Option<&'static Page> {
    let platform = platform.to_ascii_lowercase();
    PAGES.iter().find(|p| p.platform == platform)
}

/// Unknown platforms are treated as general content.
pub fn category_for_platform(platform: &str) -> ContentCategory {
    page_for_platform(platform)
        .map(|p| p.category)
        .unwrap_or(ContentCategory::General)
}

fn parse_source(url: &str) -> Option<Url> {
    let url = url.trim();
    if url.is_empty() || !url.contains('.') {
        return None;
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        Url::parse(url).ok()
    } else {
        Url::parse(&format!("https://{url}")).ok()
    }
}

/// Resolve which page serves a source URL, matching hostname suffixes
/// from the longest down (`m.youtube.com`, then `youtube.com`).
pub fn service_for_url(url: &str) -> Option<(&'static Page, &'static str)> {
    let parsed = parse_source(url)?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    for start in 0..labels.len().saturating_sub(1) {
        let candidate = labels[start..].join(".");
        for page in PAGES {
            if let Some(domain) = page.domains.iter().find(|d| **d == candidate) {
                return Some((page, *domain));
            }
        }
    }
    None
}

impl Page {
    /// True when `url` belongs to one of this page's source domains.
    pub fn accepts(&self, url: &str) -> bool {
        matches!(service_for_url(url), Some((page, _)) if page.route == self.route)
    }
}

/// Extract a YouTube playlist id from a `list=` query parameter.
pub fn detect_playlist(url: &str) -> Option<String> {
    let parsed = parse_source(url)?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "list")
        .map(|(_, v)| v.into_owned())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_subdomains() {
        let (page, domain) = service_for_url("https://www.youtube.com/watch?v=abc123").unwrap();
        assert_eq!(page.platform, "youtube");
        assert_eq!(domain, "youtube.com");

        let (page, _) = service_for_url("m.facebook.com/watch/123").unwrap();
        assert_eq!(page.platform, "facebook");
    }

    #[test]
    fn rejects_lookalike_hosts() {
        assert!(service_for_url("https://notyoutube.com/watch").is_none());
        assert!(service_for_url("https://youtube.com.evil.test/watch").is_none());
        assert!(service_for_url("no dots here").is_none());
        assert!(service_for_url("").is_none());
    }

    #[test]
    fn page_accepts_only_its_own_sources() {
        let youtube = page_for_route("/youtube-downloader").unwrap();
        assert!(youtube.accepts("https://youtu.be/abc"));
        assert!(!youtube.accepts("https://vimeo.com/123"));
        assert!(!youtube.accepts("not a url"));
    }

    #[test]
    fn categories() {
        assert_eq!(category_for_platform("XVideos"), ContentCategory::Restricted);
        assert_eq!(category_for_platform("reddit"), ContentCategory::General);
        assert_eq!(category_for_platform("unknown"), ContentCategory::General);
    }

    #[test]
    fn playlist_detection() {
        assert_eq!(
            detect_playlist("https://www.youtube.com/watch?v=x&list=PL_abc-1").as_deref(),
            Some("PL_abc-1")
        );
        assert_eq!(detect_playlist("https://www.youtube.com/watch?v=x"), None);
    }
}
