//! Per-site profiles: navigation wait strategy, settle time, extra prompt
//! context and extra candidate locators.
//!
//! The catalog is a plain lookup table loaded from configuration. Nothing in
//! the loop depends on a particular site being present.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::driver::WaitStrategy;

/// Extra selectors for elements whose label contains `keyword`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogLocator {
    pub keyword: String,
    pub selectors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteProfile {
    /// Host suffix, e.g. `amazon.com` also matches `www.amazon.com`.
    pub host: String,
    #[serde(default)]
    pub wait: WaitStrategy,
    #[serde(default)]
    pub settle_ms: Option<u64>,
    /// Hint appended to the reasoning prompt on matching pages.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub locators: Vec<CatalogLocator>,
}

impl SiteProfile {
    fn matches_host(&self, host: &str) -> bool {
        let want = self.host.trim().trim_start_matches('.').to_ascii_lowercase();
        if want.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        host == want || host.ends_with(&format!(".{want}"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SiteCatalog {
    profiles: Vec<SiteProfile>,
}

impl SiteCatalog {
    pub fn new(profiles: Vec<SiteProfile>) -> Self {
        Self { profiles }
    }

    /// First profile whose host matches `url`. Most specific entries should come first.
    pub fn profile_for(&self, url: &str) -> Option<&SiteProfile> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        self.profiles.iter().find(|p| p.matches_host(host))
    }

    pub fn wait_strategy(&self, url: &str) -> WaitStrategy {
        self.profile_for(url).map(|p| p.wait).unwrap_or_default()
    }

    pub fn settle(&self, url: &str, default: Duration) -> Duration {
        self.profile_for(url)
            .and_then(|p| p.settle_ms)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    pub fn context(&self, url: &str) -> Option<&str> {
        self.profile_for(url).and_then(|p| p.context.as_deref())
    }

    /// Catalog selectors for an element labelled `label` on `url`.
    pub fn extra_locators(&self, url: &str, label: &str) -> Vec<String> {
        let Some(profile) = self.profile_for(url) else {
            return Vec::new();
        };
        let label = label.to_lowercase();
        if label.is_empty() {
            return Vec::new();
        }
        profile
            .locators
            .iter()
            .filter(|l| label.contains(&l.keyword.to_lowercase()))
            .flat_map(|l| l.selectors.iter().cloned())
            .collect()
    }
}

/// Adds `https://` when the URL has no scheme.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
        || trimmed.starts_with("about:")
        || trimmed.starts_with("file://")
        || trimmed.starts_with("data:")
    {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}
