use std::time::Duration;

use pkgsweep::{PackageListing, PackageRef, RegistryApi, RegistryError, SortOrder};
use reqwest::header::{ACCEPT, RETRY_AFTER, USER_AGENT};
use tracing::warn;

use crate::listing::PackageResponse;

const DEFAULT_API_BASE: &str = "https://hex.pm/api";
const DEFAULT_REPO_BASE: &str = "https://repo.hex.pm";
const DEFAULT_USER_AGENT: &str = "pkgsweep";

/// Configuration for a Hex-style registry.
#[derive(Debug, Clone, Default)]
pub struct HexRegistryConfig {
    pub api_base_url: Option<String>,
    pub repo_base_url: Option<String>,
    pub user_agent: Option<String>,
}

/// Lists the catalog of a Hex-style package registry over HTTP.
pub struct HexRegistry {
    config: HexRegistryConfig,
    client: reqwest::Client,
}

impl HexRegistry {
    pub fn new(config: HexRegistryConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_base(&self) -> &str {
        self.config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
    }

    fn repo_base(&self) -> &str {
        self.config
            .repo_base_url
            .as_deref()
            .unwrap_or(DEFAULT_REPO_BASE)
            .trim_end_matches('/')
    }

    fn user_agent(&self) -> &str {
        self.config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Location of the release tarball for one package version.
    pub fn archive_url(&self, name: &str, version: &str) -> String {
        format!("{}/tarballs/{}-{}.tar", self.repo_base(), name, version)
    }

    fn page_url(&self, page: u32, sort: SortOrder) -> String {
        format!("{}/packages?page={}&sort={}", self.api_base(), page, sort.as_str())
    }

    fn to_listing(&self, response: PackageResponse) -> Option<PackageListing> {
        let Some(version) = response.selected_version().map(str::to_owned) else {
            warn!(package = %response.name, "listing has no published version, dropping");
            return None;
        };

        let package = PackageRef::new(response.name, version);
        if !package.is_path_safe() {
            warn!(package = %package, "listing name or version is not a plain path segment, dropping");
            return None;
        }

        let retired = response.retirements.contains_key(package.version());
        let url = self.archive_url(package.name(), package.version());

        let mut listing = PackageListing::new(package, url)
            .with_build_tools(response.meta.build_tools.unwrap_or_default())
            .retired(retired);
        listing.description = response.meta.description;
        Some(listing)
    }
}

/// Parse a `Retry-After` header given in seconds. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait::async_trait]
impl RegistryApi for HexRegistry {
    fn label(&self) -> &str {
        self.api_base()
    }

    async fn list_page(
        &self,
        page: u32,
        sort: SortOrder,
    ) -> Result<Vec<PackageListing>, RegistryError> {
        let url = self.page_url(page, sort);

        let response = self
            .client
            .get(&url)
            .header(USER_AGENT, self.user_agent())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| RegistryError::Network(format!("catalog request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(RegistryError::Throttled { retry_after });
        }
        if !status.is_success() {
            return Err(RegistryError::Http(status.as_u16()));
        }

        let body: Vec<PackageResponse> = response
            .json()
            .await
            .map_err(|e| RegistryError::Parse(format!("invalid catalog page {page}: {e}")))?;

        Ok(body
            .into_iter()
            .filter_map(|item| self.to_listing(item))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HexRegistry {
        HexRegistry::new(HexRegistryConfig {
            repo_base_url: Some("https://mirror.example/".into()),
            ..Default::default()
        })
    }

    #[test]
    fn archive_url_uses_repo_base() {
        assert_eq!(
            registry().archive_url("plug", "1.15.3"),
            "https://mirror.example/tarballs/plug-1.15.3.tar"
        );
    }

    #[test]
    fn page_url_carries_page_and_sort() {
        assert_eq!(
            registry().page_url(3, SortOrder::RecentDownloads),
            "https://hex.pm/api/packages?page=3&sort=recent_downloads"
        );
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
