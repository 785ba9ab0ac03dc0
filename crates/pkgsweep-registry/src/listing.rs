use std::collections::HashMap;

use serde::Deserialize;
use serde::de::IgnoredAny;

/// One element of the catalog response.
/// `GET {api}/packages?page={n}&sort={sort}`
#[derive(Debug, Deserialize)]
pub struct PackageResponse {
    pub name: String,
    #[serde(default)]
    pub latest_stable_version: Option<String>,
    #[serde(default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub meta: PackageMeta,
    /// Retired releases, keyed by version. Only the keys matter.
    #[serde(default)]
    pub retirements: HashMap<String, IgnoredAny>,
}

impl PackageResponse {
    /// The release to process: latest stable, falling back to latest.
    pub fn selected_version(&self) -> Option<&str> {
        self.latest_stable_version
            .as_deref()
            .or(self.latest_version.as_deref())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PackageMeta {
    #[serde(default)]
    pub build_tools: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
}
