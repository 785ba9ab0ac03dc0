use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Contents of `config.toml`. Every key is optional; command-line flags win.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub batch: BatchSection,
    pub registry: RegistrySection,
    pub analyzer: AnalyzerSection,
}

/// The `[batch]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSection {
    pub output_dir: Option<PathBuf>,
    pub temp_root: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub limit: Option<usize>,
    pub start_page: Option<u32>,
    pub api_delay_ms: Option<u64>,
    pub download_delay_ms: Option<u64>,
    pub item_timeout_secs: Option<u64>,
    pub resume: Option<bool>,
    pub force: Option<bool>,
    pub sort: Option<String>,
    pub checkpoint_every: Option<usize>,
    pub max_attempts: Option<u32>,
    pub max_list_attempts: Option<u32>,
    pub throttle_backoff_ms: Option<u64>,
    pub min_free_bytes: Option<u64>,
    pub max_uncompressed_bytes: Option<u64>,
    pub required_build_tools: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub skip_retired: Option<bool>,
    pub source_extensions: Option<Vec<String>>,
}

/// The `[registry]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySection {
    pub api_url: Option<String>,
    pub repo_url: Option<String>,
    pub user_agent: Option<String>,
}

/// The `[analyzer]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerSection {
    pub command: Option<String>,
    pub args: Vec<String>,
}

/// Config file path: `~/.config/pkgsweep/config.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pkgsweep").join("config.toml"))
}

/// Load the config file.
///
/// An explicit path must exist. The default location is optional and yields
/// an empty config when absent. A file that fails to parse is always an error.
pub fn load_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) if path.is_file() => path,
            _ => return Ok(FileConfig::default()),
        },
    };

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("failed to parse config at {}", path.display()))
}

fn parse_config(contents: &str) -> Result<FileConfig> {
    Ok(toml::from_str(contents)?)
}
