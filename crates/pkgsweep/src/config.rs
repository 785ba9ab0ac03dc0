use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while validating a [`BatchConfig`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("output directory must not be empty")]
    EmptyOutputDir,

    #[error("temp root must not be empty")]
    EmptyTempRoot,

    #[error("temp root must differ from the output directory: {0}")]
    TempRootIsOutput(PathBuf),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid source extension {0:?}: use bare extensions such as \"ex\"")]
    InvalidExtension(String),

    #[error("unknown sort order: {0}")]
    UnknownSort(String),
}

/// Order in which the registry catalog is traversed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Name,
    InsertedAt,
    UpdatedAt,
    TotalDownloads,
    RecentDownloads,
}

impl SortOrder {
    /// Query-string value understood by the registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::InsertedAt => "inserted_at",
            Self::UpdatedAt => "updated_at",
            Self::TotalDownloads => "total_downloads",
            Self::RecentDownloads => "recent_downloads",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "inserted_at" | "inserted" => Ok(Self::InsertedAt),
            "updated_at" | "updated" => Ok(Self::UpdatedAt),
            "total_downloads" | "downloads" => Ok(Self::TotalDownloads),
            "recent_downloads" | "recent" => Ok(Self::RecentDownloads),
            other => Err(ConfigError::UnknownSort(other.to_owned())),
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_CHECKPOINT_EVERY: usize = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_LIST_ATTEMPTS: u32 = 5;
const DEFAULT_MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_MAX_UNCOMPRESSED_BYTES: u64 = 512 * 1024 * 1024;

/// Immutable configuration for one batch run.
///
/// Construct through [`BatchConfig::builder`], which validates every field.
/// The driver validates again at startup so a hand-assembled value cannot
/// slip past the checks.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub output_dir: PathBuf,
    pub temp_root: PathBuf,
    pub ledger_path: PathBuf,
    pub limit: Option<usize>,
    pub start_page: u32,
    pub api_delay: Duration,
    pub download_delay: Duration,
    pub item_timeout: Duration,
    pub resume: bool,
    pub dry_run: bool,
    /// Reprocess items the ledger already considers done.
    pub force: bool,
    pub sort: SortOrder,
    /// Number of recorded items between ledger checkpoints.
    pub checkpoint_every: usize,
    /// Cross-run cap on attempts for a retryable failure.
    pub max_attempts: u32,
    pub max_list_attempts: u32,
    /// Base delay for exponential backoff after a throttled listing call.
    pub throttle_backoff: Duration,
    pub min_free_bytes: u64,
    pub max_uncompressed_bytes: u64,
    pub required_build_tools: Vec<String>,
    pub exclude: Vec<String>,
    pub skip_retired: bool,
    /// File extensions that count as analyzable source. Empty disables the check.
    pub source_extensions: Vec<String>,
}

impl BatchConfig {
    pub fn builder(output_dir: impl Into<PathBuf>) -> BatchConfigBuilder {
        BatchConfigBuilder::new(output_dir.into())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutputDir);
        }
        if self.temp_root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyTempRoot);
        }
        if self.temp_root == self.output_dir {
            return Err(ConfigError::TempRootIsOutput(self.temp_root.clone()));
        }
        if self.limit == Some(0) {
            return Err(ConfigError::Zero { field: "limit" });
        }
        if self.start_page == 0 {
            return Err(ConfigError::Zero { field: "start_page" });
        }
        if self.item_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "item_timeout",
            });
        }
        if self.checkpoint_every == 0 {
            return Err(ConfigError::Zero {
                field: "checkpoint_every",
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }
        if self.max_list_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_list_attempts",
            });
        }
        if self.max_uncompressed_bytes == 0 {
            return Err(ConfigError::Zero {
                field: "max_uncompressed_bytes",
            });
        }
        if let Some(bad) = self
            .source_extensions
            .iter()
            .find(|ext| ext.is_empty() || ext.starts_with('.') || ext.contains('/'))
        {
            return Err(ConfigError::InvalidExtension(bad.clone()));
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }
}

/// Builder for [`BatchConfig`] with the documented defaults.
#[derive(Debug, Clone)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
    ledger_path: Option<PathBuf>,
}

impl BatchConfigBuilder {
    fn new(output_dir: PathBuf) -> Self {
        Self {
            config: BatchConfig {
                ledger_path: PathBuf::new(),
                output_dir,
                temp_root: std::env::temp_dir(),
                limit: None,
                start_page: 1,
                api_delay: Duration::from_millis(1000),
                download_delay: Duration::from_millis(500),
                item_timeout: Duration::from_secs(300),
                resume: false,
                dry_run: false,
                force: false,
                sort: SortOrder::default(),
                checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                max_list_attempts: DEFAULT_MAX_LIST_ATTEMPTS,
                throttle_backoff: Duration::from_secs(2),
                min_free_bytes: DEFAULT_MIN_FREE_BYTES,
                max_uncompressed_bytes: DEFAULT_MAX_UNCOMPRESSED_BYTES,
                required_build_tools: Vec::new(),
                exclude: Vec::new(),
                skip_retired: false,
                source_extensions: Vec::new(),
            },
            ledger_path: None,
        }
    }

    pub fn temp_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.temp_root = path.into();
        self
    }

    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.config.limit = limit;
        self
    }

    pub fn start_page(mut self, page: u32) -> Self {
        self.config.start_page = page;
        self
    }

    pub fn api_delay(mut self, delay: Duration) -> Self {
        self.config.api_delay = delay;
        self
    }

    pub fn download_delay(mut self, delay: Duration) -> Self {
        self.config.download_delay = delay;
        self
    }

    pub fn item_timeout(mut self, timeout: Duration) -> Self {
        self.config.item_timeout = timeout;
        self
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.config.resume = resume;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.config.force = force;
        self
    }

    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.config.sort = sort;
        self
    }

    pub fn checkpoint_every(mut self, every: usize) -> Self {
        self.config.checkpoint_every = every;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn max_list_attempts(mut self, attempts: u32) -> Self {
        self.config.max_list_attempts = attempts;
        self
    }

    pub fn throttle_backoff(mut self, backoff: Duration) -> Self {
        self.config.throttle_backoff = backoff;
        self
    }

    pub fn min_free_bytes(mut self, bytes: u64) -> Self {
        self.config.min_free_bytes = bytes;
        self
    }

    pub fn max_uncompressed_bytes(mut self, bytes: u64) -> Self {
        self.config.max_uncompressed_bytes = bytes;
        self
    }

    pub fn required_build_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.required_build_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exclude = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn skip_retired(mut self, skip: bool) -> Self {
        self.config.skip_retired = skip;
        self
    }

    pub fn source_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.source_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<BatchConfig, ConfigError> {
        let mut config = self.config;
        config.ledger_path = self
            .ledger_path
            .unwrap_or_else(|| config.output_dir.join("progress.json"));
        config.validate()?;
        Ok(config)
    }
}
