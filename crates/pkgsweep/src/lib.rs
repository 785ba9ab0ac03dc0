pub mod analyzer;
pub mod archive;
pub mod config;
pub mod disk;
pub mod download;
pub mod failure;
pub mod filter;
pub mod package;
pub mod progress;
pub mod rate_limit;
pub mod registry;

pub use analyzer::{AnalysisError, AnalysisOutput, Analyzer, Artifact};
pub use archive::ExtractionError;
pub use config::{BatchConfig, BatchConfigBuilder, ConfigError, SortOrder};
pub use disk::SpaceProbe;
pub use download::{ArchiveTransport, DownloadError, Downloader};
pub use failure::{Classification, FailureKind, FailureRecord, RawFailure, classify};
pub use filter::{Decision, SkipReason, decide};
pub use package::{PackageListing, PackageRef};
pub use progress::{
    Counters, Cursor, FailureInfo, ItemOutcome, ItemStatus, ProgressEntry, ProgressState,
    now_epoch_secs,
};
pub use rate_limit::{Budget, RateLimiter};
pub use registry::{RegistryApi, RegistryClient, RegistryError};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
