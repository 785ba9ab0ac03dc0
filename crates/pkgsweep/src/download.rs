use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::rate_limit::{Budget, RateLimiter};

/// Total attempts for one archive: the first try plus one retry on a transient error.
const MAX_DOWNLOAD_ATTEMPTS: u32 = 2;

/// Errors that can occur while downloading a release archive.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("download timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("I/O error writing archive: {0}")]
    Io(String),

    #[error("archive exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

impl DownloadError {
    /// Whether an immediate second attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::Io(_) | Self::TooLarge { .. } => false,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Moves the bytes of one archive from a URL to a local file.
#[async_trait::async_trait]
pub trait ArchiveTransport: Send + Sync {
    /// Stream `url` into `dest`, returning the number of bytes written.
    ///
    /// Implementations stop with [`DownloadError::TooLarge`] once more than
    /// `max_bytes` would land on disk.
    async fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<u64, DownloadError>;
}

/// Fetches release archives through a transport, gated by the download budget,
/// retrying once on a transient failure.
#[derive(Clone)]
pub struct Downloader {
    transport: Arc<dyn ArchiveTransport>,
    limiter: Arc<RateLimiter>,
    max_bytes: u64,
}

impl Downloader {
    pub fn new(transport: Arc<dyn ArchiveTransport>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            transport,
            limiter,
            max_bytes: u64::MAX,
        }
    }

    /// Cap the size of a single archive on disk.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, DownloadError> {
        let mut attempt = 1;
        loop {
            self.limiter.throttle(Budget::Download).await;

            match self.transport.fetch_to(url, dest, timeout, self.max_bytes).await {
                Ok(bytes) => {
                    debug!(url, bytes, attempt, "archive downloaded");
                    return Ok(bytes);
                }
                Err(err) => {
                    // A half-written archive must never reach the extractor.
                    if let Err(e) = tokio::fs::remove_file(dest).await
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        warn!(path = %dest.display(), error = %e, "failed to remove partial archive");
                    }

                    if err.is_transient() && attempt < MAX_DOWNLOAD_ATTEMPTS {
                        warn!(url, attempt, error = %err, "transient download failure, retrying");
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}
