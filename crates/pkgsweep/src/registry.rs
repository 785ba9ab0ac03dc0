use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SortOrder;
use crate::package::PackageListing;
use crate::rate_limit::{Budget, RateLimiter};

/// Upper bound on a single backoff wait, whatever the registry asks for.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Errors that can occur when listing the registry catalog.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry asked us to slow down (HTTP 429).
    #[error("registry throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("registry returned HTTP {0}")]
    Http(u16),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("gave up on page {page} after {attempts} attempts: {last}")]
    Exhausted {
        page: u32,
        attempts: u32,
        last: Box<RegistryError>,
    },
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled { .. } | Self::Network(_) => true,
            Self::Http(status) => *status >= 500,
            Self::Parse(_) | Self::Exhausted { .. } => false,
        }
    }
}

/// Transport for one page of the registry catalog.
#[async_trait::async_trait]
pub trait RegistryApi: Send + Sync {
    /// Human-readable label identifying this registry.
    fn label(&self) -> &str;

    /// Fetch one page (1-based). An empty page means the catalog is exhausted.
    async fn list_page(
        &self,
        page: u32,
        sort: SortOrder,
    ) -> Result<Vec<PackageListing>, RegistryError>;
}

#[async_trait::async_trait]
impl<T: RegistryApi + ?Sized> RegistryApi for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn list_page(
        &self,
        page: u32,
        sort: SortOrder,
    ) -> Result<Vec<PackageListing>, RegistryError> {
        (**self).list_page(page, sort).await
    }
}

/// Paginates the catalog through a [`RegistryApi`], spacing calls on the API
/// budget and backing off when the registry throttles.
pub struct RegistryClient {
    api: Arc<dyn RegistryApi>,
    limiter: Arc<RateLimiter>,
    sort: SortOrder,
    max_attempts: u32,
    backoff: Duration,
}

impl RegistryClient {
    pub fn new(api: Arc<dyn RegistryApi>, limiter: Arc<RateLimiter>, sort: SortOrder) -> Self {
        Self {
            api,
            limiter,
            sort,
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn label(&self) -> &str {
        self.api.label()
    }

    /// List one catalog page, retrying the same page on throttling or
    /// transient failures up to the configured number of attempts.
    pub async fn list_page(&self, page: u32) -> Result<Vec<PackageListing>, RegistryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.throttle(Budget::Api).await;

            let err = match self.api.list_page(page, self.sort).await {
                Ok(listings) => {
                    debug!(page, count = listings.len(), "listed catalog page");
                    return Ok(listings);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                return Err(RegistryError::Exhausted {
                    page,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let wait = self.backoff_for(&err, attempt);
            warn!(page, attempt, wait_ms = wait.as_millis() as u64, error = %err, "retrying catalog page");
            tokio::time::sleep(wait).await;
        }
    }

    fn backoff_for(&self, err: &RegistryError, attempt: u32) -> Duration {
        let wait = match err {
            RegistryError::Throttled {
                retry_after: Some(after),
            } => *after,
            _ => self
                .backoff
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        };
        wait.min(MAX_BACKOFF)
    }
}
