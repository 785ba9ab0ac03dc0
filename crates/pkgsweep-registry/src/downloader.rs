use std::path::Path;
use std::time::Duration;

use pkgsweep::{ArchiveTransport, DownloadError};
use reqwest::header::USER_AGENT;
use tokio::io::AsyncWriteExt;

/// HTTP transport that streams release archives straight to disk.
pub struct HttpArchiveTransport {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpArchiveTransport {
    pub fn new(user_agent: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            user_agent: user_agent.unwrap_or_else(|| "pkgsweep".to_owned()),
        }
    }

    async fn stream_to(
        &self,
        url: &str,
        dest: &Path,
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<u64, DownloadError> {
        let mut response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }
        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(DownloadError::TooLarge { limit: max_bytes });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| request_error(e, timeout))? {
            written += chunk.len() as u64;
            // Content-Length may be absent or wrong; count what actually arrives.
            if written > max_bytes {
                return Err(DownloadError::TooLarge { limit: max_bytes });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(written)
    }
}

impl Default for HttpArchiveTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

fn request_error(err: reqwest::Error, timeout: Duration) -> DownloadError {
    if err.is_timeout() {
        DownloadError::Timeout(timeout)
    } else {
        DownloadError::Connection(err.to_string())
    }
}

#[async_trait::async_trait]
impl ArchiveTransport for HttpArchiveTransport {
    async fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<u64, DownloadError> {
        tokio::time::timeout(timeout, self.stream_to(url, dest, timeout, max_bytes))
            .await
            .map_err(|_| DownloadError::Timeout(timeout))?
    }
}
