use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{
    AnalysisError, AnalysisOutput, Analyzer, ArchiveTransport, DownloadError, PackageListing,
    PackageRef, RegistryApi, RegistryError, SortOrder, SpaceProbe,
};

/// In-memory catalog. Page `n` (1-based) is `pages[n - 1]`; pages past the
/// end are empty.
pub struct InMemoryRegistry {
    pages: Vec<Vec<PackageListing>>,
    throttles_left: Mutex<u32>,
    requested: Mutex<Vec<u32>>,
}

impl InMemoryRegistry {
    pub fn new(pages: Vec<Vec<PackageListing>>) -> Self {
        Self {
            pages,
            throttles_left: Mutex::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Answer the first `n` calls with a throttling response.
    pub fn throttle_first(self, n: u32) -> Self {
        *self.throttles_left.lock().unwrap() = n;
        self
    }

    /// Every page number requested so far, in order.
    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RegistryApi for InMemoryRegistry {
    fn label(&self) -> &str {
        "in-memory"
    }

    async fn list_page(
        &self,
        page: u32,
        _sort: SortOrder,
    ) -> Result<Vec<PackageListing>, RegistryError> {
        self.requested.lock().unwrap().push(page);

        let mut throttles = self.throttles_left.lock().unwrap();
        if *throttles > 0 {
            *throttles -= 1;
            return Err(RegistryError::Throttled { retry_after: None });
        }

        let index = page.saturating_sub(1) as usize;
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }
}

struct Route {
    queued: VecDeque<Result<Vec<u8>, DownloadError>>,
    outcome: Result<Vec<u8>, DownloadError>,
}

/// Transport serving canned archive bytes or errors per URL.
/// Unknown URLs answer HTTP 404.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(self, url: &str, bytes: Vec<u8>) -> Self {
        self.with_route(url, |r| r.outcome = Ok(bytes));
        self
    }

    /// Fail every request for `url` with `err`.
    pub fn fail(self, url: &str, err: DownloadError) -> Self {
        self.with_route(url, |r| r.outcome = Err(err));
        self
    }

    /// Fail the next request for `url` with `err`, then fall back to the route's outcome.
    pub fn fail_once(self, url: &str, err: DownloadError) -> Self {
        self.with_route(url, |r| r.queued.push_back(Err(err)));
        self
    }

    /// Answer the next request for `url` with `bytes`, then fall back to the route's outcome.
    pub fn serve_once(self, url: &str, bytes: Vec<u8>) -> Self {
        self.with_route(url, |r| r.queued.push_back(Ok(bytes)));
        self
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn with_route(&self, url: &str, f: impl FnOnce(&mut Route)) {
        let mut routes = self.routes.lock().unwrap();
        let route = routes.entry(url.to_owned()).or_insert_with(|| Route {
            queued: VecDeque::new(),
            outcome: Err(DownloadError::Status {
                status: 404,
                url: url.to_owned(),
            }),
        });
        f(route);
    }
}

#[async_trait::async_trait]
impl ArchiveTransport for FakeTransport {
    async fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        _timeout: Duration,
        max_bytes: u64,
    ) -> Result<u64, DownloadError> {
        self.calls.lock().unwrap().push(url.to_owned());

        let outcome = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(url) {
                Some(route) => route
                    .queued
                    .pop_front()
                    .unwrap_or_else(|| route.outcome.clone()),
                None => Err(DownloadError::Status {
                    status: 404,
                    url: url.to_owned(),
                }),
            }
        };

        let bytes = outcome?;
        if bytes.len() as u64 > max_bytes {
            return Err(DownloadError::TooLarge { limit: max_bytes });
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

/// Analyzer backed by a closure.
pub struct FnAnalyzer<F> {
    f: F,
}

impl<F> FnAnalyzer<F>
where
    F: Fn(&Path, &PackageRef) -> Result<AnalysisOutput, AnalysisError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Analyzer for FnAnalyzer<F>
where
    F: Fn(&Path, &PackageRef) -> Result<AnalysisOutput, AnalysisError> + Send + Sync,
{
    fn name(&self) -> &str {
        "fn-analyzer"
    }

    fn analyze(&self, root: &Path, package: &PackageRef) -> Result<AnalysisOutput, AnalysisError> {
        (self.f)(root, package)
    }
}

/// Analyzer that lists the files it was given, one relative path per line.
pub struct FileListAnalyzer;

impl Analyzer for FileListAnalyzer {
    fn name(&self) -> &str {
        "file-list"
    }

    fn analyze(&self, root: &Path, _package: &PackageRef) -> Result<AnalysisOutput, AnalysisError> {
        let mut paths = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(root) {
                    paths.push(relative.to_string_lossy().into_owned());
                }
            }
        }
        paths.sort();
        Ok(AnalysisOutput::single("files.txt", paths.join("\n")))
    }
}

/// Disk probe reporting a settable amount of free space for every path.
pub struct FakeSpace {
    available: AtomicU64,
}

impl FakeSpace {
    pub fn new(available: u64) -> Self {
        Self {
            available: AtomicU64::new(available),
        }
    }

    pub fn set(&self, available: u64) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl SpaceProbe for FakeSpace {
    fn available_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_transport_replays_failures_then_outcome() {
        let transport = FakeTransport::new()
            .serve("u", b"ok".to_vec())
            .fail_once("u", DownloadError::Connection("reset".into()));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("u.tar");
        let timeout = Duration::from_secs(1);

        assert!(transport.fetch_to("u", &dest, timeout, u64::MAX).await.is_err());
        assert_eq!(transport.fetch_to("u", &dest, timeout, u64::MAX).await.unwrap(), 2);
        assert_eq!(transport.calls_for("u"), 2);
    }

    #[tokio::test]
    async fn unknown_urls_are_not_found() {
        let transport = FakeTransport::new();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("never-written");
        let err = transport
            .fetch_to("nope", &dest, Duration::from_secs(1), u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 404, .. }));
        assert!(!dest.exists());
    }
}
