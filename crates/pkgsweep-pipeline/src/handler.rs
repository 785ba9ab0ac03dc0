use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pkgsweep::{
    AnalysisOutput, Analyzer, BatchConfig, Downloader, ExtractionError, FailureRecord,
    PackageListing, PackageRef, RawFailure,
};
use tokio::task::JoinError;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, debug, info_span, warn};

use crate::extract::{Extractor, contains_source};

/// Downloads beyond the first when extraction fails with a retryable error.
const EXTRACTION_REDOWNLOADS: u32 = 1;

/// Per-item scratch directory under the temp root.
///
/// Removed by [`Workspace::close`] on the normal path and by `Drop` on every
/// other path, including panics and dropped futures.
struct Workspace {
    dir: Option<tempfile::TempDir>,
}

impl Workspace {
    fn create(temp_root: &Path, package: &PackageRef) -> std::io::Result<Self> {
        std::fs::create_dir_all(temp_root)?;
        let prefix: String = format!("pkgsweep-{}-", package.name())
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(temp_root)?;
        Ok(Self { dir: Some(dir) })
    }

    fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    fn archive_path(&self) -> PathBuf {
        self.path().join("release.tar")
    }

    fn extract_dir(&self) -> PathBuf {
        self.path().join("src")
    }

    fn close(mut self) -> std::io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "failed to remove workspace");
            }
        }
    }
}

/// Runs one package through download, extraction and analysis.
///
/// Owns the per-item workspace and the per-item deadline. Never returns a raw
/// error: every failure leaves as a classified [`FailureRecord`].
pub struct PackageHandler {
    config: Arc<BatchConfig>,
    downloader: Downloader,
    extractor: Extractor,
    analyzer: Arc<dyn Analyzer>,
}

impl PackageHandler {
    pub fn new(config: Arc<BatchConfig>, downloader: Downloader, analyzer: Arc<dyn Analyzer>) -> Self {
        let extractor = Extractor::new(config.max_uncompressed_bytes);
        Self {
            config,
            downloader,
            extractor,
            analyzer,
        }
    }

    /// Process `listing`. `attempt` is the 1-based attempt number across runs.
    pub async fn process(
        &self,
        listing: &PackageListing,
        attempt: u32,
    ) -> Result<AnalysisOutput, FailureRecord> {
        let package = &listing.package;
        let span = info_span!("package", package = %package, attempt);

        async {
            let workspace = Workspace::create(&self.config.temp_root, package).map_err(|e| {
                FailureRecord::from_raw(package.clone(), &RawFailure::Workspace(e), attempt)
            })?;
            let deadline = Instant::now() + self.config.item_timeout;

            let result = self.run(listing, &workspace, deadline).await;

            if let Err(e) = workspace.close() {
                warn!(error = %e, "failed to remove workspace");
            }

            result.map_err(|raw| {
                let record = FailureRecord::from_raw(package.clone(), &raw, attempt);
                debug!(kind = %record.kind, retryable = record.retryable, error = %raw, "item failed");
                record
            })
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        listing: &PackageListing,
        workspace: &Workspace,
        deadline: Instant,
    ) -> Result<AnalysisOutput, RawFailure> {
        let mut downloads = 0;
        let root = loop {
            downloads += 1;
            self.download(listing, workspace, deadline).await?;

            match self.extract(workspace, deadline).await {
                Ok(root) => break root,
                Err(RawFailure::Extraction(err))
                    if err.is_retryable() && downloads <= EXTRACTION_REDOWNLOADS =>
                {
                    warn!(error = %err, "extraction failed, downloading again");
                    let _ = tokio::fs::remove_file(workspace.archive_path()).await;
                }
                Err(err) => return Err(err),
            }
        };

        self.analyze(&listing.package, root, deadline).await
    }

    async fn download(
        &self,
        listing: &PackageListing,
        workspace: &Workspace,
        deadline: Instant,
    ) -> Result<(), RawFailure> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let archive = workspace.archive_path();
        let fetch = self.downloader.fetch(&listing.archive_url, &archive, remaining);

        match timeout_at(deadline, fetch).await {
            Ok(result) => result.map(|_| ()).map_err(RawFailure::from),
            Err(_) => Err(RawFailure::TimedOut(self.config.item_timeout)),
        }
    }

    /// Extract on a blocking thread. On deadline the task is told to stop and
    /// awaited, so nothing writes into the workspace after this returns.
    async fn extract(&self, workspace: &Workspace, deadline: Instant) -> Result<PathBuf, RawFailure> {
        let cancel = Arc::new(AtomicBool::new(false));
        let extractor = self.extractor;
        let archive = workspace.archive_path();
        let target = workspace.extract_dir();
        let flag = cancel.clone();

        let mut task =
            tokio::task::spawn_blocking(move || extractor.extract(&archive, &target, &flag));

        match timeout_at(deadline, &mut task).await {
            Ok(Ok(result)) => result.map_err(RawFailure::from),
            Ok(Err(join)) => Err(RawFailure::Extraction(ExtractionError::Corrupt(format!(
                "extraction task failed: {}",
                join_message(join)
            )))),
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                let _ = task.await;
                Err(RawFailure::TimedOut(self.config.item_timeout))
            }
        }
    }

    /// Check for analyzable source, then run the analyzer on a blocking thread.
    /// A panic inside the analyzer comes back as a failure, not an unwind.
    async fn analyze(
        &self,
        package: &PackageRef,
        root: PathBuf,
        deadline: Instant,
    ) -> Result<AnalysisOutput, RawFailure> {
        let analyzer = self.analyzer.clone();
        let extensions = self.config.source_extensions.clone();
        let package = package.clone();

        let task = tokio::task::spawn_blocking(move || {
            if !extensions.is_empty() && !contains_source(&root, &extensions).map_err(RawFailure::Workspace)? {
                return Err(RawFailure::NoSource { extensions });
            }
            analyzer.analyze(&root, &package).map_err(RawFailure::from)
        });

        match timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(RawFailure::AnalyzerPanicked(join_message(join))),
            // The analyzer thread cannot be interrupted; it is left to finish
            // against a workspace that is about to disappear.
            Err(_) => Err(RawFailure::TimedOut(self.config.item_timeout)),
        }
    }
}

fn join_message(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        "task cancelled".to_owned()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
