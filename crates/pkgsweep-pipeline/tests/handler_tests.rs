mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{children, hex_release, tar_gz, tar_with_raw_name};
use pkgsweep::test_support::{FakeTransport, FileListAnalyzer, FnAnalyzer};
use pkgsweep::{
    AnalysisError, AnalysisOutput, Analyzer, BatchConfig, DownloadError, Downloader, FailureKind,
    PackageListing, PackageRef, RateLimiter,
};
use pkgsweep_pipeline::PackageHandler;

const URL: &str = "https://repo.test/tarballs/plug-1.0.0.tar";

struct Fixture {
    _dir: tempfile::TempDir,
    temp_root: std::path::PathBuf,
    config: BatchConfig,
}

fn fixture(configure: impl FnOnce(pkgsweep::BatchConfigBuilder) -> pkgsweep::BatchConfigBuilder) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let temp_root = dir.path().join("work");
    let builder = BatchConfig::builder(dir.path().join("out"))
        .temp_root(&temp_root)
        .api_delay(Duration::ZERO)
        .download_delay(Duration::ZERO);
    let config = configure(builder).build().unwrap();
    Fixture {
        _dir: dir,
        temp_root,
        config,
    }
}

fn handler(fixture: &Fixture, transport: Arc<FakeTransport>, analyzer: Arc<dyn Analyzer>) -> PackageHandler {
    let downloader = Downloader::new(transport, Arc::new(RateLimiter::unlimited()));
    PackageHandler::new(Arc::new(fixture.config.clone()), downloader, analyzer)
}

fn listing() -> PackageListing {
    PackageListing::new(PackageRef::new("plug", "1.0.0"), URL).with_build_tools(["mix"])
}

fn assert_workspace_gone(temp_root: &Path) {
    assert!(children(temp_root).is_empty(), "leftover workspaces: {:?}", children(temp_root));
}

#[tokio::test]
async fn successful_item_returns_output_and_cleans_up() {
    let fx = fixture(|b| b);
    let transport = Arc::new(FakeTransport::new().serve(
        URL,
        hex_release(&[("lib/plug.ex", b"defmodule Plug do end"), ("mix.exs", b"[]")]),
    ));

    let output = handler(&fx, transport, Arc::new(FileListAnalyzer))
        .process(&listing(), 1)
        .await
        .unwrap();

    assert_eq!(output, AnalysisOutput::single("files.txt", "lib/plug.ex\nmix.exs"));
    assert_workspace_gone(&fx.temp_root);
}

#[tokio::test]
async fn analyzer_sees_the_resolved_root() {
    let fx = fixture(|b| b);
    let transport = Arc::new(FakeTransport::new().serve(URL, tar_gz(&[("plug-1.0.0/lib/plug.ex", b"x")])));
    let analyzer = FnAnalyzer::new(|root: &Path, package: &PackageRef| {
        assert!(root.ends_with("plug-1.0.0"), "root was {}", root.display());
        assert_eq!(package.key(), "plug@1.0.0");
        Ok(AnalysisOutput::single("ok", "yes"))
    });

    handler(&fx, transport, Arc::new(analyzer))
        .process(&listing(), 1)
        .await
        .unwrap();
}

#[tokio::test]
async fn download_timeout_is_classified_as_timeout() {
    let fx = fixture(|b| b);
    let transport =
        Arc::new(FakeTransport::new().fail(URL, DownloadError::Timeout(Duration::from_secs(30))));

    let record = handler(&fx, transport.clone(), Arc::new(FileListAnalyzer))
        .process(&listing(), 2)
        .await
        .unwrap_err();

    assert_eq!(record.kind, FailureKind::Timeout);
    assert!(record.retryable);
    assert_eq!(record.attempt, 2);
    assert_eq!(transport.calls_for(URL), 2, "one retry on a transient error");
    assert_workspace_gone(&fx.temp_root);
}

#[tokio::test]
async fn missing_archive_is_permanent() {
    let fx = fixture(|b| b);
    let transport = Arc::new(FakeTransport::new());

    let record = handler(&fx, transport.clone(), Arc::new(FileListAnalyzer))
        .process(&listing(), 1)
        .await
        .unwrap_err();

    assert_eq!(record.kind, FailureKind::DownloadError);
    assert!(!record.retryable);
    assert_eq!(transport.calls_for(URL), 1);
}

#[tokio::test]
async fn corrupt_archive_is_downloaded_again_once() {
    let fx = fixture(|b| b);
    let garbage: Vec<u8> = b"not a tar ".iter().copied().cycle().take(1024).collect();
    let transport = Arc::new(
        FakeTransport::new()
            .serve(URL, tar_gz(&[("lib/plug.ex", b"x"), ("mix.exs", b"[]")]))
            .serve_once(URL, garbage),
    );

    let output = handler(&fx, transport.clone(), Arc::new(FileListAnalyzer))
        .process(&listing(), 1)
        .await
        .unwrap();

    assert_eq!(output, AnalysisOutput::single("files.txt", "lib/plug.ex\nmix.exs"));
    assert_eq!(transport.calls_for(URL), 2);
    assert_workspace_gone(&fx.temp_root);
}

#[tokio::test]
async fn persistently_corrupt_archive_fails_retryably() {
    let fx = fixture(|b| b);
    let garbage: Vec<u8> = b"not a tar ".iter().copied().cycle().take(1024).collect();
    let transport = Arc::new(FakeTransport::new().serve(URL, garbage));

    let record = handler(&fx, transport.clone(), Arc::new(FileListAnalyzer))
        .process(&listing(), 1)
        .await
        .unwrap_err();

    assert_eq!(record.kind, FailureKind::ExtractionError);
    assert!(record.retryable);
    assert_eq!(transport.calls_for(URL), 2);
    assert_workspace_gone(&fx.temp_root);
}

#[tokio::test]
async fn unsafe_archive_is_not_downloaded_again() {
    let fx = fixture(|b| b);
    let transport = Arc::new(FakeTransport::new().serve(URL, tar_with_raw_name(b"../../x", b"x")));

    let record = handler(&fx, transport.clone(), Arc::new(FileListAnalyzer))
        .process(&listing(), 1)
        .await
        .unwrap_err();

    assert_eq!(record.kind, FailureKind::ExtractionError);
    assert!(!record.retryable);
    assert_eq!(transport.calls_for(URL), 1);
    assert_workspace_gone(&fx.temp_root);
}

#[tokio::test]
async fn archive_without_source_is_not_target_language() {
    let fx = fixture(|b| b.source_extensions(["ex", "exs"]));
    let transport = Arc::new(FakeTransport::new().serve(URL, tar_gz(&[("README.md", b"docs only")])));
    let analyzer = FnAnalyzer::new(|_: &Path, _: &PackageRef| -> Result<AnalysisOutput, AnalysisError> {
        panic!("analyzer must not run without source")
    });

    let record = handler(&fx, transport, Arc::new(analyzer))
        .process(&listing(), 1)
        .await
        .unwrap_err();

    assert_eq!(record.kind, FailureKind::NotTargetLanguage);
    assert!(!record.retryable);
}

#[tokio::test]
async fn analyzer_error_is_recorded() {
    let fx = fixture(|b| b);
    let transport = Arc::new(FakeTransport::new().serve(URL, tar_gz(&[("lib/plug.ex", b"x")])));
    let analyzer = FnAnalyzer::new(|_: &Path, _: &PackageRef| Err(AnalysisError::Failed("parse error on line 3".into())));

    let record = handler(&fx, transport, Arc::new(analyzer))
        .process(&listing(), 1)
        .await
        .unwrap_err();

    assert_eq!(record.kind, FailureKind::AnalysisError);
    assert!(record.message.contains("parse error on line 3"));
    assert_workspace_gone(&fx.temp_root);
}

#[tokio::test]
async fn analyzer_panic_is_caught_and_workspace_removed() {
    let fx = fixture(|b| b);
    let transport = Arc::new(FakeTransport::new().serve(URL, tar_gz(&[("lib/plug.ex", b"x")])));
    let analyzer = FnAnalyzer::new(|_: &Path, _: &PackageRef| -> Result<AnalysisOutput, AnalysisError> {
        panic!("index out of bounds")
    });

    let record = handler(&fx, transport, Arc::new(analyzer))
        .process(&listing(), 1)
        .await
        .unwrap_err();

    assert_eq!(record.kind, FailureKind::AnalysisError);
    assert!(!record.retryable);
    assert!(record.message.contains("index out of bounds"), "{}", record.message);
    assert_workspace_gone(&fx.temp_root);
}

#[tokio::test]
async fn slow_analyzer_hits_the_item_deadline() {
    let fx = fixture(|b| b.item_timeout(Duration::from_millis(200)));
    let transport = Arc::new(FakeTransport::new().serve(URL, tar_gz(&[("lib/plug.ex", b"x")])));
    let analyzer = FnAnalyzer::new(|_: &Path, _: &PackageRef| {
        std::thread::sleep(Duration::from_secs(1));
        Ok(AnalysisOutput::single("late", "late"))
    });

    let record = handler(&fx, transport, Arc::new(analyzer))
        .process(&listing(), 1)
        .await
        .unwrap_err();

    assert_eq!(record.kind, FailureKind::Timeout);
    assert!(record.retryable);
    assert_workspace_gone(&fx.temp_root);
}
