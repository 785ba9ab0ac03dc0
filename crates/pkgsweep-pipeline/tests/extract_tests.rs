mod common;

use std::path::Path;
use std::sync::atomic::AtomicBool;

use common::{children, hex_release, tar_bytes, tar_gz, tar_with_raw_name, tar_with_symlink};
use pkgsweep::ExtractionError;
use pkgsweep_pipeline::{Extractor, contains_source};

const LIMIT: u64 = 1024 * 1024;

fn write_archive(dir: &Path, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join("release.tar");
    std::fs::write(&path, bytes).unwrap();
    path
}

fn extract(bytes: &[u8], limit: u64) -> (tempfile::TempDir, Result<std::path::PathBuf, ExtractionError>) {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), bytes);
    let result = Extractor::new(limit).extract(&archive, &dir.path().join("src"), &AtomicBool::new(false));
    (dir, result)
}

#[test]
fn plain_and_gzip_archives_extract_the_same_tree() {
    let files: &[(&str, &[u8])] = &[("lib/plug.ex", b"defmodule Plug do end"), ("mix.exs", b"[]")];

    for bytes in [tar_bytes(files), tar_gz(files)] {
        let (dir, result) = extract(&bytes, LIMIT);
        let root = result.unwrap();
        assert_eq!(root, dir.path().join("src"));
        assert_eq!(
            std::fs::read_to_string(root.join("lib/plug.ex")).unwrap(),
            "defmodule Plug do end"
        );
        assert_eq!(children(&root), vec!["lib", "mix.exs"]);
    }
}

#[test]
fn single_top_level_directory_becomes_the_root() {
    let (dir, result) = extract(
        &tar_gz(&[("plug-1.0.0/lib/plug.ex", b"x"), ("plug-1.0.0/mix.exs", b"[]")]),
        LIMIT,
    );
    assert_eq!(result.unwrap(), dir.path().join("src").join("plug-1.0.0"));
}

#[test]
fn hex_release_unpacks_nested_contents() {
    let (dir, result) = extract(&hex_release(&[("lib/plug.ex", b"defmodule Plug do end")]), LIMIT);

    let root = result.unwrap();
    assert_eq!(root, dir.path().join("src").join("contents"));
    assert!(root.join("lib/plug.ex").is_file());
    assert!(!dir.path().join("src").join("contents.tar.gz").exists());
}

#[test]
fn parent_traversal_is_rejected_and_nothing_escapes() {
    let (dir, result) = extract(&tar_with_raw_name(b"../../escape.txt", b"pwned"), LIMIT);

    assert!(matches!(result, Err(ExtractionError::UnsafeEntry(_))), "got {result:?}");
    assert!(!dir.path().join("src").exists(), "partial output should be removed");
    assert!(!dir.path().join("escape.txt").exists());
    assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
}

#[test]
fn absolute_entry_is_rejected() {
    let (_dir, result) = extract(&tar_with_raw_name(b"/tmp/pkgsweep-absolute", b"x"), LIMIT);
    assert!(matches!(result, Err(ExtractionError::UnsafeEntry(_))), "got {result:?}");
    assert!(!Path::new("/tmp/pkgsweep-absolute").exists());
}

#[test]
fn escaping_symlink_is_rejected() {
    let (dir, result) = extract(&tar_with_symlink("pkg/lib/evil", "../../../etc/passwd"), LIMIT);
    assert!(matches!(result, Err(ExtractionError::UnsafeEntry(_))), "got {result:?}");
    assert!(!dir.path().join("src").exists());
}

#[test]
fn contained_symlink_is_skipped() {
    let (_dir, result) = extract(&tar_with_symlink("pkg/lib/alias.ex", "a.ex"), LIMIT);
    let root = result.unwrap();
    assert!(root.join("lib/a.ex").is_file());
    assert!(!root.join("lib/alias.ex").exists());
}

#[test]
fn oversized_payload_is_rejected() {
    let big = vec![b'a'; 4096];
    let (dir, result) = extract(&tar_bytes(&[("big.txt", &big)]), 1024);
    assert!(matches!(result, Err(ExtractionError::TooLarge { limit: 1024 })), "got {result:?}");
    assert!(!dir.path().join("src").exists());
}

#[test]
fn size_limit_counts_decompressed_bytes_across_entries() {
    let zeros = vec![0u8; 600];
    let bytes = tar_gz(&[("a.bin", &zeros), ("b.bin", &zeros)]);
    assert!(bytes.len() < 1000, "compressed archive should be small");

    let (_dir, result) = extract(&bytes, 1000);
    assert!(matches!(result, Err(ExtractionError::TooLarge { .. })), "got {result:?}");
}

#[test]
fn garbage_is_corrupt_and_retryable() {
    let noise: Vec<u8> = b"definitely not a tarball ".iter().copied().cycle().take(2048).collect();
    let (_dir, result) = extract(&noise, LIMIT);
    let err = result.unwrap_err();
    assert!(matches!(err, ExtractionError::Corrupt(_)), "got {err:?}");
    assert!(err.is_retryable());
}

#[test]
fn truncated_archive_is_corrupt() {
    let (_dir, result) = extract(&[0x1f], LIMIT);
    assert!(matches!(result, Err(ExtractionError::Corrupt(_))), "got {result:?}");
}

#[test]
fn cancel_flag_stops_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path(), &tar_bytes(&[("a.ex", b"x"), ("b.ex", b"y")]));
    let target = dir.path().join("src");

    let result = Extractor::new(LIMIT).extract(&archive, &target, &AtomicBool::new(true));

    assert!(matches!(result, Err(ExtractionError::Cancelled)), "got {result:?}");
    assert!(!target.exists());
}

#[test]
fn source_detection_matches_extensions_case_insensitively() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("lib/deep")).unwrap();
    std::fs::write(dir.path().join("README.md"), "readme").unwrap();
    std::fs::write(dir.path().join("lib/deep/Thing.EX"), "code").unwrap();

    assert!(contains_source(dir.path(), &["ex".into(), "exs".into()]).unwrap());
    assert!(!contains_source(dir.path(), &["erl".into()]).unwrap());
}
