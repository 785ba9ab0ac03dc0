use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::read::GzDecoder;
use pkgsweep::ExtractionError;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Name of the inner source tarball in a Hex-style release archive.
const NESTED_CONTENTS: &str = "contents.tar.gz";
const NESTED_ROOT: &str = "contents";

/// Unpacks release archives into a sandbox directory.
///
/// Accepts plain and gzip-compressed tar. Entries with absolute paths or `..`
/// components are rejected, as are links whose target leaves the sandbox;
/// links that stay inside are not materialized. The running total of
/// decompressed bytes is capped.
#[derive(Debug, Clone, Copy)]
pub struct Extractor {
    max_uncompressed_bytes: u64,
}

impl Extractor {
    pub fn new(max_uncompressed_bytes: u64) -> Self {
        Self {
            max_uncompressed_bytes,
        }
    }

    /// Extract `archive` into `target` and return the directory to analyze.
    ///
    /// On error everything written under `target` is removed.
    pub fn extract(
        &self,
        archive: &Path,
        target: &Path,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, ExtractionError> {
        std::fs::create_dir_all(target)?;

        let mut budget = ByteBudget::new(self.max_uncompressed_bytes);
        let result = unpack_file(archive, target, &mut budget, cancel)
            .and_then(|()| resolve_root(target, &mut budget, cancel));

        match result {
            Ok(root) => {
                debug!(archive = %archive.display(), bytes = budget.used, root = %root.display(), "archive extracted");
                Ok(root)
            }
            Err(err) => {
                if let Err(e) = std::fs::remove_dir_all(target)
                    && e.kind() != io::ErrorKind::NotFound
                {
                    warn!(path = %target.display(), error = %e, "failed to remove partial extraction");
                }
                Err(err)
            }
        }
    }
}

struct ByteBudget {
    limit: u64,
    used: u64,
}

impl ByteBudget {
    fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    fn charge(&mut self, bytes: u64) -> Result<(), ExtractionError> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            return Err(ExtractionError::TooLarge { limit: self.limit });
        }
        Ok(())
    }
}

fn corrupt(err: io::Error) -> ExtractionError {
    ExtractionError::Corrupt(err.to_string())
}

fn unpack_file(
    archive: &Path,
    target: &Path,
    budget: &mut ByteBudget,
    cancel: &AtomicBool,
) -> Result<(), ExtractionError> {
    let mut file = File::open(archive)?;

    let mut magic = [0u8; 2];
    let gzipped = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ExtractionError::Corrupt("archive is truncated".into()));
        }
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    if gzipped {
        unpack_stream(GzDecoder::new(reader), target, budget, cancel)
    } else {
        unpack_stream(reader, target, budget, cancel)
    }
}

fn unpack_stream<R: Read>(
    reader: R,
    target: &Path,
    budget: &mut ByteBudget,
    cancel: &AtomicBool,
) -> Result<(), ExtractionError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(corrupt)?;

    for entry in entries {
        if cancel.load(Ordering::SeqCst) {
            return Err(ExtractionError::Cancelled);
        }

        let mut entry = entry.map_err(corrupt)?;
        let raw_path = entry.path().map_err(corrupt)?.into_owned();
        let Some(relative) = sandboxed(&raw_path)? else {
            continue;
        };
        let dest = target.join(&relative);
        let entry_type = entry.header().entry_type();

        match entry_type {
            tar::EntryType::Directory => std::fs::create_dir_all(&dest)?,
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let declared = entry.header().size().map_err(corrupt)?;
                if declared > budget.remaining() {
                    return Err(ExtractionError::TooLarge {
                        limit: budget.limit,
                    });
                }
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&dest)?;
                let mut limited = (&mut entry).take(budget.remaining() + 1);
                let written = io::copy(&mut limited, &mut out)?;
                budget.charge(written)?;
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(corrupt)?
                    .ok_or_else(|| {
                        ExtractionError::Corrupt(format!("link {} has no target", raw_path.display()))
                    })?
                    .into_owned();
                let base = if entry_type == tar::EntryType::Symlink {
                    relative.parent().unwrap_or(Path::new("")).to_path_buf()
                } else {
                    PathBuf::new()
                };
                if escapes(&base, &link) {
                    return Err(ExtractionError::UnsafeEntry(format!(
                        "{} -> {}",
                        raw_path.display(),
                        link.display()
                    )));
                }
                debug!(entry = %raw_path.display(), "skipping link entry");
            }
            other => debug!(entry = %raw_path.display(), kind = ?other, "skipping special entry"),
        }
    }

    Ok(())
}

/// Map an entry path to a relative path inside the sandbox.
///
/// Returns `None` for entries naming the archive root itself (such as `./`).
fn sandboxed(path: &Path) -> Result<Option<PathBuf>, ExtractionError> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractionError::UnsafeEntry(path.display().to_string()));
            }
        }
    }
    Ok((!clean.as_os_str().is_empty()).then_some(clean))
}

/// Whether `link`, resolved lexically from `base`, leaves the sandbox root.
fn escapes(base: &Path, link: &Path) -> bool {
    if link.is_absolute() {
        return true;
    }

    let mut depth: usize = base
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    for component in link.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return true,
            },
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}

/// Pick the directory handed to the analyzer.
///
/// A Hex-style outer tarball has its `contents.tar.gz` unpacked into
/// `contents/`, which becomes the root. Otherwise a lone top-level directory
/// is descended into.
fn resolve_root(
    target: &Path,
    budget: &mut ByteBudget,
    cancel: &AtomicBool,
) -> Result<PathBuf, ExtractionError> {
    let nested = target.join(NESTED_CONTENTS);
    if nested.is_file() {
        let root = target.join(NESTED_ROOT);
        std::fs::create_dir_all(&root)?;
        unpack_file(&nested, &root, budget, cancel)?;
        std::fs::remove_file(&nested)?;
        return Ok(root);
    }

    let mut children = std::fs::read_dir(target)?;
    if let (Some(only), None) = (children.next(), children.next()) {
        let only = only?;
        if only.file_type()?.is_dir() {
            return Ok(only.path());
        }
    }
    Ok(target.to_path_buf())
}

/// Whether any file under `root` has one of `extensions` (compared case-insensitively).
pub fn contains_source(root: &Path, extensions: &[String]) -> io::Result<bool> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file()
                && let Some(ext) = path.extension().and_then(|e| e.to_str())
                && extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext))
            {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
