use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use pkgsweep::{AnalysisOutput, PackageRef, SpaceProbe};
use sysinfo::Disks;
use tracing::{debug, warn};

/// Errors specific to persisting analysis output.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("only {available} bytes free on output volume, need at least {required}")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("invalid artifact name: {0:?}")]
    InvalidArtifactName(String),

    #[error("package {0} does not map to a directory under the output root")]
    InvalidPackagePath(String),

    #[error("could not determine free space for {path}: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OutputError {
    /// Running out of disk is fatal to the run; everything else only fails the item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InsufficientSpace { .. } | Self::Probe { .. })
    }
}

/// Free-space probe backed by the host's mounted disks.
///
/// Picks the disk whose mount point is the longest prefix of the path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64> {
        let path = std::fs::canonicalize(path)?;
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no mounted volume contains {}", path.display()),
                )
            })
    }
}

/// Writes analyzer artifacts under `root/<name>/<version>/` and guards the
/// output volume's free-space floor.
pub struct OutputManager {
    root: PathBuf,
    min_free_bytes: u64,
    probe: Arc<dyn SpaceProbe>,
}

impl OutputManager {
    pub fn new(root: impl Into<PathBuf>, min_free_bytes: u64, probe: Arc<dyn SpaceProbe>) -> Self {
        Self {
            root: root.into(),
            min_free_bytes,
            probe,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `root/<name>/<version>`, refused when either part could leave the root.
    pub fn package_dir(&self, package: &PackageRef) -> Result<PathBuf, OutputError> {
        if !package.is_path_safe() {
            return Err(OutputError::InvalidPackagePath(package.to_string()));
        }
        Ok(self.root.join(package.name()).join(package.version()))
    }

    /// Fail when free space on the output volume is below the floor.
    /// Returns the number of free bytes otherwise.
    pub fn check_disk_space(&self) -> Result<u64, OutputError> {
        std::fs::create_dir_all(&self.root).map_err(|source| OutputError::Io {
            path: self.root.clone(),
            source,
        })?;

        let available = self
            .probe
            .available_bytes(&self.root)
            .map_err(|source| OutputError::Probe {
                path: self.root.clone(),
                source,
            })?;

        if available < self.min_free_bytes {
            warn!(available, required = self.min_free_bytes, "output volume below free-space floor");
            return Err(OutputError::InsufficientSpace {
                available,
                required: self.min_free_bytes,
            });
        }
        Ok(available)
    }

    /// Persist every artifact of `output` for `package`.
    ///
    /// Each file is written to a temp sibling and renamed into place, so a
    /// crash never leaves a truncated artifact. Returns the package directory.
    pub fn write(&self, package: &PackageRef, output: &AnalysisOutput) -> Result<PathBuf, OutputError> {
        let dir = self.package_dir(package)?;
        for artifact in &output.artifacts {
            validate_artifact_name(&artifact.name)?;
        }
        self.check_disk_space()?;

        for artifact in &output.artifacts {
            let target = dir.join(&artifact.name);
            write_atomic(&target, &artifact.bytes)?;
        }

        debug!(
            package = %package,
            artifacts = output.artifacts.len(),
            bytes = output.total_bytes(),
            "output written"
        );
        Ok(dir)
    }
}

/// Artifact names must be plain relative paths that stay inside the package directory.
fn validate_artifact_name(name: &str) -> Result<(), OutputError> {
    let path = Path::new(name);
    let plain = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(OutputError::InvalidArtifactName(name.to_owned()))
    }
}

fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), OutputError> {
    let io_err = |source| OutputError::Io {
        path: target.to_owned(),
        source,
    };

    let dir = target
        .parent()
        .ok_or_else(|| OutputError::InvalidArtifactName(target.display().to_string()))?;
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".artifact-")
        .tempfile_in(dir)
        .map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(target).map_err(|e| io_err(e.error))?;
    Ok(())
}
