use std::path::Path;

use crate::package::PackageRef;

/// Errors reported by an analyzer.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("analyzer failed: {0}")]
    Failed(String),

    #[error("I/O error during analysis: {0}")]
    Io(#[from] std::io::Error),
}

/// A single named blob produced by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the package's output directory.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Whatever the analyzer produced for one package. The pipeline stores the
/// artifacts verbatim and never looks inside them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisOutput {
    pub artifacts: Vec<Artifact>,
}

impl AnalysisOutput {
    pub fn single(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            artifacts: vec![Artifact {
                name: name.into(),
                bytes: bytes.into(),
            }],
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.bytes.len() as u64).sum()
    }
}

/// External static-analysis component.
///
/// Called on a blocking thread with the extracted package root. It may take
/// as long as it needs; the pipeline bounds it with the per-item timeout.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    fn analyze(&self, root: &Path, package: &PackageRef) -> Result<AnalysisOutput, AnalysisError>;
}

impl<T: Analyzer + ?Sized> Analyzer for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn analyze(&self, root: &Path, package: &PackageRef) -> Result<AnalysisOutput, AnalysisError> {
        (**self).analyze(root, package)
    }
}
