use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analyzer::AnalysisError;
use crate::archive::ExtractionError;
use crate::download::DownloadError;
use crate::package::PackageRef;

/// Category of a per-item failure as stored in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DownloadError,
    ExtractionError,
    Timeout,
    NotTargetLanguage,
    AnalysisError,
    OutputError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadError => "download_error",
            Self::ExtractionError => "extraction_error",
            Self::Timeout => "timeout",
            Self::NotTargetLanguage => "not_target_language",
            Self::AnalysisError => "analysis_error",
            Self::OutputError => "output_error",
        }
    }

    /// Retry policy for the kind when the raw error does not override it.
    pub fn default_retryable(&self) -> bool {
        match self {
            Self::DownloadError | Self::ExtractionError | Self::Timeout | Self::OutputError => true,
            Self::NotTargetLanguage | Self::AnalysisError => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can go wrong while handling one package, before classification.
#[derive(Debug, thiserror::Error)]
pub enum RawFailure {
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("item exceeded its {0:?} budget")]
    TimedOut(Duration),

    #[error("no files with extensions {extensions:?} in archive")]
    NoSource { extensions: Vec<String> },

    #[error("{0}")]
    Analysis(#[from] AnalysisError),

    #[error("analyzer panicked: {0}")]
    AnalyzerPanicked(String),

    #[error("could not prepare workspace: {0}")]
    Workspace(std::io::Error),

    #[error("could not write output: {0}")]
    Output(String),

    #[error("refusing output location: {0}")]
    UnsafeOutputPath(String),
}

/// Result of classifying a raw failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub retryable: bool,
}

impl Classification {
    fn of(kind: FailureKind) -> Self {
        Self {
            kind,
            retryable: kind.default_retryable(),
        }
    }

    fn permanent(kind: FailureKind) -> Self {
        Self {
            kind,
            retryable: false,
        }
    }
}

/// Map a raw failure to its ledger kind and retry policy.
///
/// Kinds carry a default policy; a few raw errors are permanent even though
/// their kind is normally retryable: non-transient HTTP statuses, oversized
/// downloads, unsafe archive entries, archives over the size limit and
/// package names that cannot be used as output directories.
pub fn classify(raw: &RawFailure) -> Classification {
    match raw {
        RawFailure::Download(DownloadError::Timeout(_)) => Classification::of(FailureKind::Timeout),
        RawFailure::Download(err @ DownloadError::Status { .. }) if !err.is_transient() => {
            Classification::permanent(FailureKind::DownloadError)
        }
        RawFailure::Download(DownloadError::TooLarge { .. }) => {
            Classification::permanent(FailureKind::DownloadError)
        }
        RawFailure::Download(_) => Classification::of(FailureKind::DownloadError),
        RawFailure::Extraction(ExtractionError::Cancelled) | RawFailure::TimedOut(_) => {
            Classification::of(FailureKind::Timeout)
        }
        RawFailure::Extraction(
            ExtractionError::UnsafeEntry(_) | ExtractionError::TooLarge { .. },
        ) => Classification::permanent(FailureKind::ExtractionError),
        RawFailure::Extraction(_) | RawFailure::Workspace(_) => {
            Classification::of(FailureKind::ExtractionError)
        }
        RawFailure::NoSource { .. } => Classification::of(FailureKind::NotTargetLanguage),
        RawFailure::Analysis(_) | RawFailure::AnalyzerPanicked(_) => {
            Classification::of(FailureKind::AnalysisError)
        }
        RawFailure::Output(_) => Classification::of(FailureKind::OutputError),
        RawFailure::UnsafeOutputPath(_) => Classification::permanent(FailureKind::OutputError),
    }
}

/// A classified failure for one package, ready to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub package: PackageRef,
    pub kind: FailureKind,
    pub retryable: bool,
    pub message: String,
    /// 1-based attempt number across runs.
    pub attempt: u32,
}

impl FailureRecord {
    pub fn from_raw(package: PackageRef, raw: &RawFailure, attempt: u32) -> Self {
        let Classification { kind, retryable } = classify(raw);
        Self {
            package,
            kind,
            retryable,
            message: raw.to_string(),
            attempt,
        }
    }
}
