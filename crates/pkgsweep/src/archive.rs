/// Errors produced while unpacking a release archive.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// An entry path is absolute, contains `..`, or a link points outside the target.
    #[error("unsafe archive entry: {0}")]
    UnsafeEntry(String),

    #[error("archive expands beyond {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error("I/O error during extraction: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction cancelled")]
    Cancelled,
}

impl ExtractionError {
    /// Whether re-downloading and extracting again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::Io(_))
    }
}
