use thiserror::Error;

pub type PackResult<T> = Result<T, PackError>;

/// Failures raised while naming, verifying, resolving or installing a pack.
///
/// Every installer stage maps to exactly one variant so callers can report the
/// stage that rejected an artifact without string matching.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid pack filename: {0}")]
    NamingConvention(String),
    #[error("missing verification artifact: {0}")]
    MissingVerificationArtifact(String),
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("unsafe archive entry `{0}`")]
    UnsafeArchiveEntry(String),
    #[error("manifest validation failed: {0}")]
    ManifestValidation(String),
    #[error("production index cannot resolve {0}")]
    IndexResolution(String),
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    #[error("pack store failure: {0}")]
    Store(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PackError {
    /// Stable machine-readable code, used as the `source` of log entries.
    pub fn code(&self) -> &'static str {
        match self {
            PackError::NamingConvention(_) => "naming_convention",
            PackError::MissingVerificationArtifact(_) => "missing_verification_artifact",
            PackError::ChecksumMismatch { .. } => "checksum_mismatch",
            PackError::UnsafeArchiveEntry(_) => "unsafe_archive_entry",
            PackError::ManifestValidation(_) => "manifest_validation",
            PackError::IndexResolution(_) => "index_resolution",
            PackError::InvalidArchive(_) => "invalid_archive",
            PackError::Store(_) => "store",
            PackError::Io(_) => "io",
        }
    }
}
