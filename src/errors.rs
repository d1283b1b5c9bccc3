use std::fmt;
use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),
    #[error("Patch failed: {0}")]
    PatchFailed(String),
    #[error("License rejected: {0}")]
    LicenseRejected(String),
    #[error("Invalid resource: {0}")]
    InvalidResource(String),
    #[error("Programming error: {0}")]
    Programming(String),
    #[error("Cancellation callbacks failed: {0} callback(s) panicked")]
    CallbackFailed(usize),
    #[error("Not enough disk space: {0}")]
    DiskSpace(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Coarse classification surfaced with a failed run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Cancelled,
    TransportFailure,
    IntegrityMismatch,
    PatchFailed,
    LicenseRejected,
    InvalidResource,
    ProgrammingError,
    DiskSpace,
    Io,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Cancelled => "cancelled",
            FailureKind::TransportFailure => "transport_failure",
            FailureKind::IntegrityMismatch => "integrity_mismatch",
            FailureKind::PatchFailed => "patch_failed",
            FailureKind::LicenseRejected => "license_rejected",
            FailureKind::InvalidResource => "invalid_resource",
            FailureKind::ProgrammingError => "programming_error",
            FailureKind::DiskSpace => "disk_space",
            FailureKind::Io => "io",
            FailureKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

impl UpdaterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            UpdaterError::Cancelled => FailureKind::Cancelled,
            UpdaterError::Network(_)
            | UpdaterError::Transport(_)
            | UpdaterError::HttpStatus { .. } => FailureKind::TransportFailure,
            UpdaterError::IntegrityMismatch(_) => FailureKind::IntegrityMismatch,
            UpdaterError::PatchFailed(_) => FailureKind::PatchFailed,
            UpdaterError::LicenseRejected(_) => FailureKind::LicenseRejected,
            UpdaterError::InvalidResource(_) => FailureKind::InvalidResource,
            UpdaterError::Programming(_) => FailureKind::ProgrammingError,
            UpdaterError::DiskSpace(_) => FailureKind::DiskSpace,
            UpdaterError::Io(_) => FailureKind::Io,
            UpdaterError::CallbackFailed(_)
            | UpdaterError::Serde(_)
            | UpdaterError::Archive(_)
            | UpdaterError::Crypto(_)
            | UpdaterError::Config(_) => FailureKind::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdaterError::Cancelled)
    }

    /// HTTP status carried by the error, when the failure came from a response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            UpdaterError::HttpStatus { status, .. } => Some(*status),
            UpdaterError::Network(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}
