use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationToken;
use crate::errors::{Result, UpdaterError};
use crate::models::{ContentFile, ContentSummary, VersionId};
use crate::progress::StepReporter;
use crate::services::local_state::LocalInstallState;
use crate::utils::file::{compute_sha256_file, hashes_match, FileManager};

const DEFAULT_HASH_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// Whether content hashes are compared in addition to sizes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HashVerification {
    Never,
    Always,
    /// Hash only when the total content size is at most `threshold` bytes.
    BelowSize { threshold: u64 },
}

impl Default for HashVerification {
    fn default() -> Self {
        HashVerification::BelowSize {
            threshold: DEFAULT_HASH_THRESHOLD,
        }
    }
}

impl HashVerification {
    pub fn applies_to(&self, total_size: u64) -> bool {
        match self {
            HashVerification::Never => false,
            HashVerification::Always => true,
            HashVerification::BelowSize { threshold } => total_size <= *threshold,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileIntegrityStatus {
    Ok,
    MissingData,
    MissingMetaData,
    InvalidVersion,
    InvalidSize,
    InvalidHash,
}

#[derive(Serialize, Clone, Debug)]
pub struct FileIntegrity {
    pub path: String,
    pub status: FileIntegrityStatus,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct IntegrityReport {
    pub version_id: VersionId,
    pub files: Vec<FileIntegrity>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.files
            .iter()
            .all(|file| file.status == FileIntegrityStatus::Ok)
    }

    pub fn broken_files(&self) -> impl Iterator<Item = &FileIntegrity> {
        self.files
            .iter()
            .filter(|file| file.status != FileIntegrityStatus::Ok)
    }

    pub fn broken_count(&self) -> usize {
        self.broken_files().count()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IntegrityChecker {
    verification: HashVerification,
}

impl IntegrityChecker {
    pub fn new(verification: HashVerification) -> Self {
        Self { verification }
    }

    fn check_file(
        &self,
        files: &FileManager,
        state: &LocalInstallState,
        file: &ContentFile,
        version: VersionId,
        with_hash: bool,
    ) -> FileIntegrityStatus {
        let Some(target) = files.resolve(&file.path) else {
            return FileIntegrityStatus::MissingData;
        };
        let metadata = match std::fs::metadata(&target) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => return FileIntegrityStatus::MissingData,
        };

        match state.file_version(&file.path) {
            None => return FileIntegrityStatus::MissingMetaData,
            Some(installed) if installed != version => {
                return FileIntegrityStatus::InvalidVersion
            }
            Some(_) => {}
        }

        if metadata.len() != file.size {
            return FileIntegrityStatus::InvalidSize;
        }

        if with_hash && !file.hash.is_empty() {
            match compute_sha256_file(&target) {
                Ok(actual) if hashes_match(&actual, &file.hash) => {}
                Ok(_) => return FileIntegrityStatus::InvalidHash,
                Err(err) => {
                    tracing::warn!("integrity hash read failed path={} err={}", file.path, err);
                    return FileIntegrityStatus::InvalidHash;
                }
            }
        }

        FileIntegrityStatus::Ok
    }

    /// True when every file of `summary` is present, tracked at its version,
    /// sized correctly and (when enabled) hashes match. Stops at the first
    /// failure and never touches the disk or the state.
    pub fn verify(&self, root: &Path, state: &LocalInstallState, summary: &ContentSummary) -> bool {
        let files = FileManager::new(root.to_path_buf());
        let with_hash = self.verification.applies_to(summary.total_file_size());
        for file in summary.regular_files() {
            let status = self.check_file(&files, state, file, summary.version_id, with_hash);
            if status != FileIntegrityStatus::Ok {
                tracing::info!(
                    "integrity check failed version={} path={} status={:?}",
                    summary.version_id,
                    file.path,
                    status
                );
                return false;
            }
        }
        true
    }

    /// Classifies every file of `summary`.
    pub fn scan(
        &self,
        root: &Path,
        state: &LocalInstallState,
        summary: &ContentSummary,
        token: &CancellationToken,
        reporter: Option<&StepReporter>,
    ) -> Result<IntegrityReport> {
        let files = FileManager::new(root.to_path_buf());
        let with_hash = self.verification.applies_to(summary.total_file_size());
        let entries: Vec<&ContentFile> = summary.regular_files().collect();

        let mut report = IntegrityReport {
            version_id: summary.version_id,
            files: Vec::with_capacity(entries.len()),
        };
        for (index, file) in entries.iter().enumerate() {
            token.throw_if_cancelled()?;
            let status = self.check_file(&files, state, file, summary.version_id, with_hash);
            report.files.push(FileIntegrity {
                path: file.path.clone(),
                status,
            });
            if let Some(reporter) = reporter {
                reporter.set_ratio(index + 1, entries.len());
            }
        }
        if let Some(reporter) = reporter {
            reporter.set(1.0);
        }

        tracing::info!(
            "integrity scan version={} files={} broken={} hashed={}",
            summary.version_id,
            report.files.len(),
            report.broken_count(),
            with_hash
        );
        Ok(report)
    }
}

/// Runs [`IntegrityChecker::scan`] on the blocking pool.
pub async fn scan_blocking(
    checker: IntegrityChecker,
    root: PathBuf,
    state: Arc<LocalInstallState>,
    summary: ContentSummary,
    token: CancellationToken,
    reporter: Option<StepReporter>,
) -> Result<IntegrityReport> {
    tokio::task::spawn_blocking(move || {
        checker.scan(&root, &state, &summary, &token, reporter.as_ref())
    })
    .await
    .map_err(|err| UpdaterError::Programming(format!("integrity scan join error: {err}")))?
}

/// Runs [`IntegrityChecker::verify`] on the blocking pool.
pub async fn verify_blocking(
    checker: IntegrityChecker,
    root: PathBuf,
    state: Arc<LocalInstallState>,
    summary: ContentSummary,
) -> Result<bool> {
    tokio::task::spawn_blocking(move || checker.verify(&root, &state, &summary))
        .await
        .map_err(|err| UpdaterError::Programming(format!("integrity check join error: {err}")))
}
