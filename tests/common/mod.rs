#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

use patch_updater::cancellation::CancellationToken;
use patch_updater::config::UpdaterConfig;
use patch_updater::errors::{Result, UpdaterError};
use patch_updater::models::{
    AppInfo, ContentFile, ContentSummary, DiffSummary, RemoteResource, VersionId,
};
use patch_updater::progress::DownloadReporter;
use patch_updater::services::license_service::{LicenseMessage, LicensePrompt, PromptResult};
use patch_updater::services::remote_meta::RemoteMetaData;
use patch_updater::services::transports::{Transport, TransportTier};
use patch_updater::services::Transports;
use patch_updater::utils::file::compute_sha256_hex;
use patch_updater::UpdaterContext;

/// In-memory catalogue of versions and package resources.
#[derive(Default)]
pub struct FakeRemote {
    pub use_keys: bool,
    pub latest: VersionId,
    pub content: HashMap<VersionId, ContentSummary>,
    pub diffs: HashMap<VersionId, DiffSummary>,
    pub content_resources: HashMap<VersionId, RemoteResource>,
    pub diff_resources: HashMap<VersionId, RemoteResource>,
    pub key_requests: AtomicUsize,
}

fn not_found<T>(what: &str) -> Result<T> {
    Err(UpdaterError::HttpStatus {
        status: 404,
        message: format!("{} not found", what),
    })
}

#[async_trait]
impl RemoteMetaData for FakeRemote {
    async fn latest_version_id(&self) -> Result<VersionId> {
        Ok(self.latest)
    }

    async fn app_info(&self) -> Result<AppInfo> {
        Ok(AppInfo {
            id: 1,
            name: "demo".to_string(),
            use_keys: self.use_keys,
            current_version: self.latest,
            ..AppInfo::default()
        })
    }

    async fn content_summary(&self, version_id: VersionId) -> Result<ContentSummary> {
        match self.content.get(&version_id) {
            Some(summary) => Ok(summary.clone()),
            None => not_found("content summary"),
        }
    }

    async fn diff_summary(&self, version_id: VersionId) -> Result<DiffSummary> {
        match self.diffs.get(&version_id) {
            Some(summary) => Ok(summary.clone()),
            None => not_found("diff summary"),
        }
    }

    async fn key_secret(&self, key: &str, _cached_secret: Option<&str>) -> Result<String> {
        self.key_requests.fetch_add(1, Ordering::SeqCst);
        Ok(format!("secret-{}", key))
    }

    async fn content_resource(
        &self,
        version_id: VersionId,
        _key_secret: Option<&str>,
    ) -> Result<RemoteResource> {
        match self.content_resources.get(&version_id) {
            Some(resource) => Ok(resource.clone()),
            None => not_found("content resource"),
        }
    }

    async fn diff_resource(
        &self,
        version_id: VersionId,
        _key_secret: Option<&str>,
    ) -> Result<RemoteResource> {
        match self.diff_resources.get(&version_id) {
            Some(resource) => Ok(resource.clone()),
            None => not_found("diff resource"),
        }
    }
}

/// Answers every prompt with the same result and counts the calls.
pub struct FixedPrompt {
    pub result: PromptResult,
    pub shown: AtomicUsize,
}

impl FixedPrompt {
    pub fn aborting() -> Self {
        Self {
            result: PromptResult::Aborted,
            shown: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LicensePrompt for FixedPrompt {
    async fn display(&self, _message: LicenseMessage) -> PromptResult {
        self.shown.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Serves packages from memory keyed by URL.
pub struct MemoryTransport {
    tier: TransportTier,
    packages: HashMap<String, Vec<u8>>,
    pub calls: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(tier: TransportTier, packages: HashMap<String, Vec<u8>>) -> Self {
        Self {
            tier,
            packages,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty(tier: TransportTier) -> Self {
        Self::new(tier, HashMap::new())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn tier(&self) -> TransportTier {
        self.tier
    }

    async fn download(
        &self,
        dest: &Path,
        resource: &RemoteResource,
        reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        token.throw_if_cancelled()?;
        let data = resource
            .urls
            .iter()
            .find_map(|url| self.packages.get(url))
            .ok_or_else(|| UpdaterError::Transport("no such package".to_string()))?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, data)?;
        reporter.update(data.len() as u64, resource.size);
        Ok(())
    }
}

/// Peer tier whose swarm never makes progress.
pub struct StalledPeer {
    pub stall: Duration,
    pub calls: AtomicUsize,
}

impl StalledPeer {
    pub fn new(stall: Duration) -> Self {
        Self {
            stall,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for StalledPeer {
    fn tier(&self) -> TransportTier {
        TransportTier::Peer
    }

    async fn download(
        &self,
        _dest: &Path,
        _resource: &RemoteResource,
        _reporter: &DownloadReporter,
        token: &CancellationToken,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(self.stall) => Err(UpdaterError::Transport(
                "torrent progress stalled past timeout".to_string(),
            )),
            _ = token.cancelled() => Err(UpdaterError::Cancelled),
        }
    }
}

pub fn transports(
    peer: Option<Arc<dyn Transport>>,
    chunked: Arc<dyn Transport>,
    http: Arc<dyn Transport>,
) -> Transports {
    Transports {
        peer,
        chunked,
        http,
    }
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, FileOptions::default())
            .expect("start zip entry");
        writer.write_all(data).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

pub fn content_file(path: &str, data: &[u8]) -> ContentFile {
    ContentFile {
        path: path.to_string(),
        size: data.len() as u64,
        hash: compute_sha256_hex(data),
    }
}

pub fn content_summary(version_id: VersionId, package_size: u64, files: &[(&str, &[u8])]) -> ContentSummary {
    let files: Vec<ContentFile> = files
        .iter()
        .map(|(path, data)| content_file(path, data))
        .collect();
    let uncompressed_size = files.iter().map(|file| file.size).sum();
    ContentSummary {
        version_id,
        size: package_size,
        uncompressed_size,
        files,
        hash_code: String::new(),
        chunks: None,
    }
}

pub struct Workspace {
    pub root: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("temp workspace"),
        }
    }

    pub fn install_dir(&self) -> std::path::PathBuf {
        self.root.path().join("app")
    }

    pub fn data_dir(&self) -> std::path::PathBuf {
        self.root.path().join("data")
    }

    pub fn context(
        &self,
        remote: Arc<FakeRemote>,
        prompt: Arc<dyn LicensePrompt>,
        transports: Transports,
    ) -> UpdaterContext {
        UpdaterContext::new(
            self.install_dir(),
            self.data_dir(),
            UpdaterConfig::default(),
            remote,
            prompt,
        )
        .expect("updater context")
        .with_transports(transports)
    }
}
