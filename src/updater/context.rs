use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::UpdaterConfig;
use crate::errors::Result;
use crate::models::VersionId;
use crate::progress::ProgressAggregator;
use crate::services::diff_patcher::{AtomicDiffPatcher, DiffPatcher};
use crate::services::integrity::{IntegrityChecker, IntegrityReport};
use crate::services::license_service::{LicenseCache, LicensePrompt, LicenseValidator};
use crate::services::local_state::LocalInstallState;
use crate::services::remote_meta::RemoteMetaData;
use crate::services::resource_acquirer::Transports;
use crate::utils::file::FileManager;

const WORK_DIR_NAME: &str = "downloads";

/// Everything a run needs, shared by all commands.
pub struct UpdaterContext {
    pub files: FileManager,
    pub data_dir: PathBuf,
    pub config: UpdaterConfig,
    pub remote: Arc<dyn RemoteMetaData>,
    pub local_state: Arc<LocalInstallState>,
    pub license: Arc<LicenseValidator>,
    pub transports: Transports,
    pub patcher: Arc<dyn DiffPatcher>,
    pub integrity: IntegrityChecker,
    pub progress: ProgressAggregator,
}

impl UpdaterContext {
    /// Opens the install state and license cache under `data_dir` and builds
    /// transports and patcher from `config`.
    pub fn new(
        install_dir: PathBuf,
        data_dir: PathBuf,
        config: UpdaterConfig,
        remote: Arc<dyn RemoteMetaData>,
        prompt: Arc<dyn LicensePrompt>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&install_dir)?;
        std::fs::create_dir_all(&data_dir)?;
        let local_state = Arc::new(LocalInstallState::in_dir(&data_dir)?);
        let cache = Arc::new(LicenseCache::open(&data_dir)?);
        let license = Arc::new(LicenseValidator::new(
            remote.clone(),
            prompt,
            cache,
            local_state.clone(),
        ));
        let transports = Transports::from_config(&config);
        let patcher: Arc<dyn DiffPatcher> = Arc::new(AtomicDiffPatcher::from_library(
            config.rsync_library_path.as_deref(),
        ));
        let integrity = IntegrityChecker::new(config.hash_verification);

        Ok(Self {
            files: FileManager::new(install_dir),
            data_dir,
            config,
            remote,
            local_state,
            license,
            transports,
            patcher,
            integrity,
            progress: ProgressAggregator::new(),
        })
    }

    pub fn with_transports(mut self, transports: Transports) -> Self {
        self.transports = transports;
        self
    }

    pub fn install_dir(&self) -> &Path {
        self.files.install_dir()
    }

    /// Scratch space for packages and their unpacked contents.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join(WORK_DIR_NAME)
    }

    pub fn allow_torrent(&self) -> bool {
        self.config.allow_torrent
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PackageKind {
    Content,
    Diff,
}

impl PackageKind {
    pub fn label(&self) -> &'static str {
        match self {
            PackageKind::Content => "content",
            PackageKind::Diff => "diff",
        }
    }
}

/// Values handed from one command to the next within a run.
#[derive(Default, Debug)]
pub struct CommandState {
    pub license_checked: bool,
    pub key_secret: Option<String>,
    pub packages: HashMap<(PackageKind, VersionId), PathBuf>,
    pub integrity_report: Option<IntegrityReport>,
}

impl CommandState {
    pub fn package(&self, kind: PackageKind, version: VersionId) -> Option<&PathBuf> {
        self.packages.get(&(kind, version))
    }
}
