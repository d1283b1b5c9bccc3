use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cancellation::CancellationToken;
use crate::errors::{Result, UpdaterError};
use crate::models::{ContentFile, ContentSummary, DiffOperation, DiffSummary, VersionId};
use crate::progress::{DownloadReporter, ProgressAggregator, StatusWeights, StepReporter};
use crate::services::diff_patcher::DiffPatcher;
use crate::services::disk_space::{content_requirement, diff_requirement, ensure_available};
use crate::services::integrity::scan_blocking;
use crate::services::local_state::LocalInstallState;
use crate::services::resource_acquirer::ResourceAcquirer;
use crate::services::unarchiver::extract_zip_blocking;
use crate::updater::context::{CommandState, PackageKind, UpdaterContext};
use crate::updater::pipeline::UpdaterCommand;
use crate::updater::strategy::{ResolvedStrategy, StrategyType};
use crate::utils::file::{copy_atomic, FileManager};

fn prepared<'a, T>(slot: &'a Option<T>, command: &str) -> Result<&'a T> {
    slot.as_ref().ok_or_else(|| {
        UpdaterError::Programming(format!("{} executed before prepare", command))
    })
}

async fn run_blocking<F>(label: &'static str, task: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| UpdaterError::Programming(format!("{} join error: {}", label, err)))?
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn resolve_in(files: &FileManager, relative: &str) -> Result<PathBuf> {
    files.resolve(relative).ok_or_else(|| {
        UpdaterError::InvalidResource(format!("unsafe path in summary: {}", relative))
    })
}

fn staging_dir(ctx: &UpdaterContext, kind: PackageKind, version: VersionId) -> PathBuf {
    ctx.work_dir()
        .join(format!("{}-{}-unpacked", kind.label(), version))
}

async fn unpack_package(
    ctx: &UpdaterContext,
    state: &CommandState,
    kind: PackageKind,
    version: VersionId,
    reporter: &StepReporter,
    token: &CancellationToken,
) -> Result<PathBuf> {
    let package = state.package(kind, version).cloned().ok_or_else(|| {
        UpdaterError::Programming(format!(
            "{} package for version {} was not acquired",
            kind.label(),
            version
        ))
    })?;
    let staging = staging_dir(ctx, kind, version);
    if staging.exists() {
        tokio::fs::remove_dir_all(&staging).await?;
    }
    extract_zip_blocking(package, staging.clone(), token.clone(), Some(reporter.clone())).await?;
    Ok(staging)
}

/// Copies `entries` from an unpacked package into the install dir, recording
/// each file at `version` as it lands.
fn copy_from_staging(
    files: FileManager,
    local_state: Arc<LocalInstallState>,
    staging: PathBuf,
    entries: Vec<ContentFile>,
    version: VersionId,
    token: CancellationToken,
    reporter: StepReporter,
) -> Result<()> {
    let staged = FileManager::new(staging);
    let total = entries.len();
    for (index, file) in entries.iter().enumerate() {
        token.throw_if_cancelled()?;
        let target = resolve_in(&files, &file.path)?;
        if file.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            let source = resolve_in(&staged, &file.path)?;
            if !source.is_file() {
                return Err(UpdaterError::IntegrityMismatch(format!(
                    "package is missing {}",
                    file.path
                )));
            }
            local_state.commit_file(&file.path, version, || {
                copy_atomic(&source, &target)?;
                Ok(())
            })?;
        }
        reporter.set_ratio(index + 1, total);
    }
    reporter.set(1.0);
    Ok(())
}

#[derive(Default)]
pub struct ValidateLicense {
    reporter: Option<StepReporter>,
}

impl ValidateLicense {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UpdaterCommand for ValidateLicense {
    fn name(&self) -> &'static str {
        "validate_license"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.reporter = Some(progress.add_step_progress(StatusWeights::fixed_step()));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()> {
        let reporter = prepared(&self.reporter, self.name())?;
        if !state.license_checked {
            let secret = ctx.license.validate(token).await?;
            state.key_secret = secret.map(|license| license.secret);
            state.license_checked = true;
        }
        reporter.set(1.0);
        Ok(())
    }
}

pub struct CheckDiskSpace {
    required: u64,
    reporter: Option<StepReporter>,
}

impl CheckDiskSpace {
    pub fn new(required: u64) -> Self {
        Self {
            required,
            reporter: None,
        }
    }
}

#[async_trait]
impl UpdaterCommand for CheckDiskSpace {
    fn name(&self) -> &'static str {
        "check_disk_space"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.reporter = Some(progress.add_step_progress(StatusWeights::fixed_step()));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        _state: &mut CommandState,
        _token: &CancellationToken,
    ) -> Result<()> {
        let reporter = prepared(&self.reporter, self.name())?;
        let install_dir = ctx.install_dir().to_path_buf();
        let required = self.required;
        run_blocking("disk space probe", move || {
            ensure_available(&install_dir, required)
        })
        .await?;
        reporter.set(1.0);
        Ok(())
    }
}

/// Deletes every tracked file and the directories left empty.
#[derive(Default)]
pub struct Uninstall {
    reporter: Option<StepReporter>,
}

impl Uninstall {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UpdaterCommand for Uninstall {
    fn name(&self) -> &'static str {
        "uninstall"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.reporter = Some(progress.add_step_progress(StatusWeights::fixed_step()));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        _state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()> {
        let reporter = prepared(&self.reporter, self.name())?.clone();
        let files = ctx.files.clone();
        let local_state = ctx.local_state.clone();
        let token = token.clone();
        run_blocking("uninstall", move || {
            let tracked = local_state.tracked_files();
            let total = tracked.len();
            let mut parents = Vec::new();
            for (index, relative) in tracked.iter().enumerate() {
                token.throw_if_cancelled()?;
                match files.resolve(relative) {
                    Some(path) => {
                        local_state.forget_file(relative, || remove_if_exists(&path))?;
                        if let Some(parent) = path.parent() {
                            parents.push(parent.to_path_buf());
                        }
                    }
                    None => {
                        tracing::warn!("forgetting unsafe tracked path={}", relative);
                        local_state.forget_file(relative, || Ok(()))?;
                    }
                }
                reporter.set_ratio(index + 1, total);
            }
            parents.sort();
            parents.dedup();
            parents.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
            for dir in parents {
                files.remove_empty_dirs(&dir);
            }
            tracing::info!("uninstalled files={}", total);
            reporter.set(1.0);
            Ok(())
        })
        .await
    }
}

/// Downloads one package into the work dir and records its path.
pub struct AcquireResource {
    kind: PackageKind,
    version: VersionId,
    size: u64,
    reporter: Option<DownloadReporter>,
}

impl AcquireResource {
    pub fn new(kind: PackageKind, version: VersionId, size: u64) -> Self {
        Self {
            kind,
            version,
            size,
            reporter: None,
        }
    }
}

#[async_trait]
impl UpdaterCommand for AcquireResource {
    fn name(&self) -> &'static str {
        "acquire_resource"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.reporter = Some(progress.add_download_progress(StatusWeights::resource_download(
            self.size,
        )));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()> {
        let reporter = prepared(&self.reporter, self.name())?;
        let key_secret = state.key_secret.as_deref();
        let resource = match self.kind {
            PackageKind::Content => ctx.remote.content_resource(self.version, key_secret).await?,
            PackageKind::Diff => ctx.remote.diff_resource(self.version, key_secret).await?,
        };

        let work_dir = ctx.work_dir();
        tokio::fs::create_dir_all(&work_dir).await?;
        let dest = work_dir.join(format!("{}-{}.package", self.kind.label(), self.version));
        tracing::info!(
            "acquiring package kind={} version={} size={} dest={}",
            self.kind.label(),
            self.version,
            resource.size,
            dest.display()
        );
        let acquirer = ResourceAcquirer::new(ctx.transports.clone());
        acquirer
            .download(&dest, &resource, ctx.allow_torrent(), reporter, token)
            .await?;
        state.packages.insert((self.kind, self.version), dest);
        Ok(())
    }
}

pub struct InstallContent {
    summary: ContentSummary,
    unarchive: Option<StepReporter>,
    copy: Option<StepReporter>,
}

impl InstallContent {
    pub fn new(summary: ContentSummary) -> Self {
        Self {
            summary,
            unarchive: None,
            copy: None,
        }
    }
}

#[async_trait]
impl UpdaterCommand for InstallContent {
    fn name(&self) -> &'static str {
        "install_content"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.unarchive = Some(
            progress.add_step_progress(StatusWeights::unarchive_package(self.summary.size)),
        );
        self.copy = Some(progress.add_step_progress(StatusWeights::copy_files(
            self.summary.uncompressed_size,
        )));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()> {
        let unarchive = prepared(&self.unarchive, self.name())?;
        let copy = prepared(&self.copy, self.name())?.clone();
        let version = self.summary.version_id;
        let staging =
            unpack_package(ctx, state, PackageKind::Content, version, unarchive, token).await?;

        let files = ctx.files.clone();
        let local_state = ctx.local_state.clone();
        let entries = self.summary.files.clone();
        let token = token.clone();
        run_blocking("install content", move || {
            copy_from_staging(files, local_state, staging, entries, version, token, copy)
        })
        .await?;
        tracing::info!(
            "installed content version={} files={}",
            version,
            self.summary.regular_files().count()
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrityMode {
    /// Fail the run when any file is broken.
    Require,
    /// Keep the report for a later repair step.
    Report,
}

pub struct CheckIntegrity {
    summary: ContentSummary,
    mode: IntegrityMode,
    reporter: Option<StepReporter>,
}

impl CheckIntegrity {
    pub fn new(summary: ContentSummary, mode: IntegrityMode) -> Self {
        Self {
            summary,
            mode,
            reporter: None,
        }
    }
}

#[async_trait]
impl UpdaterCommand for CheckIntegrity {
    fn name(&self) -> &'static str {
        "check_integrity"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.reporter = Some(progress.add_step_progress(StatusWeights::check_integrity(
            self.summary.total_file_size(),
        )));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()> {
        let reporter = prepared(&self.reporter, self.name())?;
        let report = scan_blocking(
            ctx.integrity,
            ctx.install_dir().to_path_buf(),
            ctx.local_state.clone(),
            self.summary.clone(),
            token.clone(),
            Some(reporter.clone()),
        )
        .await?;
        match self.mode {
            IntegrityMode::Require if !report.is_ok() => {
                Err(UpdaterError::IntegrityMismatch(format!(
                    "{} of {} files broken for version {}",
                    report.broken_count(),
                    report.files.len(),
                    report.version_id
                )))
            }
            IntegrityMode::Require => Ok(()),
            IntegrityMode::Report => {
                state.integrity_report = Some(report);
                Ok(())
            }
        }
    }
}

/// Applies one diff package on top of the previous version.
pub struct InstallDiff {
    summary: DiffSummary,
    unarchive: Option<StepReporter>,
    install: Option<StepReporter>,
}

impl InstallDiff {
    pub fn new(summary: DiffSummary) -> Self {
        Self {
            summary,
            unarchive: None,
            install: None,
        }
    }
}

fn apply_diff_entries(
    files: FileManager,
    local_state: Arc<LocalInstallState>,
    patcher: Arc<dyn DiffPatcher>,
    staging: PathBuf,
    summary: DiffSummary,
    token: CancellationToken,
    reporter: StepReporter,
) -> Result<()> {
    let staged = FileManager::new(staging);
    let version = summary.version_id;
    let total = summary.entries.len();
    let mut removed_dirs = Vec::new();

    for (index, entry) in summary.entries.iter().enumerate() {
        token.throw_if_cancelled()?;
        let target = resolve_in(&files, &entry.path)?;
        match (entry.operation, entry.is_dir()) {
            (DiffOperation::Add, true) => fs::create_dir_all(&target)?,
            (DiffOperation::Modify, true) => {}
            (DiffOperation::Remove, true) => removed_dirs.push(target),
            (DiffOperation::Add, false) => {
                let source = resolve_in(&staged, &entry.path)?;
                if !source.is_file() {
                    return Err(UpdaterError::IntegrityMismatch(format!(
                        "diff package is missing {}",
                        entry.path
                    )));
                }
                local_state.commit_file(&entry.path, version, || {
                    copy_atomic(&source, &target)?;
                    Ok(())
                })?;
            }
            (DiffOperation::Modify, false) => {
                let delta = resolve_in(&staged, &entry.path)?;
                if !delta.is_file() {
                    return Err(UpdaterError::PatchFailed(format!(
                        "diff package has no delta for {}",
                        entry.path
                    )));
                }
                local_state.commit_file(&entry.path, version, || patcher.apply(&target, &delta))?;
            }
            (DiffOperation::Remove, false) => {
                local_state.forget_file(&entry.path, || remove_if_exists(&target))?;
                if let Some(parent) = target.parent() {
                    removed_dirs.push(parent.to_path_buf());
                }
            }
        }
        reporter.set_ratio(index + 1, total);
    }

    removed_dirs.sort();
    removed_dirs.dedup();
    removed_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in removed_dirs {
        files.remove_empty_dirs(&dir);
    }
    local_state.set_all_versions(version)?;
    reporter.set(1.0);
    Ok(())
}

#[async_trait]
impl UpdaterCommand for InstallDiff {
    fn name(&self) -> &'static str {
        "install_diff"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.unarchive = Some(
            progress.add_step_progress(StatusWeights::unarchive_package(self.summary.size)),
        );
        self.install = Some(progress.add_step_progress(StatusWeights::install_diff(
            self.summary.uncompressed_size,
        )));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()> {
        let unarchive = prepared(&self.unarchive, self.name())?;
        let install = prepared(&self.install, self.name())?.clone();
        let version = self.summary.version_id;
        let staging =
            unpack_package(ctx, state, PackageKind::Diff, version, unarchive, token).await?;

        let files = ctx.files.clone();
        let local_state = ctx.local_state.clone();
        let patcher = ctx.patcher.clone();
        let summary = self.summary.clone();
        let token = token.clone();
        run_blocking("install diff", move || {
            apply_diff_entries(files, local_state, patcher, staging, summary, token, install)
        })
        .await?;
        tracing::info!(
            "installed diff version={} entries={}",
            version,
            self.summary.entries.len()
        );
        Ok(())
    }
}

/// Restores the files a previous integrity scan flagged, from a content package.
pub struct RepairFiles {
    summary: ContentSummary,
    unarchive: Option<StepReporter>,
    copy: Option<StepReporter>,
}

impl RepairFiles {
    pub fn new(summary: ContentSummary) -> Self {
        Self {
            summary,
            unarchive: None,
            copy: None,
        }
    }
}

#[async_trait]
impl UpdaterCommand for RepairFiles {
    fn name(&self) -> &'static str {
        "repair_files"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.unarchive = Some(
            progress.add_step_progress(StatusWeights::unarchive_package(self.summary.size)),
        );
        self.copy = Some(progress.add_step_progress(StatusWeights::copy_files(
            self.summary.uncompressed_size,
        )));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()> {
        let unarchive = prepared(&self.unarchive, self.name())?;
        let copy = prepared(&self.copy, self.name())?.clone();
        let report = state.integrity_report.as_ref().ok_or_else(|| {
            UpdaterError::Programming("repair requires an integrity report".to_string())
        })?;
        let broken: Vec<ContentFile> = report
            .broken_files()
            .filter_map(|broken| self.summary.file(&broken.path).cloned())
            .collect();
        if broken.is_empty() {
            unarchive.set(1.0);
            copy.set(1.0);
            return Ok(());
        }

        let version = self.summary.version_id;
        let staging =
            unpack_package(ctx, state, PackageKind::Content, version, unarchive, token).await?;
        let files = ctx.files.clone();
        let local_state = ctx.local_state.clone();
        let count = broken.len();
        let token = token.clone();
        run_blocking("repair files", move || {
            copy_from_staging(files, local_state, staging, broken, version, token, copy)
        })
        .await?;
        tracing::info!("repaired files={} version={}", count, version);
        Ok(())
    }
}

/// Removes downloaded packages and their unpacked contents.
#[derive(Default)]
pub struct Cleanup {
    reporter: Option<StepReporter>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UpdaterCommand for Cleanup {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn prepare(&mut self, progress: &ProgressAggregator) {
        self.reporter = Some(progress.add_step_progress(StatusWeights::fixed_step()));
    }

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        _state: &mut CommandState,
        _token: &CancellationToken,
    ) -> Result<()> {
        let reporter = prepared(&self.reporter, self.name())?;
        let work_dir = ctx.work_dir();
        match tokio::fs::remove_dir_all(&work_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("cleanup failed dir={} err={}", work_dir.display(), err),
        }
        reporter.set(1.0);
        Ok(())
    }
}

/// The ordered command list for a resolved strategy.
pub fn build_commands(resolved: &ResolvedStrategy) -> Vec<Box<dyn UpdaterCommand>> {
    let latest = &resolved.latest_summary;
    let mut commands: Vec<Box<dyn UpdaterCommand>> = Vec::new();
    match resolved.strategy {
        StrategyType::Content => {
            commands.push(Box::new(ValidateLicense::new()));
            commands.push(Box::new(CheckDiskSpace::new(content_requirement(
                latest.size,
                latest.uncompressed_size,
            ))));
            commands.push(Box::new(Uninstall::new()));
            commands.push(Box::new(AcquireResource::new(
                PackageKind::Content,
                latest.version_id,
                latest.size,
            )));
            commands.push(Box::new(InstallContent::new(latest.clone())));
            commands.push(Box::new(Cleanup::new()));
        }
        StrategyType::Diff => {
            let packages: Vec<(u64, u64)> = resolved
                .diffs
                .iter()
                .map(|diff| (diff.size, diff.uncompressed_size))
                .collect();
            commands.push(Box::new(ValidateLicense::new()));
            commands.push(Box::new(CheckDiskSpace::new(diff_requirement(
                &packages,
                latest.biggest_file_size(),
            ))));
            if let Some(installed) = resolved.installed_summary.as_ref() {
                commands.push(Box::new(CheckIntegrity::new(
                    installed.clone(),
                    IntegrityMode::Require,
                )));
            }
            for diff in &resolved.diffs {
                commands.push(Box::new(AcquireResource::new(
                    PackageKind::Diff,
                    diff.version_id,
                    diff.size,
                )));
                commands.push(Box::new(InstallDiff::new(diff.clone())));
            }
            commands.push(Box::new(Cleanup::new()));
        }
        StrategyType::Repair => {
            commands.push(Box::new(ValidateLicense::new()));
            commands.push(Box::new(CheckIntegrity::new(
                latest.clone(),
                IntegrityMode::Report,
            )));
            commands.push(Box::new(AcquireResource::new(
                PackageKind::Content,
                latest.version_id,
                latest.size,
            )));
            commands.push(Box::new(RepairFiles::new(latest.clone())));
            commands.push(Box::new(Cleanup::new()));
        }
        StrategyType::Empty => {
            commands.push(Box::new(CheckIntegrity::new(
                latest.clone(),
                IntegrityMode::Require,
            )));
        }
    }
    commands
}
