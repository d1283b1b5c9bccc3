use serde::Serialize;

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::models::{ContentSummary, DiffSummary, VersionId};
use crate::services::integrity::verify_blocking;
use crate::updater::context::UpdaterContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Content,
    Diff,
    Repair,
    Empty,
}

/// The chosen strategy plus the metadata needed to build its commands.
#[derive(Clone, Debug)]
pub struct ResolvedStrategy {
    pub strategy: StrategyType,
    pub installed: Option<VersionId>,
    pub latest: VersionId,
    pub latest_summary: ContentSummary,
    /// Summary of the installed version, only for [`StrategyType::Diff`].
    pub installed_summary: Option<ContentSummary>,
    /// Diff summaries for `(installed, latest]`, only for [`StrategyType::Diff`].
    pub diffs: Vec<DiffSummary>,
}

impl ResolvedStrategy {
    fn new(
        strategy: StrategyType,
        installed: Option<VersionId>,
        latest_summary: ContentSummary,
    ) -> Self {
        Self {
            strategy,
            installed,
            latest: latest_summary.version_id,
            latest_summary,
            installed_summary: None,
            diffs: Vec::new(),
        }
    }

    /// Same inputs, forced to a full content install.
    pub fn as_content(&self) -> Self {
        Self {
            strategy: StrategyType::Content,
            installed_summary: None,
            diffs: Vec::new(),
            ..self.clone()
        }
    }
}

pub struct StrategyResolver<'a> {
    ctx: &'a UpdaterContext,
}

impl<'a> StrategyResolver<'a> {
    pub fn new(ctx: &'a UpdaterContext) -> Self {
        Self { ctx }
    }

    async fn is_intact(&self, summary: &ContentSummary) -> Result<bool> {
        verify_blocking(
            self.ctx.integrity,
            self.ctx.install_dir().to_path_buf(),
            self.ctx.local_state.clone(),
            summary.clone(),
        )
        .await
    }

    pub async fn resolve(&self, token: &CancellationToken) -> Result<ResolvedStrategy> {
        token.throw_if_cancelled()?;
        let latest = self.ctx.remote.latest_version_id().await?;
        let mut latest_summary = self.ctx.remote.content_summary(latest).await?;
        latest_summary.version_id = latest;

        let installed = self.ctx.local_state.common_version();
        let resolved = match installed {
            None => {
                if self.ctx.local_state.is_empty() {
                    tracing::info!("strategy: not installed, full content");
                } else {
                    tracing::info!("strategy: files at mixed versions, full content");
                }
                ResolvedStrategy::new(StrategyType::Content, None, latest_summary)
            }
            Some(installed) if installed > latest => {
                tracing::info!(
                    "strategy: installed={} newer than latest={}, full content",
                    installed,
                    latest
                );
                ResolvedStrategy::new(StrategyType::Content, Some(installed), latest_summary)
            }
            Some(installed) if installed == latest => {
                token.throw_if_cancelled()?;
                if self.is_intact(&latest_summary).await? {
                    tracing::info!("strategy: version={} up to date", installed);
                    ResolvedStrategy::new(StrategyType::Empty, Some(installed), latest_summary)
                } else {
                    tracing::info!("strategy: version={} damaged, repair", installed);
                    ResolvedStrategy::new(StrategyType::Repair, Some(installed), latest_summary)
                }
            }
            Some(installed) => {
                self.resolve_upgrade(installed, latest_summary, token)
                    .await?
            }
        };
        Ok(resolved)
    }

    async fn resolve_upgrade(
        &self,
        installed: VersionId,
        latest_summary: ContentSummary,
        token: &CancellationToken,
    ) -> Result<ResolvedStrategy> {
        let latest = latest_summary.version_id;
        let mut diffs = Vec::new();
        for version in (installed + 1)..=latest {
            token.throw_if_cancelled()?;
            match self.ctx.remote.diff_summary(version).await {
                Ok(mut summary) => {
                    summary.version_id = version;
                    diffs.push(summary);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    tracing::info!(
                        "strategy: diff for version={} unavailable ({}), full content",
                        version,
                        err
                    );
                    return Ok(ResolvedStrategy::new(
                        StrategyType::Content,
                        Some(installed),
                        latest_summary,
                    ));
                }
            }
        }

        let diff_total: u64 = diffs.iter().map(|diff| diff.size).sum();
        let within_cap = self
            .ctx
            .config
            .max_cumulative_diff_size
            .map(|cap| diff_total <= cap)
            .unwrap_or(true);
        if diff_total >= latest_summary.size || !within_cap {
            tracing::info!(
                "strategy: diffs={} bytes vs content={} bytes (cap ok={}), full content",
                diff_total,
                latest_summary.size,
                within_cap
            );
            return Ok(ResolvedStrategy::new(
                StrategyType::Content,
                Some(installed),
                latest_summary,
            ));
        }

        let installed_summary = match self.ctx.remote.content_summary(installed).await {
            Ok(mut summary) => {
                summary.version_id = installed;
                summary
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::info!(
                    "strategy: summary for installed version={} unavailable ({}), full content",
                    installed,
                    err
                );
                return Ok(ResolvedStrategy::new(
                    StrategyType::Content,
                    Some(installed),
                    latest_summary,
                ));
            }
        };
        if self.ctx.config.check_consistency_before_diff {
            token.throw_if_cancelled()?;
            if !self.is_intact(&installed_summary).await? {
                tracing::info!(
                    "strategy: installed version={} inconsistent, full content",
                    installed
                );
                return Ok(ResolvedStrategy::new(
                    StrategyType::Content,
                    Some(installed),
                    latest_summary,
                ));
            }
        }

        tracing::info!(
            "strategy: diff from={} to={} bytes={}",
            installed,
            latest,
            diff_total
        );
        let mut resolved =
            ResolvedStrategy::new(StrategyType::Diff, Some(installed), latest_summary);
        resolved.installed_summary = Some(installed_summary);
        resolved.diffs = diffs;
        Ok(resolved)
    }
}
