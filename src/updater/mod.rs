//! Update orchestration: resolve a strategy, build its command list and run
//! it on one task while publishing status snapshots.

pub mod commands;
pub mod context;
pub mod pipeline;
pub mod status;
pub mod strategy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::errors::{FailureKind, Result, UpdaterError};
use crate::updater::commands::build_commands;
use crate::updater::context::{CommandState, UpdaterContext};
use crate::updater::pipeline::CommandPipeline;
use crate::updater::status::{StatusPublisher, UpdaterState, UpdaterStatus};
use crate::updater::strategy::{ResolvedStrategy, StrategyResolver, StrategyType};

/// What the caller learns about a finished run.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    Succeeded { strategy: StrategyType },
    Cancelled,
    Failed { kind: FailureKind, detail: String },
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Succeeded { .. })
    }
}

fn can_fall_back(strategy: StrategyType, err: &UpdaterError, token: &CancellationToken) -> bool {
    matches!(strategy, StrategyType::Diff | StrategyType::Repair)
        && !token.is_cancelled()
        && !matches!(
            err.kind(),
            FailureKind::Cancelled | FailureKind::ProgrammingError
        )
}

pub struct Updater {
    ctx: Arc<UpdaterContext>,
    status: StatusPublisher,
    started: AtomicBool,
}

impl Updater {
    pub fn new(ctx: UpdaterContext) -> Self {
        let status = StatusPublisher::new(ctx.progress.clone());
        Self {
            ctx: Arc::new(ctx),
            status,
            started: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &UpdaterContext {
        &self.ctx
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdaterStatus> {
        self.status.subscribe()
    }

    /// Runs the update once. Later calls fail with
    /// [`FailureKind::ProgrammingError`] without touching anything.
    pub async fn update(&self, token: &CancellationToken) -> UpdateOutcome {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::error!("update called twice on the same updater");
            return UpdateOutcome::Failed {
                kind: FailureKind::ProgrammingError,
                detail: "updater can only run once".to_string(),
            };
        }

        let ticker = self.status.start_ticker();
        self.status.set_state(UpdaterState::Resolving);
        let result = self.run(token).await;
        let _ = ticker.send(());

        let outcome = match result {
            Ok(strategy) => UpdateOutcome::Succeeded { strategy },
            Err(_) if token.is_cancelled() => UpdateOutcome::Cancelled,
            Err(err) if err.is_cancelled() => UpdateOutcome::Cancelled,
            Err(err) => UpdateOutcome::Failed {
                kind: err.kind(),
                detail: err.to_string(),
            },
        };
        let final_state = match &outcome {
            UpdateOutcome::Succeeded { .. } => UpdaterState::Succeeded,
            UpdateOutcome::Cancelled => UpdaterState::Cancelled,
            UpdateOutcome::Failed { .. } => UpdaterState::Failed,
        };
        self.status.set_command(None);
        self.status.set_state(final_state);
        match &outcome {
            UpdateOutcome::Succeeded { strategy } => {
                tracing::info!("update finished strategy={:?}", strategy)
            }
            UpdateOutcome::Cancelled => tracing::info!("update cancelled"),
            UpdateOutcome::Failed { kind, detail } => {
                tracing::error!("update failed kind={} detail={}", kind, detail)
            }
        }
        outcome
    }

    async fn run(&self, token: &CancellationToken) -> Result<StrategyType> {
        let resolved = StrategyResolver::new(&self.ctx).resolve(token).await?;
        tracing::info!(
            "update strategy={:?} installed={:?} latest={}",
            resolved.strategy,
            resolved.installed,
            resolved.latest
        );

        let mut state = CommandState::default();
        match self.run_strategy(&resolved, &mut state, token).await {
            Ok(()) => Ok(resolved.strategy),
            Err(err) if can_fall_back(resolved.strategy, &err, token) => {
                tracing::warn!(
                    "strategy={:?} failed, falling back to content: {}",
                    resolved.strategy,
                    err
                );
                self.ctx.progress.reset();
                let mut fallback_state = CommandState {
                    license_checked: state.license_checked,
                    key_secret: state.key_secret.take(),
                    ..CommandState::default()
                };
                self.run_strategy(&resolved.as_content(), &mut fallback_state, token)
                    .await?;
                Ok(StrategyType::Content)
            }
            Err(err) => Err(err),
        }
    }

    async fn run_strategy(
        &self,
        resolved: &ResolvedStrategy,
        state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()> {
        self.status.set_strategy(resolved.strategy);
        let mut pipeline = CommandPipeline::new(build_commands(resolved));
        pipeline.prepare(&self.ctx.progress);
        tracing::debug!("pipeline commands={:?}", pipeline.names());
        self.status.set_state(UpdaterState::Running);
        pipeline.run(&self.ctx, state, &self.status, token).await
    }

    /// Runs [`Updater::update`] on its own task with a fresh cancellation
    /// source owned by the returned handle.
    pub fn spawn(self) -> UpdateHandle {
        let (source, token) = CancellationSource::new();
        let status = self.subscribe();
        let task = tokio::spawn(async move { self.update(&token).await });
        UpdateHandle {
            source,
            status,
            task,
        }
    }
}

pub struct UpdateHandle {
    source: CancellationSource,
    status: watch::Receiver<UpdaterStatus>,
    task: JoinHandle<UpdateOutcome>,
}

impl UpdateHandle {
    pub fn status(&self) -> watch::Receiver<UpdaterStatus> {
        self.status.clone()
    }

    pub fn cancel(&self) -> Result<()> {
        self.source.cancel()
    }

    pub fn cancellation(&self) -> CancellationSource {
        self.source.clone()
    }

    pub async fn wait(self) -> UpdateOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => UpdateOutcome::Failed {
                kind: FailureKind::ProgrammingError,
                detail: format!("updater task failed: {}", err),
            },
        }
    }
}
