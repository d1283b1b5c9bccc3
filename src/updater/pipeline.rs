use async_trait::async_trait;

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::progress::ProgressAggregator;
use crate::updater::context::{CommandState, UpdaterContext};
use crate::updater::status::StatusPublisher;

/// One step of an update run.
///
/// `prepare` registers the command's progress contributors and must not do
/// any I/O; `execute` runs at most once, after every command was prepared.
#[async_trait]
pub trait UpdaterCommand: Send {
    fn name(&self) -> &'static str;

    fn prepare(&mut self, progress: &ProgressAggregator);

    async fn execute(
        &mut self,
        ctx: &UpdaterContext,
        state: &mut CommandState,
        token: &CancellationToken,
    ) -> Result<()>;
}

pub struct CommandPipeline {
    commands: Vec<Box<dyn UpdaterCommand>>,
    prepared: bool,
}

impl CommandPipeline {
    pub fn new(commands: Vec<Box<dyn UpdaterCommand>>) -> Self {
        Self {
            commands,
            prepared: false,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands.iter().map(|command| command.name()).collect()
    }

    pub fn prepare(&mut self, progress: &ProgressAggregator) {
        for command in self.commands.iter_mut() {
            command.prepare(progress);
        }
        self.prepared = true;
    }

    /// Executes every command in order. Stops at the first error and checks
    /// the token before each command.
    pub async fn run(
        &mut self,
        ctx: &UpdaterContext,
        state: &mut CommandState,
        status: &StatusPublisher,
        token: &CancellationToken,
    ) -> Result<()> {
        if !self.prepared {
            self.prepare(&ctx.progress);
        }
        let total = self.commands.len();
        for (index, command) in self.commands.iter_mut().enumerate() {
            token.throw_if_cancelled()?;
            let name = command.name();
            status.set_command(Some(name));
            tracing::info!("command start name={} step={}/{}", name, index + 1, total);
            if let Err(err) = command.execute(ctx, state, token).await {
                tracing::warn!("command failed name={} err={}", name, err);
                return Err(err);
            }
            tracing::info!("command done name={}", name);
        }
        status.set_command(None);
        Ok(())
    }
}
