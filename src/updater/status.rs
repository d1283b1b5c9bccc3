use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::interval;

use crate::progress::{OverallStatus, ProgressAggregator};
use crate::updater::strategy::StrategyType;

const STATUS_TICK: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdaterState {
    Idle,
    Resolving,
    Running,
    Succeeded,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdaterStatus {
    pub state: UpdaterState,
    pub strategy: Option<StrategyType>,
    pub command: Option<&'static str>,
    #[serde(flatten)]
    pub overall: OverallStatus,
}

impl Default for UpdaterStatus {
    fn default() -> Self {
        Self {
            state: UpdaterState::Idle,
            strategy: None,
            command: None,
            overall: OverallStatus::default(),
        }
    }
}

#[derive(Default)]
struct Stage {
    state: Option<UpdaterState>,
    strategy: Option<StrategyType>,
    command: Option<&'static str>,
}

/// Publishes [`UpdaterStatus`] snapshots on a watch channel. Sending never
/// blocks; receivers only see the latest value.
#[derive(Clone)]
pub struct StatusPublisher {
    sender: Arc<watch::Sender<UpdaterStatus>>,
    stage: Arc<Mutex<Stage>>,
    progress: ProgressAggregator,
}

impl StatusPublisher {
    pub fn new(progress: ProgressAggregator) -> Self {
        let (sender, _) = watch::channel(UpdaterStatus::default());
        Self {
            sender: Arc::new(sender),
            stage: Arc::new(Mutex::new(Stage::default())),
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdaterStatus> {
        self.sender.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Stage> {
        match self.stage.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_state(&self, state: UpdaterState) {
        self.lock().state = Some(state);
        self.publish();
    }

    pub fn set_strategy(&self, strategy: StrategyType) {
        self.lock().strategy = Some(strategy);
        self.publish();
    }

    pub fn set_command(&self, command: Option<&'static str>) {
        self.lock().command = command;
        self.publish();
    }

    pub fn publish(&self) {
        let snapshot = {
            let stage = self.lock();
            UpdaterStatus {
                state: stage.state.unwrap_or(UpdaterState::Idle),
                strategy: stage.strategy,
                command: stage.command,
                overall: self.progress.overall(),
            }
        };
        self.sender.send_replace(snapshot);
    }

    /// Republishes progress until the returned sender is dropped or fired.
    pub fn start_ticker(&self) -> oneshot::Sender<()> {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let publisher = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(STATUS_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => publisher.publish(),
                    _ = &mut stop_rx => break,
                }
            }
        });
        stop_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshots_reflect_stage_and_progress() {
        let progress = ProgressAggregator::new();
        let publisher = StatusPublisher::new(progress.clone());
        let mut receiver = publisher.subscribe();

        let step = progress.add_step_progress(1.0);
        publisher.set_state(UpdaterState::Running);
        publisher.set_command(Some("install_content"));
        step.set(0.5);
        publisher.publish();

        receiver.changed().await.expect("status change");
        let status = receiver.borrow().clone();
        assert_eq!(status.state, UpdaterState::Running);
        assert_eq!(status.command, Some("install_content"));
        assert!((status.overall.progress - 0.5).abs() < 1e-9);
    }
}
