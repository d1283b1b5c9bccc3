pub mod cancellation;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod progress;
pub mod services;
pub mod updater;
pub mod utils;

pub use cancellation::{CancellationSource, CancellationToken};
pub use config::UpdaterConfig;
pub use errors::{FailureKind, Result, UpdaterError};
pub use updater::context::UpdaterContext;
pub use updater::status::{UpdaterState, UpdaterStatus};
pub use updater::strategy::StrategyType;
pub use updater::{UpdateHandle, UpdateOutcome, Updater};
