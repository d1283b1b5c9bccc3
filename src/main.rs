use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use patch_updater::services::license_service::{LicenseMessage, LicensePrompt, PromptResult};
use patch_updater::services::{ApiClient, HttpRemoteMetaData};
use patch_updater::utils::paths::{resolve_data_dir, resolve_install_dir, resolve_log_dir};
use patch_updater::{logging, UpdateOutcome, Updater, UpdaterConfig, UpdaterContext, UpdaterError};

/// Reads product keys from stdin. An empty line or end of input aborts.
struct TerminalPrompt {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl TerminalPrompt {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl LicensePrompt for TerminalPrompt {
    async fn display(&self, message: LicenseMessage) -> PromptResult {
        let text = message.text();
        if !text.is_empty() {
            eprintln!("{}", text);
        }
        eprint!("Product key (empty to abort): ");
        let mut lines = self.lines.lock().await;
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                PromptResult::Confirmed(line.trim().to_string())
            }
            Ok(_) => PromptResult::Aborted,
            Err(err) => {
                tracing::warn!("license prompt read failed: {}", err);
                PromptResult::Aborted
            }
        }
    }
}

fn build_updater() -> patch_updater::Result<Updater> {
    let data_dir = resolve_data_dir();
    let config = UpdaterConfig::load(&data_dir)?;
    if config.app_secret.trim().is_empty() {
        return Err(UpdaterError::Config(
            "app secret missing (set appSecret or UPDATER_APP_SECRET)".to_string(),
        ));
    }
    let install_dir = config.install_dir_or(resolve_install_dir());

    let timeout = Duration::from_secs(config.http_timeout_secs);
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let remote = HttpRemoteMetaData::new(
        ApiClient::new(config.api_url.clone(), timeout, connect_timeout),
        ApiClient::new(config.keys_url.clone(), timeout, connect_timeout),
        config.app_secret.clone(),
    );
    tracing::info!(
        "updater starting install_dir={} data_dir={} api={}",
        install_dir.display(),
        data_dir.display(),
        config.api_url
    );
    let ctx = UpdaterContext::new(
        install_dir,
        data_dir,
        config,
        Arc::new(remote),
        Arc::new(TerminalPrompt::new()),
    )?;
    Ok(Updater::new(ctx))
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = logging::init(&resolve_log_dir()) {
        eprintln!("logging disabled: {}", err);
    }

    let updater = match build_updater() {
        Ok(updater) => updater,
        Err(err) => {
            tracing::error!("updater setup failed: {}", err);
            eprintln!("{}", err);
            return ExitCode::from(2);
        }
    };

    let handle = updater.spawn();
    let cancellation = handle.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            if let Err(err) = cancellation.cancel() {
                tracing::warn!("cancel callbacks failed: {}", err);
            }
        }
    });

    let mut status = handle.status();
    tokio::spawn(async move {
        let mut last_percent = None;
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            let percent = (snapshot.overall.progress * 100.0).floor() as u32;
            if last_percent == Some(percent) {
                continue;
            }
            last_percent = Some(percent);
            tracing::info!(
                "status state={:?} command={:?} progress={}% speed_kbps={:.1}",
                snapshot.state,
                snapshot.command,
                percent,
                snapshot.overall.download_speed_kbps
            );
            eprintln!(
                "[{:>3}%] {}",
                percent,
                snapshot.command.unwrap_or("waiting")
            );
        }
    });

    match handle.wait().await {
        UpdateOutcome::Succeeded { strategy } => {
            eprintln!("up to date ({:?})", strategy);
            ExitCode::SUCCESS
        }
        UpdateOutcome::Cancelled => {
            eprintln!("cancelled");
            ExitCode::from(130)
        }
        UpdateOutcome::Failed { kind, detail } => {
            eprintln!("update failed ({}): {}", kind, detail);
            ExitCode::FAILURE
        }
    }
}
