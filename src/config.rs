//! Runtime configuration: `updater.config.json` in the data dir, then
//! `UPDATER_*` environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, UpdaterError};
use crate::services::integrity::HashVerification;

pub const CONFIG_FILE_NAME: &str = "updater.config.json";

const DEFAULT_API_URL: &str = "https://api.patchkit.net";
const DEFAULT_KEYS_URL: &str = "https://keys.patchkit.net";

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_keys_url() -> String {
    DEFAULT_KEYS_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_torrent_timeout_secs() -> u64 {
    60
}

fn default_chunk_retry_attempts() -> usize {
    5
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_http_timeout_secs() -> u64 {
    20
}

fn default_connect_timeout_secs() -> u64 {
    6
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdaterConfig {
    pub app_secret: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_keys_url")]
    pub keys_url: String,
    pub install_dir: Option<PathBuf>,
    pub hash_verification: HashVerification,
    #[serde(default = "default_true")]
    pub check_consistency_before_diff: bool,
    /// Cap on the summed size of the diffs a single run may download.
    pub max_cumulative_diff_size: Option<u64>,
    #[serde(default = "default_true")]
    pub allow_torrent: bool,
    pub torrent_client_path: Option<PathBuf>,
    #[serde(default = "default_torrent_timeout_secs")]
    pub torrent_stall_timeout_secs: u64,
    #[serde(default = "default_chunk_retry_attempts")]
    pub chunk_retry_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Native librsync to patch with instead of the built-in decoder.
    pub rsync_library_path: Option<PathBuf>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            app_secret: String::new(),
            api_url: default_api_url(),
            keys_url: default_keys_url(),
            install_dir: None,
            hash_verification: HashVerification::default(),
            check_consistency_before_diff: true,
            max_cumulative_diff_size: None,
            allow_torrent: true,
            torrent_client_path: None,
            torrent_stall_timeout_secs: default_torrent_timeout_secs(),
            chunk_retry_attempts: default_chunk_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            http_timeout_secs: default_http_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            rsync_library_path: None,
        }
    }
}

impl UpdaterConfig {
    /// Reads the config file (if any) from `data_dir` and applies process
    /// environment overrides.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut config = Self::from_file(&data_dir.join(CONFIG_FILE_NAME))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| UpdaterError::Config(format!("{}: {}", path.display(), err)))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env_string(&lookup, "UPDATER_APP_SECRET") {
            self.app_secret = value;
        }
        if let Some(value) = env_string(&lookup, "UPDATER_API_URL") {
            self.api_url = value;
        }
        if let Some(value) = env_string(&lookup, "UPDATER_KEYS_URL") {
            self.keys_url = value;
        }
        if let Some(value) = env_string(&lookup, "UPDATER_INSTALL_DIR") {
            self.install_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_string(&lookup, "UPDATER_HASH_VERIFICATION") {
            match parse_hash_verification(&value) {
                Some(mode) => self.hash_verification = mode,
                None => tracing::warn!("ignoring UPDATER_HASH_VERIFICATION={}", value),
            }
        }
        if env_truthy(&lookup, "UPDATER_SKIP_CONSISTENCY_CHECK") {
            self.check_consistency_before_diff = false;
        }
        if let Some(value) = env_u64(&lookup, "UPDATER_MAX_DIFF_SIZE") {
            self.max_cumulative_diff_size = Some(value);
        }
        if env_truthy(&lookup, "UPDATER_DISABLE_TORRENT") {
            self.allow_torrent = false;
        }
        if let Some(value) = env_string(&lookup, "UPDATER_TORRENT_CLIENT") {
            self.torrent_client_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env_u64(&lookup, "UPDATER_TORRENT_TIMEOUT_SECS") {
            self.torrent_stall_timeout_secs = value.max(1);
        }
        if let Some(value) = env_usize(&lookup, "UPDATER_CHUNK_RETRIES") {
            self.chunk_retry_attempts = value.clamp(1, 64);
        }
        if let Some(value) = env_u64(&lookup, "UPDATER_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = value.min(60_000);
        }
        if let Some(value) = env_string(&lookup, "UPDATER_RSYNC_LIBRARY") {
            self.rsync_library_path = Some(PathBuf::from(value));
        }
    }

    pub fn install_dir_or(&self, fallback: PathBuf) -> PathBuf {
        self.install_dir.clone().unwrap_or(fallback)
    }

    pub fn torrent_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.torrent_stall_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_hash_verification(value: &str) -> Option<HashVerification> {
    match value.trim().to_ascii_lowercase().as_str() {
        "never" | "off" | "0" => Some(HashVerification::Never),
        "always" | "on" => Some(HashVerification::Always),
        other => other
            .parse::<u64>()
            .ok()
            .map(|threshold| HashVerification::BelowSize { threshold }),
    }
}

fn env_string<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn env_truthy<F>(lookup: &F, key: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

fn env_usize<F>(lookup: &F, key: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|value| value.trim().parse::<usize>().ok())
}

fn env_u64<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|value| value.trim().parse::<u64>().ok())
}
