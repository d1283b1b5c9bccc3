use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationToken;
use crate::errors::{Result, UpdaterError};
use crate::services::local_state::LocalInstallState;
use crate::services::remote_meta::RemoteMetaData;
use crate::utils::crypto::{decrypt_from_base64, encrypt_to_base64, load_or_create_key};
use crate::utils::file::write_atomic;

pub const LICENSE_CACHE_FILE: &str = "license_cache.json";
pub const LICENSE_KEY_FILE: &str = "license.key";

/// Hint shown alongside the key prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LicenseMessage {
    None,
    InvalidLicense,
    BlockedLicense,
    ServiceUnavailable,
}

impl LicenseMessage {
    pub fn text(&self) -> &'static str {
        match self {
            LicenseMessage::None => "",
            LicenseMessage::InvalidLicense => "The license key is invalid.",
            LicenseMessage::BlockedLicense => "The license key has been blocked.",
            LicenseMessage::ServiceUnavailable => {
                "The license service is unavailable. Try again later."
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptResult {
    Confirmed(String),
    Aborted,
}

/// Asks the user for a product key.
#[async_trait]
pub trait LicensePrompt: Send + Sync {
    async fn display(&self, message: LicenseMessage) -> PromptResult;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LicenseState {
    AwaitingInput,
    Validating,
    Valid,
    Invalid,
    Blocked,
    ServiceUnavailable,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LicenseSecret {
    pub key: String,
    pub secret: String,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LicenseCacheFile {
    #[serde(default)]
    secrets: BTreeMap<String, String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Product key → key secret map, secrets sealed with AES-256-GCM.
pub struct LicenseCache {
    path: PathBuf,
    cipher_key: Vec<u8>,
    inner: Mutex<LicenseCacheFile>,
}

impl LicenseCache {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let cipher_key = load_or_create_key(&dir.join(LICENSE_KEY_FILE))?;
        let path = dir.join(LICENSE_CACHE_FILE);
        let inner = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!("license cache unreadable, starting empty: {}", err);
                LicenseCacheFile::default()
            })
        } else {
            LicenseCacheFile::default()
        };
        Ok(Self {
            path,
            cipher_key,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LicenseCacheFile> {
        match self.inner.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, cache: &mut LicenseCacheFile) -> Result<()> {
        cache.updated_at = Some(Utc::now());
        write_atomic(&self.path, &serde_json::to_vec_pretty(cache)?)?;
        Ok(())
    }

    fn cache_key(key: &str) -> String {
        format!("keysecret-{}", key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let sealed = self.lock().secrets.get(&Self::cache_key(key)).cloned()?;
        match decrypt_from_base64(&self.cipher_key, &sealed) {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            Err(err) => {
                tracing::warn!("dropping undecryptable cached secret: {}", err);
                None
            }
        }
    }

    pub fn store(&self, key: &str, secret: &str) -> Result<()> {
        let sealed = encrypt_to_base64(&self.cipher_key, secret.as_bytes())?;
        let mut locked = self.lock();
        locked.secrets.insert(Self::cache_key(key), sealed);
        self.persist(&mut locked)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut locked = self.lock();
        if locked.secrets.remove(&Self::cache_key(key)).is_some() {
            self.persist(&mut locked)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Attempt {
    Valid(String),
    Rejected(LicenseState, LicenseMessage),
}

/// Obtains a key secret for apps that require product keys.
pub struct LicenseValidator {
    remote: Arc<dyn RemoteMetaData>,
    prompt: Arc<dyn LicensePrompt>,
    cache: Arc<LicenseCache>,
    install_state: Arc<LocalInstallState>,
    visited: Mutex<Vec<LicenseState>>,
}

impl LicenseValidator {
    pub fn new(
        remote: Arc<dyn RemoteMetaData>,
        prompt: Arc<dyn LicensePrompt>,
        cache: Arc<LicenseCache>,
        install_state: Arc<LocalInstallState>,
    ) -> Self {
        Self {
            remote,
            prompt,
            cache,
            install_state,
            visited: Mutex::new(Vec::new()),
        }
    }

    fn enter(&self, state: LicenseState) {
        tracing::debug!("license state={:?}", state);
        match self.visited.lock() {
            Ok(mut locked) => locked.push(state),
            Err(poisoned) => poisoned.into_inner().push(state),
        }
    }

    /// Every state entered so far, in order.
    pub fn visited_states(&self) -> Vec<LicenseState> {
        match self.visited.lock() {
            Ok(locked) => locked.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns `None` when the application does not use keys. Retries until a
    /// key validates or the user aborts, which yields [`UpdaterError::Cancelled`].
    pub async fn validate(&self, token: &CancellationToken) -> Result<Option<LicenseSecret>> {
        token.throw_if_cancelled()?;
        let app = self.remote.app_info().await?;
        if !app.use_keys {
            tracing::info!("application does not use license keys");
            self.enter(LicenseState::Valid);
            return Ok(None);
        }

        let mut cached_key = self.install_state.product_key();
        let mut message = LicenseMessage::None;

        loop {
            token.throw_if_cancelled()?;
            self.enter(LicenseState::AwaitingInput);

            let (key, from_cache) = match cached_key.take() {
                Some(key) => {
                    tracing::info!("trying cached product key");
                    (key, true)
                }
                None => match self.ask(message, token).await? {
                    PromptResult::Confirmed(key) => (key.trim().to_string(), false),
                    PromptResult::Aborted => {
                        tracing::info!("license prompt aborted");
                        self.enter(LicenseState::Aborted);
                        return Err(UpdaterError::Cancelled);
                    }
                },
            };

            self.enter(LicenseState::Validating);
            match self.attempt(&key).await? {
                Attempt::Valid(secret) => {
                    self.enter(LicenseState::Valid);
                    self.cache.store(&key, &secret)?;
                    self.install_state.set_product_key(Some(&key))?;
                    tracing::info!("license key validated");
                    return Ok(Some(LicenseSecret { key, secret }));
                }
                Attempt::Rejected(state, rejection) => {
                    self.enter(state);
                    if state == LicenseState::Blocked {
                        self.cache.remove(&key)?;
                    }
                    // A stale cached key falls through to a clean prompt.
                    message = if from_cache {
                        LicenseMessage::None
                    } else {
                        rejection
                    };
                }
            }
        }
    }

    async fn ask(&self, message: LicenseMessage, token: &CancellationToken) -> Result<PromptResult> {
        tokio::select! {
            result = self.prompt.display(message) => Ok(result),
            _ = token.cancelled() => Err(UpdaterError::Cancelled),
        }
    }

    async fn attempt(&self, key: &str) -> Result<Attempt> {
        let cached_secret = self.cache.get(key);
        match self.remote.key_secret(key, cached_secret.as_deref()).await {
            Ok(secret) => Ok(Attempt::Valid(secret)),
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                let rejection = match err.http_status() {
                    Some(404) => Attempt::Rejected(LicenseState::Invalid, LicenseMessage::InvalidLicense),
                    Some(410) => Attempt::Rejected(LicenseState::Blocked, LicenseMessage::BlockedLicense),
                    Some(403) => Attempt::Rejected(
                        LicenseState::ServiceUnavailable,
                        LicenseMessage::ServiceUnavailable,
                    ),
                    Some(status) if status >= 500 => Attempt::Rejected(
                        LicenseState::ServiceUnavailable,
                        LicenseMessage::ServiceUnavailable,
                    ),
                    Some(status) => {
                        return Err(UpdaterError::LicenseRejected(format!(
                            "license service answered {}: {}",
                            status, err
                        )))
                    }
                    None if matches!(err, UpdaterError::Network(_) | UpdaterError::Transport(_)) => {
                        Attempt::Rejected(
                            LicenseState::ServiceUnavailable,
                            LicenseMessage::ServiceUnavailable,
                        )
                    }
                    None => return Err(err),
                };
                tracing::warn!("license key rejected: {}", err);
                Ok(rejection)
            }
        }
    }
}
