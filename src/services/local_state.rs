use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::models::VersionId;
use crate::utils::file::write_atomic;

pub const STATE_FILE_NAME: &str = "install_state.json";

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    #[serde(default)]
    file_versions: BTreeMap<String, VersionId>,
    #[serde(default)]
    product_key: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Which version each installed file came from, persisted as JSON.
///
/// Every mutation rewrites the file atomically while the mutex is held, so a
/// crash leaves either the old or the new map on disk.
pub struct LocalInstallState {
    path: PathBuf,
    inner: Mutex<StateFile>,
}

impl LocalInstallState {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<StateFile>(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(
                        "install state at {} is unreadable, starting empty: {}",
                        path.display(),
                        err
                    );
                    StateFile::default()
                }
            }
        } else {
            StateFile::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    pub fn in_dir(dir: &Path) -> Result<Self> {
        Self::open(dir.join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StateFile> {
        match self.inner.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, state: &mut StateFile) -> Result<()> {
        state.updated_at = Some(Utc::now());
        let payload = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &payload)?;
        Ok(())
    }

    pub fn file_version(&self, path: &str) -> Option<VersionId> {
        self.lock().file_versions.get(path).copied()
    }

    pub fn is_tracked(&self, path: &str) -> bool {
        self.lock().file_versions.contains_key(path)
    }

    pub fn tracked_files(&self) -> Vec<String> {
        self.lock().file_versions.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().file_versions.is_empty()
    }

    /// The version shared by every tracked file; `None` when nothing is
    /// tracked or versions are mixed.
    pub fn common_version(&self) -> Option<VersionId> {
        let locked = self.lock();
        let mut versions = locked.file_versions.values();
        let first = *versions.next()?;
        if versions.all(|version| *version == first) {
            Some(first)
        } else {
            None
        }
    }

    /// Runs `write` and records `path` at `version` under one lock hold. The
    /// entry is only recorded when `write` succeeds.
    pub fn commit_file<F>(&self, path: &str, version: VersionId, write: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut locked = self.lock();
        write()?;
        locked.file_versions.insert(path.to_string(), version);
        self.persist(&mut locked)
    }

    pub fn set_file_version(&self, path: &str, version: VersionId) -> Result<()> {
        self.commit_file(path, version, || Ok(()))
    }

    /// Moves every tracked file to `version` with a single write.
    pub fn set_all_versions(&self, version: VersionId) -> Result<()> {
        let mut locked = self.lock();
        for value in locked.file_versions.values_mut() {
            *value = version;
        }
        self.persist(&mut locked)
    }

    /// Runs `delete` and forgets `path` under one lock hold.
    pub fn forget_file<F>(&self, path: &str, delete: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut locked = self.lock();
        delete()?;
        if locked.file_versions.remove(path).is_some() {
            self.persist(&mut locked)?;
        }
        Ok(())
    }

    pub fn product_key(&self) -> Option<String> {
        self.lock().product_key.clone()
    }

    pub fn set_product_key(&self, key: Option<&str>) -> Result<()> {
        let mut locked = self.lock();
        let next = key.map(str::to_string);
        if locked.product_key == next {
            return Ok(());
        }
        locked.product_key = next;
        self.persist(&mut locked)
    }
}
