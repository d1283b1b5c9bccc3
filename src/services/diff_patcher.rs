use std::ffi::CString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::errors::{Result, UpdaterError};
use crate::services::rdiff::apply_delta;
use crate::utils::file::sibling_temp_path;

const PATCH_TEMP_SUFFIX: &str = "patch-tmp";
const NATIVE_PATCH_SYMBOL: &[u8] = b"rs_rdiff_patch";

/// Produces the patched file at `output` from `basis` and `delta`.
/// Implementations must not touch `basis`.
pub trait DeltaEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn patch(&self, basis: &Path, delta: &Path, output: &Path) -> Result<()>;
}

/// Built-in decoder for the librsync delta format.
#[derive(Clone, Copy, Debug, Default)]
pub struct RdiffDeltaEngine;

impl DeltaEngine for RdiffDeltaEngine {
    fn name(&self) -> &'static str {
        "rdiff"
    }

    fn patch(&self, basis: &Path, delta: &Path, output: &Path) -> Result<()> {
        let mut basis = File::open(basis)?;
        let mut delta = BufReader::new(File::open(delta)?);
        let mut writer = BufWriter::new(File::create(output)?);
        let stats = apply_delta(&mut basis, &mut delta, &mut writer)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|err| UpdaterError::Io(err.into_error()))?;
        file.sync_all()?;
        tracing::debug!(
            "rdiff applied output_bytes={} literal_bytes={} copied_bytes={}",
            stats.output_len(),
            stats.literal_bytes,
            stats.copied_bytes
        );
        Ok(())
    }
}

/// Calls `rs_rdiff_patch(basis, delta, output)` from a native librsync build.
pub struct NativeRsyncEngine {
    library_path: PathBuf,
    library: Library,
}

impl NativeRsyncEngine {
    pub fn load(library_path: &Path) -> Result<Self> {
        // SAFETY: loading runs the library initialisers; the path comes from
        // the operator's configuration.
        let library = unsafe { Library::new(library_path) }.map_err(|err| {
            UpdaterError::Config(format!(
                "unable to load rsync library {}: {}",
                library_path.display(),
                err
            ))
        })?;
        // Fail at load time rather than on the first patch.
        unsafe {
            library
                .get::<unsafe extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>(
                    NATIVE_PATCH_SYMBOL,
                )
                .map_err(|err| UpdaterError::Config(format!("rs_rdiff_patch missing: {}", err)))?;
        }
        Ok(Self {
            library_path: library_path.to_path_buf(),
            library,
        })
    }
}

fn c_path(path: &Path) -> Result<CString> {
    let text = path.to_str().ok_or_else(|| {
        UpdaterError::PatchFailed(format!("path is not valid UTF-8: {}", path.display()))
    })?;
    CString::new(text)
        .map_err(|_| UpdaterError::PatchFailed(format!("path contains NUL: {}", path.display())))
}

impl DeltaEngine for NativeRsyncEngine {
    fn name(&self) -> &'static str {
        "native-rsync"
    }

    fn patch(&self, basis: &Path, delta: &Path, output: &Path) -> Result<()> {
        let basis = c_path(basis)?;
        let delta = c_path(delta)?;
        let output = c_path(output)?;
        let status = unsafe {
            let symbol: Symbol<
                unsafe extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32,
            > = self
                .library
                .get(NATIVE_PATCH_SYMBOL)
                .map_err(|err| UpdaterError::PatchFailed(err.to_string()))?;
            symbol(basis.as_ptr(), delta.as_ptr(), output.as_ptr())
        };
        if status != 0 {
            return Err(UpdaterError::PatchFailed(format!(
                "rs_rdiff_patch from {} returned {}",
                self.library_path.display(),
                status
            )));
        }
        Ok(())
    }
}

/// Replaces a file with its patched version, or leaves it untouched.
pub trait DiffPatcher: Send + Sync {
    fn apply(&self, target: &Path, delta: &Path) -> Result<()>;
}

/// Runs a [`DeltaEngine`] into `<name>.<uuid>.patch-tmp` next to the target,
/// syncs it and renames it over the target. Any failure removes the temp file
/// and surfaces as [`UpdaterError::PatchFailed`].
#[derive(Clone)]
pub struct AtomicDiffPatcher {
    engine: Arc<dyn DeltaEngine>,
}

impl AtomicDiffPatcher {
    pub fn new(engine: Arc<dyn DeltaEngine>) -> Self {
        Self { engine }
    }

    pub fn rdiff() -> Self {
        Self::new(Arc::new(RdiffDeltaEngine))
    }

    /// Native engine when a library is configured and loads, else the
    /// built-in decoder.
    pub fn from_library(library_path: Option<&Path>) -> Self {
        if let Some(path) = library_path {
            match NativeRsyncEngine::load(path) {
                Ok(engine) => {
                    tracing::info!("using native rsync library={}", path.display());
                    return Self::new(Arc::new(engine));
                }
                Err(err) => {
                    tracing::warn!("native rsync unavailable, using rdiff decoder: {}", err);
                }
            }
        }
        Self::rdiff()
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    fn apply_inner(&self, target: &Path, delta: &Path, temp: &Path) -> Result<()> {
        self.engine.patch(target, delta, temp)?;
        File::open(temp)?.sync_all()?;
        fs::rename(temp, target)?;
        Ok(())
    }
}

impl DiffPatcher for AtomicDiffPatcher {
    fn apply(&self, target: &Path, delta: &Path) -> Result<()> {
        if !target.is_file() {
            return Err(UpdaterError::PatchFailed(format!(
                "patch target missing: {}",
                target.display()
            )));
        }
        let temp = sibling_temp_path(target, PATCH_TEMP_SUFFIX);
        match self.apply_inner(target, delta, &temp) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp);
                tracing::warn!(
                    "patch failed engine={} target={} err={}",
                    self.engine.name(),
                    target.display(),
                    err
                );
                Err(match err {
                    UpdaterError::PatchFailed(message) => UpdaterError::PatchFailed(message),
                    other => UpdaterError::PatchFailed(other.to_string()),
                })
            }
        }
    }
}
