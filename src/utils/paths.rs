use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "patch-updater";

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(&PathBuf::from(trimmed))
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

pub fn resolve_root_dir() -> PathBuf {
    if let Some(dir) = env_dir("UPDATER_ROOT_DIR") {
        return dir;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    if let Some(data) = dirs::data_dir() {
        if let Some(found) = ensure_dir(&data.join(APP_DIR_NAME)) {
            return found;
        }
    }

    if let Some(local) = dirs::data_local_dir() {
        if let Some(found) = ensure_dir(&local.join(APP_DIR_NAME)) {
            return found;
        }
    }

    PathBuf::from(".")
}

/// Holds the config file, the install state and the license cache.
pub fn resolve_data_dir() -> PathBuf {
    let root = resolve_root_dir();
    ensure_dir(&root.join("config")).unwrap_or(root)
}

pub fn resolve_log_dir() -> PathBuf {
    if let Some(dir) = env_dir("UPDATER_LOG_DIR") {
        return dir;
    }
    let root = resolve_root_dir();
    let logs = root.join("logs");
    ensure_dir(&logs).unwrap_or(logs)
}

/// Default installation target when the config names none.
pub fn resolve_install_dir() -> PathBuf {
    if let Some(dir) = env_dir("UPDATER_INSTALL_DIR") {
        return dir;
    }
    let root = resolve_root_dir();
    let app = root.join("app");
    ensure_dir(&app).unwrap_or(app)
}
