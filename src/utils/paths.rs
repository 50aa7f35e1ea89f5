use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "uc-direct";

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
    if let Some(dir) = env_dir("UC_DIRECT_ROOT_DIR") {
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

pub fn resolve_data_dir() -> PathBuf {
    let root = resolve_root_dir();
    let config = root.join("config");
    if let Some(dir) = ensure_dir(&config) {
        return dir;
    }
    root
}

/// Default download root when the user has not picked one.
pub fn resolve_downloads_dir() -> PathBuf {
    let root = resolve_root_dir();
    if !is_portable_root(&root) {
        if let Some(downloads) = dirs::download_dir() {
            let candidate = downloads.join("UnionCrax.Direct");
            if let Some(found) = ensure_dir(&candidate) {
                return found;
            }
        }
    }

    let fallback = root.join("downloads");
    ensure_dir(&fallback).unwrap_or(fallback)
}

pub fn resolve_log_dir() -> PathBuf {
    if let Some(dir) = env_dir("UC_DIRECT_LOG_DIR") {
        return dir;
    }

    let root = resolve_root_dir();
    let root_logs = root.join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    if let Some(local) = dirs::data_local_dir() {
        let candidate = local.join(APP_DIR_NAME).join("logs");
        if let Some(found) = ensure_dir(&candidate) {
            return found;
        }
    }

    PathBuf::from("logs")
}
