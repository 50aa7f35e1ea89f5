use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const INSTALLING_DIR: &str = "installing";
const INSTALLED_DIR: &str = "installed";
const FALLBACK_FOLDER: &str = "unioncrax-game";

#[derive(Clone)]
pub struct FileManager {
    download_root: Arc<RwLock<PathBuf>>,
}

impl FileManager {
    pub fn new(download_root: PathBuf) -> Self {
        Self {
            download_root: Arc::new(RwLock::new(download_root)),
        }
    }

    pub fn download_root(&self) -> PathBuf {
        match self.download_root.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_download_root(&self, path: PathBuf) -> io::Result<PathBuf> {
        fs::create_dir_all(&path)?;
        match self.download_root.write() {
            Ok(mut guard) => *guard = path.clone(),
            Err(poisoned) => *poisoned.into_inner() = path.clone(),
        }
        Ok(path)
    }

    pub fn installing_root(&self) -> PathBuf {
        self.download_root().join(INSTALLING_DIR)
    }

    pub fn installed_root(&self) -> PathBuf {
        self.download_root().join(INSTALLED_DIR)
    }

    pub fn installing_dir(&self, folder: &str) -> PathBuf {
        self.installing_root().join(folder)
    }

    pub fn installed_dir(&self, folder: &str) -> PathBuf {
        self.installed_root().join(folder)
    }

    pub fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        write_atomic(path, contents)
    }

    pub fn dir_size(&self, path: &Path) -> io::Result<u64> {
        dir_size(path)
    }
}

/// Writes through a sibling temp file so readers never observe a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

pub fn dir_size(path: &Path) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

pub fn safe_folder_name(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_sep && !cleaned.is_empty() {
                cleaned.push('_');
            }
            pending_sep = false;
            cleaned.push(ch);
        } else {
            pending_sep = true;
        }
    }
    cleaned.truncate(80);
    let cleaned = cleaned.trim_end_matches('_').to_string();
    if cleaned.is_empty() {
        FALLBACK_FOLDER.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_names_are_sanitised() {
        assert_eq!(safe_folder_name("Half-Life 2: Episode One"), "half_life_2_episode_one");
        assert_eq!(safe_folder_name("  --  "), "unioncrax-game");
        assert_eq!(safe_folder_name("__Game__"), "game");
        assert_eq!(safe_folder_name(&"a".repeat(120)).len(), 80);
    }

    #[test]
    fn dir_size_sums_nested_files() {
        let dir = std::env::temp_dir().join(format!("ucd-size-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.bin"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.join("nested").join("b.bin"), vec![0u8; 5]).unwrap();

        assert_eq!(dir_size(&dir).unwrap(), 15);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
