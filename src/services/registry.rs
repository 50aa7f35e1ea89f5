use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::db::queries::{InstalledIndexQueries, InstallingQueries, SettingsQueries};
use crate::db::Database;
use crate::errors::{LauncherError, Result};
use crate::models::{InstalledIndexEntry, InstalledManifestEntry, RepairReport};
use crate::services::executables::{discover_executables_async, pick_executable, ExecutablePick};
use crate::utils::file::{dir_size, write_atomic};
use crate::utils::{safe_folder_name, FileManager};

pub const MANIFEST_FILE: &str = "installed.json";
pub const DOWNLOAD_PATH_SETTING: &str = "downloadPath";

/// Durable record of installed games: one `installed.json` per install plus the
/// `installed_index` table used for enumeration.
///
/// Pipeline installs keep their manifest inside the install folder. Folders the
/// user added from elsewhere are never written to; their manifests live under
/// `external_dir/<appid>/`.
#[derive(Clone)]
pub struct InstalledRegistry {
    db: Database,
    files: FileManager,
    external_dir: PathBuf,
}

impl InstalledRegistry {
    pub fn new(db: Database, files: FileManager, external_dir: PathBuf) -> Self {
        Self {
            db,
            files,
            external_dir,
        }
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    /// Records a finished install. The manifest lands on disk before the index row.
    pub async fn register(
        &self,
        appid: &str,
        metadata: Value,
        install_path: &Path,
        version_label: Option<String>,
    ) -> Result<InstalledManifestEntry> {
        self.register_entry(appid, metadata, install_path, version_label, false)
            .await
    }

    /// Registers a game folder that was not installed through the pipeline.
    pub async fn add_external_game(
        &self,
        appid: &str,
        metadata: Value,
        folder: &Path,
    ) -> Result<InstalledManifestEntry> {
        if !folder.is_dir() {
            return Err(LauncherError::NotFound(format!(
                "game folder {}",
                folder.display()
            )));
        }
        self.register_entry(appid, metadata, folder, None, true)
            .await
    }

    async fn register_entry(
        &self,
        appid: &str,
        metadata: Value,
        install_path: &Path,
        version_label: Option<String>,
        external: bool,
    ) -> Result<InstalledManifestEntry> {
        let executables = discover_executables_async(install_path).await?;
        let path = install_path.to_path_buf();
        let size_bytes = tokio::task::spawn_blocking(move || dir_size(&path).unwrap_or(0))
            .await
            .unwrap_or(0);

        let entry = InstalledManifestEntry {
            appid: appid.to_string(),
            metadata,
            installed_at: chrono::Utc::now().timestamp(),
            install_path: install_path.to_string_lossy().to_string(),
            executables,
            saved_exe_path: None,
            version_label,
            size_bytes,
            external,
        };
        self.write_entry(&entry).await?;
        self.db.delete_installing(appid)?;
        tracing::info!(
            "registered appid={} path={} exes={}",
            appid,
            entry.install_path,
            entry.executables.len()
        );
        Ok(entry)
    }

    fn external_manifest_dir(&self, appid: &str) -> PathBuf {
        self.external_dir.join(safe_folder_name(appid))
    }

    fn manifest_dir(&self, entry: &InstalledManifestEntry) -> PathBuf {
        if entry.external {
            self.external_manifest_dir(&entry.appid)
        } else {
            PathBuf::from(&entry.install_path)
        }
    }

    /// Reads the manifest from the external store first, then the install folder.
    async fn load_manifest(
        &self,
        appid: &str,
        install_path: &str,
    ) -> Result<Option<InstalledManifestEntry>> {
        if let Some(entry) = read_manifest(&self.external_manifest_dir(appid)).await? {
            return Ok(Some(entry));
        }
        read_manifest(Path::new(install_path)).await
    }

    async fn write_entry(&self, entry: &InstalledManifestEntry) -> Result<()> {
        let manifest_path = self.manifest_dir(entry).join(MANIFEST_FILE);
        let payload = serde_json::to_vec_pretty(entry)?;
        tokio::task::spawn_blocking(move || write_atomic(&manifest_path, &payload))
            .await
            .map_err(|err| LauncherError::Config(format!("manifest write task failed: {err}")))??;
        self.db.upsert_index_entry(&index_entry(entry))?;
        Ok(())
    }

    /// Manifest for `appid`. An index row whose manifest is gone is reported as corruption.
    pub async fn get(&self, appid: &str) -> Result<Option<InstalledManifestEntry>> {
        let Some(index) = self.db.get_index_entry(appid)? else {
            return Ok(None);
        };
        match self.load_manifest(appid, &index.install_path).await {
            Ok(Some(entry)) if entry.appid == appid => Ok(Some(entry)),
            Ok(Some(entry)) => Err(LauncherError::RegistryCorruption(format!(
                "index row {} points at manifest of {}",
                appid, entry.appid
            ))),
            Ok(None) => Err(LauncherError::RegistryCorruption(format!(
                "manifest missing for {} at {}",
                appid, index.install_path
            ))),
            Err(err) => Err(LauncherError::RegistryCorruption(format!(
                "manifest unreadable for {}: {}",
                appid, err
            ))),
        }
    }

    async fn require(&self, appid: &str) -> Result<InstalledManifestEntry> {
        self.get(appid)
            .await?
            .ok_or_else(|| LauncherError::NotFound(format!("installed game {appid}")))
    }

    pub fn list_index(&self) -> Result<Vec<InstalledIndexEntry>> {
        self.db.list_index_entries()
    }

    /// Every readable manifest listed in the index. Broken rows are skipped; `repair` fixes them.
    pub async fn list(&self) -> Result<Vec<InstalledManifestEntry>> {
        let mut entries = Vec::new();
        for index in self.db.list_index_entries()? {
            match self.get(&index.appid).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(err) => tracing::warn!("skip installed appid={}: {}", index.appid, err),
            }
        }
        Ok(entries)
    }

    pub async fn is_installed(&self, appid: &str) -> bool {
        matches!(self.get(appid).await, Ok(Some(_)))
    }

    /// Merges the top-level keys of `patch` into the stored metadata.
    pub async fn update_metadata(&self, appid: &str, patch: Value) -> Result<InstalledManifestEntry> {
        let mut entry = self.require(appid).await?;
        let Value::Object(patch) = patch else {
            return Err(LauncherError::Config(
                "metadata patch must be a JSON object".to_string(),
            ));
        };
        if !entry.metadata.is_object() {
            entry.metadata = Value::Object(Default::default());
        }
        if let Value::Object(current) = &mut entry.metadata {
            for (key, value) in patch {
                current.insert(key, value);
            }
        }
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    /// Stores the user's executable choice. `None` clears it.
    pub async fn set_saved_executable(
        &self,
        appid: &str,
        exe_path: Option<&Path>,
    ) -> Result<InstalledManifestEntry> {
        let mut entry = self.require(appid).await?;
        if let Some(path) = exe_path {
            if !path.is_file() {
                return Err(LauncherError::NotFound(format!(
                    "executable {}",
                    path.display()
                )));
            }
        }
        entry.saved_exe_path = exe_path.map(|path| path.to_string_lossy().to_string());
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    /// Rescans the install folder and runs the auto-pick heuristic.
    pub async fn pick_executable(&self, appid: &str) -> Result<ExecutablePick> {
        let mut entry = self.require(appid).await?;
        let executables = discover_executables_async(Path::new(&entry.install_path)).await?;
        if executables != entry.executables {
            entry.executables = executables;
            self.write_entry(&entry).await?;
        }
        Ok(pick_executable(&entry.executables, &entry.name()))
    }

    /// Saved choice first, then a confident auto-pick.
    pub async fn launch_target(&self, appid: &str) -> Result<PathBuf> {
        let entry = self.require(appid).await?;
        if let Some(saved) = entry.saved_exe_path.as_ref().map(PathBuf::from) {
            if saved.is_file() {
                return Ok(saved);
            }
            tracing::warn!("saved exe missing appid={} path={}", appid, saved.display());
        }
        let pick = self.pick_executable(appid).await?;
        match pick.pick {
            Some(exe) if pick.confident => Ok(PathBuf::from(exe.path)),
            _ => Err(LauncherError::NotFound(format!(
                "no confident executable for {appid}; choose one of {} candidates",
                pick.ranked.len()
            ))),
        }
    }

    /// Removes the index row and the manifest. The install folder is deleted
    /// only for pipeline installs; an external folder belongs to the user.
    pub async fn uninstall(&self, appid: &str) -> Result<()> {
        let index = self.db.get_index_entry(appid)?;
        self.db.remove_index_entry(appid)?;
        self.db.delete_installing(appid)?;
        let Some(index) = index else {
            return Err(LauncherError::NotFound(format!("installed game {appid}")));
        };
        let folder = PathBuf::from(&index.install_path);
        let external_dir = self.external_manifest_dir(appid);
        if external_dir.join(MANIFEST_FILE).exists() {
            tokio::fs::remove_dir_all(&external_dir).await?;
            tracing::info!("forgot external game appid={} path={}", appid, folder.display());
            return Ok(());
        }
        if folder.exists() {
            tokio::fs::remove_dir_all(&folder).await?;
        }
        tracing::info!("uninstalled appid={} path={}", appid, folder.display());
        Ok(())
    }

    /// Reconciles the index with the manifests on disk.
    pub async fn repair(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let mut indexed = HashSet::new();

        for index in self.db.list_index_entries()? {
            match self.load_manifest(&index.appid, &index.install_path).await {
                Ok(Some(entry)) if entry.appid == index.appid => {
                    indexed.insert(index.appid.clone());
                    let expected = index_entry(&entry);
                    if expected != index {
                        self.db.upsert_index_entry(&expected)?;
                    }
                }
                Ok(_) => {
                    self.db.remove_index_entry(&index.appid)?;
                    report.removed_index_entries.push(index.appid);
                }
                Err(err) => {
                    tracing::warn!("unreadable manifest appid={}: {}", index.appid, err);
                    self.db.remove_index_entry(&index.appid)?;
                    report.unreadable_manifests.push(index.install_path.clone());
                    report.removed_index_entries.push(index.appid);
                }
            }
        }

        let installed_root = self.files.installed_root();
        for folder in list_dirs(&installed_root).await {
            match read_manifest(&folder).await {
                Ok(Some(entry)) if !indexed.contains(&entry.appid) => {
                    let mut entry = entry;
                    entry.install_path = folder.to_string_lossy().to_string();
                    self.write_entry(&entry).await?;
                    indexed.insert(entry.appid.clone());
                    report.restored_index_entries.push(entry.appid);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("unreadable manifest in {}: {}", folder.display(), err);
                    let path = folder.to_string_lossy().to_string();
                    if !report.unreadable_manifests.contains(&path) {
                        report.unreadable_manifests.push(path);
                    }
                }
            }
        }

        for dir in list_dirs(&self.external_dir).await {
            match read_manifest(&dir).await {
                Ok(Some(entry)) if !indexed.contains(&entry.appid) => {
                    if !Path::new(&entry.install_path).is_dir() {
                        tracing::warn!(
                            "external game folder gone appid={} path={}",
                            entry.appid,
                            entry.install_path
                        );
                        tokio::fs::remove_dir_all(&dir).await?;
                        continue;
                    }
                    self.db.upsert_index_entry(&index_entry(&entry))?;
                    indexed.insert(entry.appid.clone());
                    report.restored_index_entries.push(entry.appid);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("unreadable manifest in {}: {}", dir.display(), err);
                    report
                        .unreadable_manifests
                        .push(dir.to_string_lossy().to_string());
                }
            }
        }

        if report.is_clean() {
            tracing::debug!("installed registry consistent");
        } else {
            tracing::warn!(
                "installed registry repaired removed={:?} restored={:?} unreadable={}",
                report.removed_index_entries,
                report.restored_index_entries,
                report.unreadable_manifests.len()
            );
        }
        Ok(report)
    }

    /// Bytes used under the download root.
    pub async fn download_usage(&self) -> u64 {
        let root = self.files.download_root();
        tokio::task::spawn_blocking(move || dir_size(&root).unwrap_or(0))
            .await
            .unwrap_or(0)
    }

    pub fn set_download_root(&self, path: &Path) -> Result<PathBuf> {
        let root = self.files.set_download_root(path.to_path_buf())?;
        self.db
            .set_setting(DOWNLOAD_PATH_SETTING, &root.to_string_lossy())?;
        tracing::info!("download root set to {}", root.display());
        Ok(root)
    }

    /// Applies a previously saved download root, if any.
    pub fn restore_download_root(&self) -> Result<()> {
        if let Some(saved) = self.db.get_setting(DOWNLOAD_PATH_SETTING)? {
            if !saved.trim().is_empty() {
                self.files.set_download_root(PathBuf::from(saved.trim()))?;
            }
        }
        Ok(())
    }
}

fn index_entry(entry: &InstalledManifestEntry) -> InstalledIndexEntry {
    InstalledIndexEntry {
        appid: entry.appid.clone(),
        name: entry.name(),
        install_path: entry.install_path.clone(),
        installed_at: entry.installed_at,
        size_bytes: entry.size_bytes,
    }
}

async fn read_manifest(folder: &Path) -> Result<Option<InstalledManifestEntry>> {
    let path = folder.join(MANIFEST_FILE);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

async fn list_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return dirs;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry
            .file_type()
            .await
            .map(|kind| kind.is_dir())
            .unwrap_or(false);
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if is_dir && !hidden {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;
    use serde_json::json;
    use std::fs;

    fn registry(root: &Path) -> InstalledRegistry {
        InstalledRegistry::new(
            Database::in_memory().unwrap(),
            FileManager::new(root.to_path_buf()),
            root.join("external"),
        )
    }

    fn install_folder(root: &Path, folder: &str) -> PathBuf {
        let dir = root.join("installed").join(folder);
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("Portal.exe"), vec![0u8; 32]).unwrap();
        fs::write(dir.join("bin").join("crashreporter.exe"), b"x").unwrap();
        dir
    }

    #[tokio::test]
    async fn register_writes_manifest_and_index() {
        let root = temp_dir("registry-register");
        let reg = registry(&root);
        let dir = install_folder(&root, "portal");

        let entry = reg
            .register("400", json!({"name": "Portal"}), &dir, Some("1.0".to_string()))
            .await
            .unwrap();
        assert_eq!(entry.executables.len(), 2);
        assert!(dir.join(MANIFEST_FILE).is_file());

        let index = reg.list_index().unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].name, "Portal");
        let loaded = reg.get("400").await.unwrap().unwrap();
        assert_eq!(loaded.version_label.as_deref(), Some("1.0"));

        let target = reg.launch_target("400").await.unwrap();
        assert_eq!(target, dir.join("Portal.exe"));
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn metadata_patch_merges_top_level_keys() {
        let root = temp_dir("registry-patch");
        let reg = registry(&root);
        let dir = install_folder(&root, "portal");
        reg.register("400", json!({"name": "Portal", "genre": "puzzle"}), &dir, None)
            .await
            .unwrap();

        let entry = reg
            .update_metadata("400", json!({"name": "Portal GOTY"}))
            .await
            .unwrap();
        assert_eq!(entry.metadata["name"], "Portal GOTY");
        assert_eq!(entry.metadata["genre"], "puzzle");
        assert_eq!(reg.list_index().unwrap()[0].name, "Portal GOTY");

        let exe = dir.join("bin").join("crashreporter.exe");
        let entry = reg.set_saved_executable("400", Some(&exe)).await.unwrap();
        assert_eq!(entry.saved_exe_path, Some(exe.to_string_lossy().to_string()));
        assert_eq!(reg.launch_target("400").await.unwrap(), exe);
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn repair_drops_orphan_rows_and_restores_missing_ones() {
        let root = temp_dir("registry-repair");
        let reg = registry(&root);
        let kept = install_folder(&root, "kept");
        let orphan = install_folder(&root, "orphan");
        reg.register("1", json!({"name": "Kept"}), &kept, None)
            .await
            .unwrap();
        reg.register("2", json!({"name": "Orphan"}), &orphan, None)
            .await
            .unwrap();

        fs::remove_file(orphan.join(MANIFEST_FILE)).unwrap();
        reg.db.remove_index_entry("1").unwrap();
        assert!(matches!(
            reg.get("2").await,
            Err(LauncherError::RegistryCorruption(_))
        ));

        let report = reg.repair().await.unwrap();
        assert_eq!(report.removed_index_entries, vec!["2".to_string()]);
        assert_eq!(report.restored_index_entries, vec!["1".to_string()]);
        assert!(reg.get("2").await.unwrap().is_none());
        assert!(reg.get("1").await.unwrap().is_some());
        assert!(reg.repair().await.unwrap().is_clean());
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn uninstall_removes_folder_and_index() {
        let root = temp_dir("registry-uninstall");
        let reg = registry(&root);
        let dir = install_folder(&root, "portal");
        reg.register("400", json!({"name": "Portal"}), &dir, None)
            .await
            .unwrap();
        assert!(reg.download_usage().await > 0);

        reg.uninstall("400").await.unwrap();
        assert!(!dir.exists());
        assert!(reg.get("400").await.unwrap().is_none());
        assert!(matches!(
            reg.uninstall("400").await,
            Err(LauncherError::NotFound(_))
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn external_folder_is_left_untouched() {
        let root = temp_dir("registry-external");
        let reg = registry(&root);
        let external = root.join("elsewhere");
        fs::create_dir_all(&external).unwrap();
        fs::write(external.join("Game.exe"), b"MZ").unwrap();

        let entry = reg
            .add_external_game("9", json!({"name": "Else"}), &external)
            .await
            .unwrap();
        assert!(entry.external);
        assert!(!external.join(MANIFEST_FILE).exists());
        assert!(root.join("external").join("9").join(MANIFEST_FILE).is_file());
        assert_eq!(reg.launch_target("9").await.unwrap(), external.join("Game.exe"));

        reg.uninstall("9").await.unwrap();
        assert!(external.join("Game.exe").is_file());
        assert!(!root.join("external").join("9").exists());
        assert!(reg.get("9").await.unwrap().is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn repair_restores_external_rows() {
        let root = temp_dir("registry-external-repair");
        let reg = registry(&root);
        let external = root.join("elsewhere");
        fs::create_dir_all(&external).unwrap();
        fs::write(external.join("Game.exe"), b"MZ").unwrap();
        let vanished = root.join("vanished");
        fs::create_dir_all(&vanished).unwrap();
        reg.add_external_game("9", json!({"name": "Else"}), &external)
            .await
            .unwrap();
        reg.add_external_game("10", json!({"name": "Vanished"}), &vanished)
            .await
            .unwrap();

        reg.db.remove_index_entry("9").unwrap();
        reg.db.remove_index_entry("10").unwrap();
        fs::remove_dir_all(&vanished).unwrap();

        let report = reg.repair().await.unwrap();
        assert_eq!(report.restored_index_entries, vec!["9".to_string()]);
        let entry = reg.get("9").await.unwrap().unwrap();
        assert_eq!(entry.install_path, external.to_string_lossy());
        assert!(entry.external);
        assert!(reg.get("10").await.unwrap().is_none());
        assert!(!root.join("external").join("10").exists());
        assert!(reg.repair().await.unwrap().is_clean());
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn download_root_is_persisted() {
        let root = temp_dir("registry-root");
        let reg = registry(&root);
        let moved = root.join("moved");
        reg.set_download_root(&moved).unwrap();
        assert_eq!(reg.files().download_root(), moved);
        assert_eq!(
            reg.db.get_setting(DOWNLOAD_PATH_SETTING).unwrap(),
            Some(moved.to_string_lossy().to_string())
        );
        let _ = fs::remove_dir_all(root);
    }
}
