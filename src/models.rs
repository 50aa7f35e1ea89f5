use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Extracting,
    Installing,
    Installed,
    ExtractFailed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Installed | Self::ExtractFailed | Self::Failed | Self::Cancelled
        )
    }

    /// Queued, transferring, paused or in the install stage.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Downloading | Self::Paused | Self::Extracting | Self::Installing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Extracting => "extracting",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::ExtractFailed => "extract_failed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Alternate source for one part, picked from availability substitution data.
/// A missing `url` means "take that part's link from the host's link list".
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PartSource {
    pub host: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub id: String,
    pub appid: String,
    pub game_name: String,
    pub host: String,
    pub url: String,
    #[serde(default)]
    pub original_url: Option<String>,
    pub filename: String,
    pub status: DownloadStatus,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: f64,
    #[serde(default)]
    pub eta_seconds: Option<u64>,
    #[serde(default)]
    pub part_index: Option<u32>,
    #[serde(default)]
    pub part_total: Option<u32>,
    #[serde(default)]
    pub save_path: Option<String>,
    #[serde(default)]
    pub version_label: Option<String>,
    #[serde(default)]
    pub fallbacks: Vec<PartSource>,
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DownloadItem {
    /// Records progress keeping `received <= total` whenever the total is known.
    pub fn set_progress(&mut self, received: u64, total: u64) {
        self.received_bytes = received;
        self.total_bytes = if total > 0 { total.max(received) } else { 0 };
    }

    /// Progress reported while transferring. `received_bytes` only moves forward
    /// even when the worker restarts the file or switches to another host.
    pub fn advance_progress(&mut self, received: u64, total: u64) {
        let received = received.max(self.received_bytes);
        self.set_progress(received, total);
    }
}


#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupPhase {
    Queued,
    Downloading,
    Paused,
    Extracting,
    Installing,
    Completed,
    ExtractFailed,
    Failed,
    Cancelled,
}

/// Derived view over every item sharing an appid. Never stored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadGroup {
    pub appid: String,
    pub game_name: String,
    pub phase: GroupPhase,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
    pub part_total: u32,
    pub completed_parts: u32,
    pub failed_parts: u32,
    pub item_ids: Vec<String>,
}

/// Catalog metadata for one game. Unknown keys are preserved so the manifest
/// keeps whatever the catalog sent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Game {
    pub appid: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Game {
    pub fn new(appid: &str, name: &str) -> Self {
        Self {
            appid: appid.to_string(),
            name: name.to_string(),
            version: None,
            extra: Map::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DownloadConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub version_label: Option<String>,
    #[serde(default)]
    pub part_overrides: BTreeMap<u32, PartSource>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartStatus {
    Alive,
    Dead,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PartAvailability {
    pub part: u32,
    pub status: PartStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostAvailability {
    pub parts: Vec<PartAvailability>,
    pub total_parts: u32,
    pub alive_parts: u32,
    pub all_alive: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlternativeInfo {
    pub dead_on: Vec<String>,
    pub alive_on: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResult {
    pub game_available: bool,
    pub hosts: BTreeMap<String, HostAvailability>,
    pub alternatives: BTreeMap<String, AlternativeInfo>,
    pub fully_dead_parts: Vec<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameVersion {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, alias = "host_count")]
    pub host_count: u32,
    #[serde(default, alias = "is_current")]
    pub is_current: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutableCandidate {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub depth: u32,
    #[serde(default)]
    pub score: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstalledManifestEntry {
    pub appid: String,
    pub metadata: Value,
    pub installed_at: i64,
    pub install_path: String,
    #[serde(default)]
    pub executables: Vec<ExecutableCandidate>,
    #[serde(default)]
    pub saved_exe_path: Option<String>,
    #[serde(default)]
    pub version_label: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub external: bool,
}

impl InstalledManifestEntry {
    pub fn name(&self) -> String {
        self.metadata
            .get("name")
            .and_then(|value| value.as_str())
            .unwrap_or(&self.appid)
            .to_string()
    }
}

/// Lightweight row used to enumerate installed games without reading manifests.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstalledIndexEntry {
    pub appid: String,
    pub name: String,
    pub install_path: String,
    pub installed_at: i64,
    pub size_bytes: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstallingStatus {
    Downloading,
    Failed,
    Cancelled,
    Extracting,
    Installed,
}

impl InstallingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Extracting => "extracting",
            Self::Installed => "installed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "extracting" => Self::Extracting,
            "installed" => Self::Installed,
            _ => Self::Downloading,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallingRecord {
    pub appid: String,
    pub metadata: Value,
    pub status: InstallingStatus,
    pub error: Option<String>,
    pub updated_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunningGameRecord {
    pub appid: String,
    pub pid: u32,
    pub exe_path: String,
    pub started_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    /// Index rows dropped because no manifest backs them.
    pub removed_index_entries: Vec<String>,
    /// Index rows rebuilt from manifests found on disk.
    pub restored_index_entries: Vec<String>,
    /// Manifests that could not be parsed.
    pub unreadable_manifests: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.removed_index_entries.is_empty()
            && self.restored_index_entries.is_empty()
            && self.unreadable_manifests.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LauncherEvent {
    #[serde(rename_all = "camelCase")]
    DownloadUpdate { item: DownloadItem },
    #[serde(rename_all = "camelCase")]
    InstalledChanged { appid: String },
    #[serde(rename_all = "camelCase")]
    GameStopped { appid: String, pid: u32 },
}
