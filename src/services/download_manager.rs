use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::db::queries::{DownloadQueries, InstallingQueries, SettingsQueries};
use crate::db::Database;
use crate::errors::{host_label, LauncherError, Result};
use crate::models::{
    DownloadConfig, DownloadGroup, DownloadItem, DownloadStatus, Game, GameVersion,
    InstallingRecord, InstallingStatus, LauncherEvent, PartSource,
};
use crate::services::api_client::{ApiClient, LinksResult};
use crate::services::availability::{AvailabilityChecker, DIRECT_HOST};
use crate::services::extractor::{ExtractJob, Extractor};
use crate::services::group::group_items;
use crate::services::host_resolver::{
    canonical_host, host_for_url, host_key, infer_filename_from_url, HostResolver, PIXELDRAIN,
    ROOTZ,
};
use crate::services::rate_limit::HostCooldown;
use crate::services::registry::InstalledRegistry;
use crate::services::transfer::{
    DownloadControl, TransferOutcome, TransferProgress, TransferRequest, TransferWorker,
};
use crate::utils::{safe_folder_name, FileManager};

pub const DEFAULT_MIRROR_SETTING: &str = "defaultMirrorHost";
const DEFAULT_MIRROR_HOST: &str = ROOTZ;
const INTERRUPTED_MESSAGE: &str = "interrupted: the app closed while this was running";

static PART_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)part\s*([0-9]{1,3})").expect("valid regex"));
static PART_EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.([0-9]{3})$").expect("valid regex"));

/// Part number encoded in an archive name (`Game.part2.rar`, `Game.zip.002`).
pub fn parse_part_index(filename: &str) -> Option<u32> {
    PART_NUMBER
        .captures(filename)
        .or_else(|| PART_EXTENSION.captures(filename))
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse::<u32>().ok())
        .filter(|index| *index > 0)
}

#[derive(Clone)]
struct DownloadHandle {
    control: watch::Sender<DownloadControl>,
    host: String,
}

#[derive(Default)]
struct SchedulerState {
    /// Every known item in admission order; games started earlier come first.
    items: Vec<DownloadItem>,
    /// In-flight items only.
    handles: HashMap<String, DownloadHandle>,
}

impl SchedulerState {
    fn item(&self, id: &str) -> Option<&DownloadItem> {
        self.items.iter().find(|item| item.id == id)
    }

    fn item_mut(&mut self, id: &str) -> Option<&mut DownloadItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn group_paused(&self, appid: &str) -> bool {
        self.items
            .iter()
            .any(|item| item.appid == appid && item.status == DownloadStatus::Paused)
    }
}

/// Queue scheduler: admits parts under global and per-host limits, drives the
/// transfer worker, and hands finished groups to the extractor and registry.
#[derive(Clone)]
pub struct DownloadManager {
    config: Arc<PipelineConfig>,
    db: Database,
    api: ApiClient,
    resolver: HostResolver,
    worker: TransferWorker,
    cooldown: HostCooldown,
    extractor: Extractor,
    registry: InstalledRegistry,
    file_manager: FileManager,
    state: Arc<Mutex<SchedulerState>>,
    events: broadcast::Sender<LauncherEvent>,
}

impl DownloadManager {
    pub fn new(
        config: Arc<PipelineConfig>,
        db: Database,
        api: ApiClient,
        resolver: HostResolver,
        registry: InstalledRegistry,
        cooldown: HostCooldown,
        events: broadcast::Sender<LauncherEvent>,
    ) -> Self {
        let file_manager = registry.files().clone();
        Self {
            worker: TransferWorker::new(config.clone(), cooldown.clone()),
            cooldown,
            extractor: Extractor::new(config.clone(), file_manager.clone()),
            config,
            db,
            api,
            resolver,
            registry,
            file_manager,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            events,
        }
    }

    /// Availability checker whose probes queue behind this scheduler's transfers.
    pub fn availability(&self) -> AvailabilityChecker {
        AvailabilityChecker::new(
            self.config.clone(),
            self.api.clone(),
            self.resolver.clone(),
            self.cooldown.clone(),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LauncherEvent> {
        self.events.subscribe()
    }

    pub fn downloads(&self) -> Vec<DownloadItem> {
        self.lock().items.clone()
    }

    pub fn groups(&self) -> Vec<DownloadGroup> {
        group_items(&self.lock().items)
    }

    pub fn group(&self, appid: &str) -> Option<DownloadGroup> {
        self.groups().into_iter().find(|group| group.appid == appid)
    }

    pub fn preferred_host(&self) -> String {
        self.db
            .get_setting(DEFAULT_MIRROR_SETTING)
            .ok()
            .flatten()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MIRROR_HOST.to_string())
    }

    pub fn set_preferred_host(&self, host: &str) -> Result<String> {
        let canonical = canonical_host(host)
            .ok_or_else(|| LauncherError::Config(format!("unknown mirror host {host}")))?;
        self.db.set_setting(DEFAULT_MIRROR_SETTING, canonical)?;
        Ok(canonical.to_string())
    }

    pub async fn set_download_limit(&self, max_bps: u64) {
        self.worker.throttle().set_limit(max_bps).await;
    }

    pub async fn fetch_versions(&self, appid: &str) -> Result<Vec<GameVersion>> {
        let token = self.api.request_download_token(appid).await?;
        self.api.fetch_versions(appid, &token).await
    }

    /// Marks work left over from a previous run. Transfers and extractions have
    /// no live worker after a restart, so they surface as failed instead of resuming.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut stored = self.db.get_downloads()?;
        let mut interrupted = 0;
        for item in stored.iter_mut() {
            let next = match item.status {
                DownloadStatus::Downloading | DownloadStatus::Queued => DownloadStatus::Failed,
                DownloadStatus::Extracting | DownloadStatus::Installing => {
                    DownloadStatus::ExtractFailed
                }
                _ => continue,
            };
            tracing::warn!(
                "download interrupted id={} appid={} was={}",
                item.id,
                item.appid,
                item.status.as_str()
            );
            item.status = next;
            item.speed_bps = 0.0;
            item.eta_seconds = None;
            item.error = Some(
                LauncherError::Interrupted(INTERRUPTED_MESSAGE.to_string()).user_message(),
            );
            self.db.upsert_download(item)?;
            if next == DownloadStatus::Failed {
                let _ = self.db.set_installing_status(
                    &item.appid,
                    InstallingStatus::Failed,
                    Some(INTERRUPTED_MESSAGE),
                );
            }
            interrupted += 1;
        }
        stored.sort_by_key(|item| item.started_at);
        self.lock().items = stored;
        Ok(interrupted)
    }

    /// Fetches links for `game`, creates one item per part and queues them.
    pub async fn start_game_download(
        &self,
        game: &Game,
        config: &DownloadConfig,
    ) -> Result<Vec<DownloadItem>> {
        let appid = game.appid.as_str();
        self.clear_stale(appid)?;

        let token = self.api.request_download_token(appid).await?;
        let links = self
            .api
            .fetch_links(appid, &token, config.version_id.as_deref())
            .await?;
        let preferred = config
            .host
            .clone()
            .unwrap_or_else(|| self.preferred_host());
        let (host_links, host, part_links) = select_host(links, &preferred)?;

        let folder = safe_folder_name(&game.name);
        let dir = self.file_manager.installing_dir(&folder);
        tokio::fs::create_dir_all(&dir).await?;

        let items = build_items(game, config, &host, &part_links, &host_links, &dir);
        if items.is_empty() {
            return Err(LauncherError::NotFound(format!(
                "no download links available for {}",
                game.name
            )));
        }

        let record = InstallingRecord {
            appid: appid.to_string(),
            metadata: serde_json::to_value(game)?,
            status: InstallingStatus::Downloading,
            error: None,
            updated_at: chrono::Utc::now().timestamp(),
        };

        {
            let mut state = self.lock();
            // Checked again under the lock; the link fetch above awaited.
            if state
                .items
                .iter()
                .any(|item| item.appid == appid && blocks_new_start(item.status))
            {
                return Err(LauncherError::Config(format!(
                    "{} is already downloading",
                    game.name
                )));
            }
            state.items.extend(items.iter().cloned());
        }
        if let Err(err) = self.db.upsert_installing(&record) {
            let ids: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
            self.lock().items.retain(|item| !ids.contains(item.id.as_str()));
            return Err(err);
        }
        for item in &items {
            self.persist(item);
            self.emit(item);
        }
        tracing::info!(
            "download queued appid={} host={} parts={} folder={}",
            appid,
            host,
            items.len(),
            folder
        );
        self.pump();
        Ok(items)
    }

    /// Rejects a start while the game has live items and forgets finished ones.
    fn clear_stale(&self, appid: &str) -> Result<()> {
        let removed: Vec<String> = {
            let mut state = self.lock();
            if state
                .items
                .iter()
                .any(|item| item.appid == appid && blocks_new_start(item.status))
            {
                return Err(LauncherError::Config(format!(
                    "{appid} already has an active download"
                )));
            }
            let removed = state
                .items
                .iter()
                .filter(|item| item.appid == appid)
                .map(|item| item.id.clone())
                .collect();
            state.items.retain(|item| item.appid != appid);
            removed
        };
        for id in removed {
            self.db.remove_download(&id)?;
        }
        Ok(())
    }

    /// Pauses the item and every queued or running sibling so the game's queue
    /// stops advancing. Pausing a paused item is a no-op.
    pub fn pause_download(&self, item_id: &str) -> Result<()> {
        let updated = {
            let mut state = self.lock();
            let appid = state
                .item(item_id)
                .map(|item| item.appid.clone())
                .ok_or_else(|| LauncherError::NotFound(format!("download {item_id}")))?;
            let mut updated = Vec::new();
            let SchedulerState { items, handles } = &mut *state;
            for item in items.iter_mut().filter(|item| item.appid == appid) {
                if !matches!(
                    item.status,
                    DownloadStatus::Queued | DownloadStatus::Downloading
                ) {
                    continue;
                }
                item.status = DownloadStatus::Paused;
                item.speed_bps = 0.0;
                item.eta_seconds = None;
                if let Some(handle) = handles.get(&item.id) {
                    let _ = handle.control.send(DownloadControl::Paused);
                }
                updated.push(item.clone());
            }
            updated
        };
        for item in &updated {
            self.persist(item);
            self.emit(item);
        }
        if !updated.is_empty() {
            tracing::info!("download paused item={} parts={}", item_id, updated.len());
        }
        Ok(())
    }

    /// Requeues every paused part of the game. Resuming a running game is a no-op.
    pub fn resume_group(&self, appid: &str) -> Result<()> {
        let updated = {
            let mut state = self.lock();
            let SchedulerState { items, handles } = &mut *state;
            let mut updated = Vec::new();
            for item in items
                .iter_mut()
                .filter(|item| item.appid == appid && item.status == DownloadStatus::Paused)
            {
                item.status = if handles.contains_key(&item.id) {
                    // Still winding down; flip it back instead of waiting.
                    if let Some(handle) = handles.get(&item.id) {
                        let _ = handle.control.send(DownloadControl::Running);
                    }
                    DownloadStatus::Downloading
                } else {
                    DownloadStatus::Queued
                };
                item.error = None;
                updated.push(item.clone());
            }
            updated
        };
        for item in &updated {
            self.persist(item);
            self.emit(item);
        }
        if !updated.is_empty() {
            tracing::info!("download resumed appid={} parts={}", appid, updated.len());
        }
        self.pump();
        Ok(())
    }

    /// Retries a failed or cancelled part, or resumes the paused game it belongs to.
    pub fn resume_download(&self, item_id: &str) -> Result<()> {
        let (appid, retried) = {
            let mut state = self.lock();
            let item = state
                .item_mut(item_id)
                .ok_or_else(|| LauncherError::NotFound(format!("download {item_id}")))?;
            let retried = if matches!(
                item.status,
                DownloadStatus::Failed | DownloadStatus::Cancelled
            ) {
                item.status = DownloadStatus::Queued;
                item.error = None;
                item.completed_at = None;
                Some(item.clone())
            } else {
                None
            };
            (item.appid.clone(), retried)
        };
        if let Some(item) = retried {
            let _ = self
                .db
                .set_installing_status(&appid, InstallingStatus::Downloading, None);
            self.persist(&item);
            self.emit(&item);
        }
        self.resume_group(&appid)
    }

    /// Cancels every queued, running or paused part of the game.
    pub fn cancel_group(&self, appid: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .lock()
            .items
            .iter()
            .filter(|item| item.appid == appid)
            .map(|item| item.id.clone())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel_item(&id)? {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            let _ = self.db.set_installing_status(
                appid,
                InstallingStatus::Cancelled,
                None,
            );
            tracing::info!("download group cancelled appid={} parts={}", appid, cancelled);
        }
        Ok(cancelled)
    }

    pub fn cancel_download(&self, item_id: &str) -> Result<()> {
        if self.lock().item(item_id).is_none() {
            return Err(LauncherError::NotFound(format!("download {item_id}")));
        }
        self.cancel_item(item_id)?;
        self.pump();
        Ok(())
    }

    fn cancel_item(&self, item_id: &str) -> Result<bool> {
        let (item, in_flight) = {
            let mut state = self.lock();
            let in_flight = state.handles.get(item_id).cloned();
            let Some(item) = state.item_mut(item_id) else {
                return Ok(false);
            };
            if !matches!(
                item.status,
                DownloadStatus::Queued | DownloadStatus::Downloading | DownloadStatus::Paused
            ) {
                return Ok(false);
            }
            item.status = DownloadStatus::Cancelled;
            item.speed_bps = 0.0;
            item.eta_seconds = None;
            if let Some(handle) = in_flight.as_ref() {
                let _ = handle.control.send(DownloadControl::Cancelled);
            }
            (item.clone(), in_flight.is_some())
        };
        // The worker owns the partial file while it runs and removes it itself.
        if !in_flight && !self.config.keep_partial_on_cancel {
            if let Some(path) = item.save_path.as_deref() {
                let _ = std::fs::remove_file(path);
            }
        }
        self.persist(&item);
        self.emit(&item);
        Ok(true)
    }

    /// Drops an item from the list, cancelling it first if it is still live.
    pub fn remove_download(&self, item_id: &str) -> Result<()> {
        let status = self
            .lock()
            .item(item_id)
            .map(|item| item.status)
            .ok_or_else(|| LauncherError::NotFound(format!("download {item_id}")))?;
        if matches!(status, DownloadStatus::Extracting | DownloadStatus::Installing) {
            return Err(LauncherError::ExtractionInProgress(item_id.to_string()));
        }
        self.cancel_item(item_id)?;
        self.lock().items.retain(|item| item.id != item_id);
        self.db.remove_download(item_id)?;
        self.pump();
        Ok(())
    }

    /// Forgets the game's finished items. Live items are kept.
    pub fn clear_group(&self, appid: &str) -> Result<usize> {
        self.clear_where(|item| item.appid == appid && is_clearable(item.status))
    }

    /// Forgets every installed item.
    pub fn clear_completed(&self) -> Result<usize> {
        self.clear_where(|item| item.status == DownloadStatus::Installed)
    }

    fn clear_where(&self, predicate: impl Fn(&DownloadItem) -> bool) -> Result<usize> {
        let removed: Vec<String> = {
            let mut state = self.lock();
            let removed = state
                .items
                .iter()
                .filter(|item| predicate(item))
                .map(|item| item.id.clone())
                .collect();
            state.items.retain(|item| !predicate(item));
            removed
        };
        for id in &removed {
            self.db.remove_download(id)?;
        }
        Ok(removed.len())
    }

    /// Runs the install step again for a game whose extraction failed. The
    /// downloaded parts are reused.
    pub async fn retry_extraction(&self, appid: &str) -> Result<()> {
        {
            let state = self.lock();
            let members: Vec<&DownloadItem> =
                state.items.iter().filter(|item| item.appid == appid).collect();
            if members.is_empty() {
                return Err(LauncherError::NotFound(format!("downloads for {appid}")));
            }
            if !members.iter().all(|item| {
                matches!(
                    item.status,
                    DownloadStatus::ExtractFailed | DownloadStatus::Completed
                )
            }) {
                return Err(LauncherError::Config(format!(
                    "{appid} is not waiting for a retry"
                )));
            }
        }
        self.set_group_status(appid, DownloadStatus::Completed, None);
        self.install_group(appid).await
    }

    /// Admits queued items while global and per-host slots are free.
    fn pump(&self) {
        let admitted: Vec<(DownloadItem, watch::Receiver<DownloadControl>)> = {
            let mut state = self.lock();
            let mut per_host: HashMap<String, usize> = HashMap::new();
            for handle in state.handles.values() {
                *per_host.entry(handle.host.clone()).or_default() += 1;
            }
            let mut active = state.handles.len();
            let mut admitted = Vec::new();
            let mut paused_groups: HashSet<String> = HashSet::new();
            for item in state.items.iter() {
                if state.group_paused(&item.appid) {
                    paused_groups.insert(item.appid.clone());
                }
            }

            let SchedulerState { items, handles } = &mut *state;
            for item in items.iter_mut() {
                if active >= self.config.max_concurrent_downloads {
                    break;
                }
                if item.status != DownloadStatus::Queued
                    || handles.contains_key(&item.id)
                    || paused_groups.contains(&item.appid)
                {
                    continue;
                }
                let host = host_key(&item.host);
                let host_active = per_host.get(&host).copied().unwrap_or(0);
                if host_active >= self.config.max_downloads_per_host {
                    continue;
                }
                let (tx, rx) = watch::channel(DownloadControl::Running);
                handles.insert(
                    item.id.clone(),
                    DownloadHandle {
                        control: tx,
                        host: host.clone(),
                    },
                );
                *per_host.entry(host).or_default() += 1;
                active += 1;
                item.status = DownloadStatus::Downloading;
                item.error = None;
                admitted.push((item.clone(), rx));
            }
            admitted
        };

        for (item, rx) in admitted {
            self.persist(&item);
            self.emit(&item);
            tracing::info!(
                "download admitted id={} appid={} host={} part={:?}",
                item.id,
                item.appid,
                item.host,
                item.part_index
            );
            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_item(item, rx).await;
            });
        }
    }

    async fn run_item(&self, item: DownloadItem, mut rx: watch::Receiver<DownloadControl>) {
        let result = self.execute(&item, &mut rx).await;
        let finished = {
            let mut state = self.lock();
            state.handles.remove(&item.id);
            let Some(current) = state.item_mut(&item.id) else {
                return;
            };
            current.speed_bps = 0.0;
            current.eta_seconds = None;
            match result {
                Ok(TransferOutcome::Completed { received, total }) => {
                    if current.status == DownloadStatus::Cancelled {
                        None
                    } else {
                        current.set_progress(received, total);
                        current.status = DownloadStatus::Completed;
                        current.completed_at = Some(chrono::Utc::now().timestamp());
                        current.error = None;
                        Some(current.clone())
                    }
                }
                Ok(TransferOutcome::Paused { received, total }) => {
                    current.set_progress(current.received_bytes.max(received), total);
                    // A resume or cancel may have arrived while the worker wound down.
                    match current.status {
                        DownloadStatus::Downloading => current.status = DownloadStatus::Queued,
                        DownloadStatus::Queued | DownloadStatus::Paused => {}
                        DownloadStatus::Cancelled => {
                            if !self.config.keep_partial_on_cancel {
                                if let Some(path) = current.save_path.as_deref() {
                                    let _ = std::fs::remove_file(path);
                                }
                            }
                        }
                        _ => current.status = DownloadStatus::Paused,
                    }
                    Some(current.clone())
                }
                Ok(TransferOutcome::Cancelled { .. }) | Err(LauncherError::Cancelled) => {
                    current.status = DownloadStatus::Cancelled;
                    Some(current.clone())
                }
                Err(err) => {
                    if current.status == DownloadStatus::Cancelled {
                        None
                    } else {
                        tracing::error!(
                            "download failed id={} appid={} host={}: {}",
                            current.id,
                            current.appid,
                            current.host,
                            err
                        );
                        current.status = DownloadStatus::Failed;
                        current.error = Some(err.user_message());
                        Some(current.clone())
                    }
                }
            }
        };

        if let Some(updated) = finished.as_ref() {
            self.persist(updated);
            self.emit(updated);
            if updated.status == DownloadStatus::Failed {
                let _ = self.db.set_installing_status(
                    &updated.appid,
                    InstallingStatus::Failed,
                    updated.error.as_deref(),
                );
            }
        }
        self.pump();

        if finished
            .as_ref()
            .map_or(false, |item| item.status == DownloadStatus::Completed)
            && self.group_ready(&item.appid)
        {
            if let Err(err) = self.install_group(&item.appid).await {
                tracing::warn!("install step for appid={} ended with: {}", item.appid, err);
            }
        }
    }

    /// Resolves and transfers one part, falling back to the same part on
    /// another host when the current one is dead.
    async fn execute(
        &self,
        item: &DownloadItem,
        rx: &mut watch::Receiver<DownloadControl>,
    ) -> Result<TransferOutcome> {
        let save_path = item
            .save_path
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| LauncherError::Config(format!("download {} has no path", item.id)))?;
        let first = PartSource {
            host: item.host.clone(),
            url: Some(item.original_url.clone().unwrap_or_else(|| item.url.clone())),
        };
        let sources: Vec<PartSource> = std::iter::once(first)
            .chain(item.fallbacks.iter().cloned())
            .filter(|source| source.url.is_some())
            .collect();

        let mut last_error = None;
        for (index, source) in sources.iter().enumerate() {
            if *rx.borrow() == DownloadControl::Cancelled {
                return Err(LauncherError::Cancelled);
            }
            let link = source.url.as_deref().unwrap_or_default();
            if index > 0 {
                tracing::warn!(
                    "falling back id={} part={:?} host={}",
                    item.id,
                    item.part_index,
                    source.host
                );
                // A different host may package the part differently.
                let _ = tokio::fs::remove_file(&save_path).await;
                self.switch_host(&item.id, &source.host, link);
            }

            let resolved = match self.resolver.resolve(&source.host, link).await {
                Ok(resolved) if resolved.resolved => resolved,
                Ok(_) => {
                    last_error = Some(LauncherError::dead_link(
                        &source.host,
                        format!("{} link could not be resolved.", host_label(&source.host)),
                    ));
                    continue;
                }
                Err(err) if err.is_dead_link() => {
                    last_error = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.update_item(&item.id, |current| {
                current.url = resolved.url.clone();
                if let Some(size) = resolved.size {
                    current.advance_progress(current.received_bytes, size);
                }
            });

            let request = TransferRequest {
                item_id: item.id.clone(),
                host: host_key(&source.host),
                url: resolved.url.clone(),
                save_path: save_path.clone(),
                expected_size: resolved.size,
            };
            let manager = self.clone();
            let item_id = item.id.clone();
            let mut on_progress = move |progress: TransferProgress| {
                manager.record_progress(&item_id, progress);
            };
            match self.worker.transfer(&request, rx, &mut on_progress).await {
                Err(err) if err.is_dead_link() => {
                    last_error = Some(err);
                    continue;
                }
                other => return other,
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LauncherError::dead_link(&item.host, "no usable link for this part")
        }))
    }

    /// Points the item and its running handle at a fallback host. Byte counts
    /// are left alone so progress never rewinds mid-download.
    fn switch_host(&self, item_id: &str, host: &str, link: &str) {
        let updated = {
            let mut state = self.lock();
            if let Some(handle) = state.handles.get_mut(item_id) {
                handle.host = host_key(host);
            }
            let Some(item) = state.item_mut(item_id) else {
                return;
            };
            item.host = host.to_string();
            item.original_url = Some(link.to_string());
            item.speed_bps = 0.0;
            item.eta_seconds = None;
            item.clone()
        };
        self.persist(&updated);
        self.emit(&updated);
        self.pump();
    }

    fn record_progress(&self, item_id: &str, progress: TransferProgress) {
        let updated = {
            let mut state = self.lock();
            let Some(item) = state.item_mut(item_id) else {
                return;
            };
            if item.status != DownloadStatus::Downloading {
                return;
            }
            item.advance_progress(progress.received_bytes, progress.total_bytes);
            item.speed_bps = progress.speed_bps;
            item.eta_seconds = progress.eta_seconds;
            item.clone()
        };
        self.persist(&updated);
        self.emit(&updated);
    }

    fn group_ready(&self, appid: &str) -> bool {
        let state = self.lock();
        let mut members = state.items.iter().filter(|item| item.appid == appid).peekable();
        members.peek().is_some()
            && members.all(|item| item.status == DownloadStatus::Completed)
    }

    /// Extracts the game's parts, then registers the install. Only one caller
    /// gets past the status switch; the extractor rejects any other.
    async fn install_group(&self, appid: &str) -> Result<()> {
        let parts: Vec<PathBuf> = {
            let mut state = self.lock();
            let ready = state
                .items
                .iter()
                .filter(|item| item.appid == appid)
                .all(|item| item.status == DownloadStatus::Completed);
            if !ready {
                return Ok(());
            }
            let mut parts = Vec::new();
            for item in state.items.iter_mut().filter(|item| item.appid == appid) {
                item.status = DownloadStatus::Extracting;
                if let Some(path) = item.save_path.as_ref() {
                    parts.push(PathBuf::from(path));
                }
            }
            parts
        };
        self.emit_group(appid);
        let _ = self
            .db
            .set_installing_status(appid, InstallingStatus::Extracting, None);

        let folder = parts
            .first()
            .and_then(|path| path.parent())
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| safe_folder_name(appid));
        let job = ExtractJob {
            appid: appid.to_string(),
            folder,
            parts,
        };
        let install_dir = match self.extractor.extract(job).await {
            Ok(dir) => dir,
            Err(err) => {
                self.fail_install(appid, &err);
                return Err(err);
            }
        };

        self.set_group_status(appid, DownloadStatus::Installing, None);
        let (metadata, version_label) = self.install_metadata(appid);
        match self
            .registry
            .register(appid, metadata, &install_dir, version_label)
            .await
        {
            Ok(_) => {
                self.set_group_status(appid, DownloadStatus::Installed, None);
                tracing::info!("game installed appid={} path={}", appid, install_dir.display());
                let _ = self.events.send(LauncherEvent::InstalledChanged {
                    appid: appid.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                self.fail_install(appid, &err);
                Err(err)
            }
        }
    }

    fn fail_install(&self, appid: &str, err: &LauncherError) {
        let err = match err {
            LauncherError::Extraction(_) => err.user_message(),
            other => LauncherError::Extraction(other.to_string()).user_message(),
        };
        self.set_group_status(appid, DownloadStatus::ExtractFailed, Some(err.clone()));
        let _ = self
            .db
            .set_installing_status(appid, InstallingStatus::Failed, Some(&err));
    }

    fn install_metadata(&self, appid: &str) -> (Value, Option<String>) {
        let (name, version_label) = {
            let state = self.lock();
            let first = state.items.iter().find(|item| item.appid == appid);
            (
                first.map(|item| item.game_name.clone()),
                first.and_then(|item| item.version_label.clone()),
            )
        };
        let metadata = self
            .db
            .get_installing(appid)
            .ok()
            .flatten()
            .map(|record| record.metadata)
            .unwrap_or_else(|| json!({ "appid": appid, "name": name.unwrap_or_default() }));
        (metadata, version_label)
    }

    fn set_group_status(&self, appid: &str, status: DownloadStatus, error: Option<String>) {
        {
            let mut state = self.lock();
            for item in state.items.iter_mut().filter(|item| item.appid == appid) {
                item.status = status;
                item.error = error.clone();
                item.speed_bps = 0.0;
                item.eta_seconds = None;
            }
        }
        self.emit_group(appid);
    }

    fn emit_group(&self, appid: &str) {
        let members: Vec<DownloadItem> = self
            .lock()
            .items
            .iter()
            .filter(|item| item.appid == appid)
            .cloned()
            .collect();
        for item in &members {
            self.persist(item);
            self.emit(item);
        }
    }

    fn update_item(&self, item_id: &str, apply: impl FnOnce(&mut DownloadItem)) {
        let updated = {
            let mut state = self.lock();
            let Some(item) = state.item_mut(item_id) else {
                return;
            };
            apply(item);
            item.clone()
        };
        self.persist(&updated);
        self.emit(&updated);
    }

    fn persist(&self, item: &DownloadItem) {
        if let Err(err) = self.db.upsert_download(item) {
            tracing::warn!("failed to persist download id={}: {}", item.id, err);
        }
    }

    fn emit(&self, item: &DownloadItem) {
        let _ = self.events.send(LauncherEvent::DownloadUpdate { item: item.clone() });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn blocks_new_start(status: DownloadStatus) -> bool {
    status.is_active() || status == DownloadStatus::Completed
}

fn is_clearable(status: DownloadStatus) -> bool {
    matches!(
        status,
        DownloadStatus::Installed
            | DownloadStatus::Cancelled
            | DownloadStatus::Failed
            | DownloadStatus::ExtractFailed
    )
}

/// Limits and cooldowns are keyed by the canonical host name.
fn is_direct_link(link: &str) -> bool {
    link.starts_with("http://") || link.starts_with("https://")
}

/// Picks the host to download from: the preferred one when it has links,
/// otherwise rootz, pixeldrain, then any host whose links are direct URLs.
fn select_host(
    links: LinksResult,
    preferred: &str,
) -> Result<(BTreeMap<String, Vec<String>>, String, Vec<String>)> {
    let hosts = match links {
        LinksResult::Hosts(hosts) => hosts,
        LinksResult::Redirect(url) => {
            let host = host_for_url(&url).unwrap_or(DIRECT_HOST).to_string();
            let hosts = BTreeMap::from([(host.clone(), vec![url.clone()])]);
            return Ok((hosts, host, vec![url]));
        }
    };

    let find = |wanted: &str| {
        hosts
            .iter()
            .find(|(name, links)| !links.is_empty() && same_host(name, wanted))
            .map(|(name, links)| (name.clone(), links.clone()))
    };
    let chosen = find(preferred)
        .or_else(|| find(ROOTZ))
        .or_else(|| find(PIXELDRAIN))
        .or_else(|| {
            hosts
                .iter()
                .find(|(name, links)| {
                    canonical_host(name).is_none()
                        && !links.is_empty()
                        && links.iter().all(|link| is_direct_link(link))
                })
                .map(|(name, links)| (name.clone(), links.clone()))
        });
    let Some((host, part_links)) = chosen else {
        return Err(LauncherError::NotFound(
            "no supported download host for this game".to_string(),
        ));
    };
    Ok((hosts, host, part_links))
}

fn same_host(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || (canonical_host(a).is_some() && canonical_host(a) == canonical_host(b))
}

fn link_on_host(hosts: &BTreeMap<String, Vec<String>>, host: &str, position: usize) -> Option<String> {
    hosts
        .iter()
        .find(|(name, _)| same_host(name, host))
        .and_then(|(_, links)| links.get(position).cloned())
}

fn build_items(
    game: &Game,
    config: &DownloadConfig,
    host: &str,
    part_links: &[String],
    hosts: &BTreeMap<String, Vec<String>>,
    dir: &Path,
) -> Vec<DownloadItem> {
    let parsed: Vec<Option<u32>> = part_links
        .iter()
        .map(|link| infer_filename_from_url(link).and_then(|name| parse_part_index(&name)))
        .collect();
    let part_total = parsed
        .iter()
        .flatten()
        .copied()
        .max()
        .unwrap_or(0)
        .max(part_links.len() as u32);
    let folder = dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let started_at = chrono::Utc::now().timestamp();
    let mut used_names = HashSet::new();
    let mut items = Vec::with_capacity(part_links.len());

    for (position, default_link) in part_links.iter().enumerate() {
        let part_number = position as u32 + 1;
        let (item_host, link) = match config.part_overrides.get(&part_number) {
            Some(source) => {
                let link = source
                    .url
                    .clone()
                    .filter(|url| !url.is_empty())
                    .or_else(|| link_on_host(hosts, &source.host, position));
                match link {
                    Some(link) => (source.host.clone(), link),
                    None => {
                        tracing::warn!(
                            "override for part {} on {} has no link, keeping {}",
                            part_number,
                            source.host,
                            host
                        );
                        (host.to_string(), default_link.clone())
                    }
                }
            }
            None => (host.to_string(), default_link.clone()),
        };

        let fallbacks: Vec<PartSource> = hosts
            .iter()
            .filter(|(name, _)| !same_host(name, &item_host))
            .filter_map(|(name, links)| {
                links.get(position).map(|url| PartSource {
                    host: name.clone(),
                    url: Some(url.clone()),
                })
            })
            .collect();

        let filename = infer_filename_from_url(&link)
            .unwrap_or_else(|| format!("{folder}-part{part_number}"));
        let filename = unique_name(&filename, &mut used_names);
        let save_path = dir.join(&filename);
        let multi = part_total > 1;

        items.push(DownloadItem {
            id: Uuid::new_v4().to_string(),
            appid: game.appid.clone(),
            game_name: game.name.clone(),
            host: item_host,
            url: link.clone(),
            original_url: Some(link),
            filename,
            status: DownloadStatus::Queued,
            received_bytes: 0,
            total_bytes: 0,
            speed_bps: 0.0,
            eta_seconds: None,
            part_index: multi.then(|| parsed[position].unwrap_or(part_number)),
            part_total: multi.then_some(part_total),
            save_path: Some(save_path.to_string_lossy().to_string()),
            version_label: config
                .version_label
                .clone()
                .or_else(|| game.version.clone()),
            fallbacks,
            started_at,
            completed_at: None,
            error: None,
        });
    }
    items
}

/// `name`, or `base-N.ext` when another part of the same game already uses it.
fn unique_name(name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_ascii_lowercase()) {
        return name.to_string();
    }
    let path = Path::new(name);
    let base = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|value| format!(".{}", value.to_string_lossy()))
        .unwrap_or_default();
    let mut index = 1;
    loop {
        let candidate = format!("{base}-{index}{ext}");
        if used.insert(candidate.to_ascii_lowercase()) {
            return candidate;
        }
        index += 1;
    }
}
