use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use uc_direct_core::config::PipelineConfig;
use uc_direct_core::db::{self, Database};
use uc_direct_core::errors::Result;
use uc_direct_core::logging;
use uc_direct_core::models::LauncherEvent;
use uc_direct_core::services::{
    ApiClient, DownloadManager, GameRuntimeService, HostCooldown, HostResolver, InstalledRegistry,
};
use uc_direct_core::utils::paths::{resolve_data_dir, resolve_downloads_dir, resolve_log_dir};
use uc_direct_core::utils::FileManager;

const RUNTIME_POLL_INTERVAL: Duration = Duration::from_millis(750);

pub struct AppState {
    pub db: Database,
    pub config: Arc<PipelineConfig>,
    pub api: ApiClient,
    pub download_manager: DownloadManager,
    pub registry: InstalledRegistry,
    pub game_runtime: GameRuntimeService,
    pub files: FileManager,
    pub events: broadcast::Sender<LauncherEvent>,
}

fn build_state() -> Result<AppState> {
    let config = Arc::new(PipelineConfig::from_env());
    let db = db::init()?;
    let files = FileManager::new(resolve_downloads_dir());
    let (events, _) = broadcast::channel(512);

    let api = ApiClient::new(&config);
    let resolver = HostResolver::new(&config, api.clone());
    let registry = InstalledRegistry::new(
        db.clone(),
        files.clone(),
        resolve_data_dir().join("external"),
    );
    registry.restore_download_root()?;
    let download_manager = DownloadManager::new(
        config.clone(),
        db.clone(),
        api.clone(),
        resolver,
        registry.clone(),
        HostCooldown::new(),
        events.clone(),
    );
    let game_runtime = GameRuntimeService::new(events.clone());

    Ok(AppState {
        db,
        config,
        api,
        download_manager,
        registry,
        game_runtime,
        files,
        events,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&resolve_log_dir())?;
    let state = build_state()?;
    tracing::info!(
        "launcher core ready api={} downloads={} db={}",
        state.api.base_url(),
        state.files.download_root().display(),
        state.db.path().display()
    );

    let report = state.registry.repair().await?;
    if !report.is_clean() {
        tracing::warn!(
            "installed registry repaired removed={:?} restored={:?} unreadable={:?}",
            report.removed_index_entries,
            report.restored_index_entries,
            report.unreadable_manifests
        );
    }
    let interrupted = state.download_manager.recover_interrupted()?;
    if interrupted > 0 {
        tracing::warn!("{} downloads were interrupted by the last shutdown", interrupted);
    }
    if state.config.max_bytes_per_second > 0 {
        state
            .download_manager
            .set_download_limit(state.config.max_bytes_per_second)
            .await;
    }

    let monitor = state.game_runtime.start_monitor(RUNTIME_POLL_INTERVAL);
    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(LauncherEvent::DownloadUpdate { item }) => tracing::debug!(
                    "download id={} appid={} status={} {}/{}",
                    item.id,
                    item.appid,
                    item.status.as_str(),
                    item.received_bytes,
                    item.total_bytes
                ),
                Ok(LauncherEvent::InstalledChanged { appid }) => {
                    tracing::info!("installed games changed appid={}", appid)
                }
                Ok(LauncherEvent::GameStopped { appid, pid }) => {
                    tracing::info!("game stopped appid={} pid={}", appid, pid)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("event log skipped {} events", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    monitor.abort();
    let running = state.game_runtime.list();
    tracing::info!("shutting down running_games={}", running.len());
    Ok(())
}
