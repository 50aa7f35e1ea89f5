use std::collections::HashMap;
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::errors::{LauncherError, Result};
use crate::models::{LauncherEvent, RunningGameRecord};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

pub const MONITOR_INTERVAL: Duration = Duration::from_millis(750);

#[derive(Clone, Debug)]
struct TrackedGame {
    record: RunningGameRecord,
    install_dir: PathBuf,
}

/// Tracks launched games by pid, falling back to any process running from the
/// install folder so elevated or self-relaunching games are still seen.
#[derive(Clone)]
pub struct GameRuntimeService {
    inner: Arc<Mutex<HashMap<String, TrackedGame>>>,
    events: broadcast::Sender<LauncherEvent>,
}

impl GameRuntimeService {
    pub fn new(events: broadcast::Sender<LauncherEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn list(&self) -> Vec<RunningGameRecord> {
        let map = self.lock();
        let mut items: Vec<RunningGameRecord> =
            map.values().map(|tracked| tracked.record.clone()).collect();
        items.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        items
    }

    pub fn running(&self, appid: &str) -> Option<RunningGameRecord> {
        self.lock().get(appid).map(|tracked| tracked.record.clone())
    }

    /// Starts `exe` from its own folder and begins tracking it.
    pub fn launch(
        &self,
        appid: &str,
        exe: &Path,
        install_dir: &Path,
        as_admin: bool,
    ) -> Result<RunningGameRecord> {
        if let Some(existing) = self.running(appid) {
            return Err(LauncherError::Config(format!(
                "{} is already running (pid {})",
                appid, existing.pid
            )));
        }
        if !exe.is_file() {
            return Err(LauncherError::NotFound(format!(
                "executable {}",
                exe.display()
            )));
        }
        let working_dir = exe.parent().unwrap_or(install_dir).to_path_buf();

        let pid = if as_admin {
            launch_with_admin(exe, &working_dir)?
        } else {
            let mut child = Command::new(exe)
                .current_dir(&working_dir)
                .stdin(Stdio::null())
                .spawn()?;
            let pid = child.id();
            let appid_for_thread = appid.to_string();
            // Reap the child; the monitor decides when the game has stopped.
            std::thread::spawn(move || {
                let status = child.wait();
                tracing::debug!(
                    "game process exited appid={} pid={} status={:?}",
                    appid_for_thread,
                    pid,
                    status.ok().and_then(|s| s.code())
                );
            });
            pid
        };

        tracing::info!(
            "game launched appid={} pid={} admin={} exe={}",
            appid,
            pid,
            as_admin,
            exe.display()
        );
        Ok(self.track(appid, pid, exe, install_dir))
    }

    /// Starts tracking a process that was started elsewhere.
    pub fn track(&self, appid: &str, pid: u32, exe: &Path, install_dir: &Path) -> RunningGameRecord {
        let record = RunningGameRecord {
            appid: appid.to_string(),
            pid,
            exe_path: exe.to_string_lossy().to_string(),
            started_at: chrono::Utc::now().timestamp(),
        };
        self.lock().insert(
            appid.to_string(),
            TrackedGame {
                record: record.clone(),
                install_dir: install_dir.to_path_buf(),
            },
        );
        record
    }

    /// Kills the tracked process tree. On failure the game stays tracked so the user can retry.
    pub fn quit(&self, appid: &str) -> Result<()> {
        let tracked = self
            .take(appid)
            .ok_or_else(|| LauncherError::NotFound(format!("{appid} is not running")))?;
        if let Err(err) = kill_pid(tracked.record.pid) {
            self.lock().insert(appid.to_string(), tracked);
            return Err(err);
        }
        tracing::info!("game stopped by user appid={} pid={}", appid, tracked.record.pid);
        let _ = self.events.send(LauncherEvent::GameStopped {
            appid: appid.to_string(),
            pid: tracked.record.pid,
        });
        Ok(())
    }

    /// One monitor pass: keeps live games, follows hand-offs inside the install
    /// folder, and drops games whose processes are all gone.
    pub fn poll(&self, sys: &mut System) {
        if self.lock().is_empty() {
            return;
        }
        sys.refresh_processes();
        let snapshot: Vec<TrackedGame> = self.lock().values().cloned().collect();
        for tracked in snapshot {
            let appid = &tracked.record.appid;
            if is_alive(sys, tracked.record.pid) {
                continue;
            }
            if let Some(pid) = find_process_under(sys, &tracked.install_dir) {
                let mut map = self.lock();
                if let Some(current) = map.get_mut(appid) {
                    if current.record.pid == tracked.record.pid {
                        tracing::info!(
                            "game handed off appid={} old_pid={} new_pid={}",
                            appid,
                            tracked.record.pid,
                            pid
                        );
                        current.record.pid = pid;
                    }
                }
                continue;
            }
            if self.take_if_pid_matches(appid, tracked.record.pid).is_some() {
                tracing::info!("game exited appid={} pid={}", appid, tracked.record.pid);
                let _ = self.events.send(LauncherEvent::GameStopped {
                    appid: appid.clone(),
                    pid: tracked.record.pid,
                });
            }
        }
    }

    /// Polls every `interval` until the returned task is aborted.
    pub fn start_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let sys = Arc::new(Mutex::new(System::new()));
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let service = service.clone();
                let sys = sys.clone();
                let pass = tokio::task::spawn_blocking(move || {
                    let mut sys = match sys.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    service.poll(&mut sys);
                })
                .await;
                if let Err(err) = pass {
                    tracing::warn!("game monitor pass failed: {}", err);
                }
            }
        })
    }

    fn take(&self, appid: &str) -> Option<TrackedGame> {
        self.lock().remove(appid)
    }

    fn take_if_pid_matches(&self, appid: &str, pid: u32) -> Option<TrackedGame> {
        let mut map = self.lock();
        match map.get(appid) {
            Some(tracked) if tracked.record.pid == pid => map.remove(appid),
            _ => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TrackedGame>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn is_alive(sys: &System, pid: u32) -> bool {
    sys.process(Pid::from_u32(pid))
        .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

fn find_process_under(sys: &System, install_dir: &Path) -> Option<u32> {
    if install_dir.as_os_str().is_empty() {
        return None;
    }
    sys.processes()
        .iter()
        .filter(|(_, process)| {
            !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
        })
        .find(|(_, process)| {
            process
                .exe()
                .map(|exe| exe.starts_with(install_dir))
                .unwrap_or(false)
        })
        .map(|(pid, _)| pid.as_u32())
}

#[cfg(target_os = "windows")]
fn launch_with_admin(exe_path: &Path, working_dir: &Path) -> Result<u32> {
    let quote = |value: &str| format!("'{}'", value.replace('\'', "''"));
    let script = format!(
        "$ErrorActionPreference='Stop'; (Start-Process -FilePath {} -WorkingDirectory {} -Verb RunAs -PassThru).Id",
        quote(exe_path.to_string_lossy().as_ref()),
        quote(working_dir.to_string_lossy().as_ref()),
    );

    let output = Command::new("powershell")
        .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", &script])
        .creation_flags(CREATE_NO_WINDOW)
        .output()?;
    if !output.status.success() {
        return Err(LauncherError::Config(
            "Admin launch request was rejected.".to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .last()
        .and_then(|token| token.parse::<u32>().ok())
        .ok_or_else(|| {
            LauncherError::Config(format!(
                "Admin launch succeeded but PID was not returned: {stdout}"
            ))
        })
}

#[cfg(not(target_os = "windows"))]
fn launch_with_admin(_exe_path: &Path, _working_dir: &Path) -> Result<u32> {
    Err(LauncherError::Config(
        "Admin launch is only supported on Windows.".to_string(),
    ))
}

#[cfg(target_os = "windows")]
fn kill_pid(pid: u32) -> Result<()> {
    let pid_arg = pid.to_string();
    let output = Command::new("taskkill")
        .args(["/PID", &pid_arg, "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW)
        .output()?;
    if output.status.success() {
        return Ok(());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{stdout}\n{stderr}").to_ascii_lowercase();
    if combined.contains("not found") || combined.contains("no running instance") {
        return Ok(());
    }

    // Elevated games need an elevated taskkill.
    let script = format!(
        "$ErrorActionPreference='Stop'; $p=Start-Process -FilePath 'taskkill' -ArgumentList @('/PID','{pid}','/T','/F') -Verb RunAs -WindowStyle Hidden -Wait -PassThru; exit $p.ExitCode"
    );
    let status = Command::new("powershell")
        .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", &script])
        .creation_flags(CREATE_NO_WINDOW)
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(LauncherError::Config(format!(
            "Failed to stop game (taskkill exit={:?}): {}",
            output.status.code(),
            stderr.trim()
        )))
    }
}

#[cfg(not(target_os = "windows"))]
fn kill_pid(pid: u32) -> Result<()> {
    let mut sys = System::new();
    sys.refresh_processes();
    match sys.process(Pid::from_u32(pid)) {
        None => Ok(()),
        Some(process) if process.kill() => Ok(()),
        Some(_) => Err(LauncherError::Config(format!(
            "Failed to stop game process {pid}"
        ))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    fn service() -> (GameRuntimeService, broadcast::Receiver<LauncherEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (GameRuntimeService::new(tx), rx)
    }

    #[test]
    fn poll_reports_exit_of_tracked_process() {
        let (runtime, mut events) = service();
        let install_dir = temp_dir("runtime-track");
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        runtime.track("10", pid, Path::new("/bin/sleep"), &install_dir);

        let mut sys = System::new();
        runtime.poll(&mut sys);
        assert_eq!(runtime.running("10").map(|r| r.pid), Some(pid));

        child.kill().unwrap();
        child.wait().unwrap();
        runtime.poll(&mut sys);
        assert!(runtime.running("10").is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            LauncherEvent::GameStopped {
                appid: "10".to_string(),
                pid
            }
        );
        let _ = std::fs::remove_dir_all(install_dir);
    }

    #[test]
    fn quit_stops_the_process_and_forgets_it() {
        let (runtime, mut events) = service();
        let install_dir = temp_dir("runtime-quit");
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        runtime.track("11", pid, Path::new("/bin/sleep"), &install_dir);

        runtime.quit("11").unwrap();
        child.wait().unwrap();
        assert!(runtime.list().is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            LauncherEvent::GameStopped { .. }
        ));
        assert!(matches!(runtime.quit("11"), Err(LauncherError::NotFound(_))));
        let _ = std::fs::remove_dir_all(install_dir);
    }

    #[test]
    fn launch_rejects_missing_executable_and_admin_off_windows() {
        let (runtime, _events) = service();
        let install_dir = temp_dir("runtime-launch");
        let missing = install_dir.join("Game.exe");
        assert!(matches!(
            runtime.launch("12", &missing, &install_dir, false),
            Err(LauncherError::NotFound(_))
        ));
        std::fs::write(&missing, b"MZ").unwrap();
        assert!(matches!(
            runtime.launch("12", &missing, &install_dir, true),
            Err(LauncherError::Config(_))
        ));
        assert!(runtime.list().is_empty());
        let _ = std::fs::remove_dir_all(install_dir);
    }
}
