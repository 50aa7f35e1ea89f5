use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::errors::{LauncherError, Result};
use crate::services::transfer::DownloadControl;

/// Process-wide spacing between consecutive transfer starts on one host.
///
/// Each caller reserves the next free slot under the lock, so two workers can
/// never compute the same stale timestamp.
#[derive(Clone, Default)]
pub struct HostCooldown {
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl HostCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    async fn reserve(&self, host: &str, cooldown: Duration) -> Instant {
        let now = Instant::now();
        let mut slots = self.next_slot.lock().await;
        let slot = slots
            .get(host)
            .copied()
            .filter(|next| *next > now)
            .unwrap_or(now);
        slots.insert(host.to_string(), slot + cooldown);
        slot
    }

    /// Waits for this host's next slot with nothing able to interrupt it.
    /// Availability checks use this so they queue behind transfers on the same host.
    pub async fn wait(&self, host: &str, cooldown: Duration) {
        if cooldown.is_zero() {
            return;
        }
        let slot = self.reserve(host, cooldown).await;
        tokio::time::sleep_until(slot).await;
    }

    /// Waits for this host's next start slot. Cancellation wins over the wait.
    pub async fn wait_turn(
        &self,
        host: &str,
        cooldown: Duration,
        control: &mut watch::Receiver<DownloadControl>,
    ) -> Result<()> {
        if cooldown.is_zero() {
            return Ok(());
        }
        let slot = self.reserve(host, cooldown).await;
        if slot > Instant::now() {
            tracing::debug!(
                "host cooldown host={} wait_ms={}",
                host,
                slot.saturating_duration_since(Instant::now()).as_millis()
            );
        }
        let sleep = tokio::time::sleep_until(slot);
        tokio::pin!(sleep);
        loop {
            if *control.borrow() == DownloadControl::Cancelled {
                return Err(LauncherError::Cancelled);
            }
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = control.changed() => {
                    if changed.is_err() {
                        return Err(LauncherError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Global bytes-per-second cap shared by every transfer.
#[derive(Clone)]
pub struct BandwidthThrottler {
    max_bytes_per_second: Arc<Mutex<u64>>,
    current_window_bytes: Arc<Mutex<u64>>,
    reset_started: Arc<AtomicBool>,
}

impl BandwidthThrottler {
    pub fn new(max_bps: u64) -> Self {
        Self {
            max_bytes_per_second: Arc::new(Mutex::new(max_bps)),
            current_window_bytes: Arc::new(Mutex::new(0)),
            reset_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn set_limit(&self, max_bps: u64) {
        let mut guard = self.max_bytes_per_second.lock().await;
        *guard = max_bps;
    }

    pub async fn acquire(&self, bytes: u64) {
        loop {
            let max = *self.max_bytes_per_second.lock().await;
            if max == 0 {
                return;
            }
            self.start_reset_task();
            let mut current = self.current_window_bytes.lock().await;
            // A single chunk larger than the whole budget still has to pass.
            if *current == 0 || *current + bytes <= max {
                *current += bytes;
                return;
            }
            drop(current);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn start_reset_task(&self) {
        if self.reset_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            self.reset_started.store(false, Ordering::SeqCst);
            return;
        }
        let counter = self.current_window_bytes.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let mut guard = counter.lock().await;
                *guard = 0;
            }
        });
    }
}
