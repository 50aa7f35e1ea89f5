use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::config::PipelineConfig;
use crate::errors::{LauncherError, Result};
use crate::services::rate_limit::{BandwidthThrottler, HostCooldown};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadControl {
    Running,
    Paused,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub item_id: String,
    pub host: String,
    pub url: String,
    pub save_path: PathBuf,
    /// Size reported by the resolver, used to validate a resume offset.
    pub expected_size: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransferProgress {
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { received: u64, total: u64 },
    /// Partial file kept on disk; a later transfer resumes from its length.
    Paused { received: u64, total: u64 },
    Cancelled { received: u64 },
}

enum Attempt {
    Done(TransferOutcome),
    Retry(LauncherError),
}

/// Exponentially smoothed transfer rate.
struct SpeedMeter {
    speed_bps: f64,
    last_bytes: u64,
    last_sample: Instant,
    last_emit: Option<Instant>,
    interval: Duration,
}

impl SpeedMeter {
    fn new(initial_bytes: u64, interval: Duration) -> Self {
        Self {
            speed_bps: 0.0,
            last_bytes: initial_bytes,
            last_sample: Instant::now(),
            last_emit: None,
            interval,
        }
    }

    fn sample(&mut self, received: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();
        if elapsed < 0.05 {
            return;
        }
        let delta = received.saturating_sub(self.last_bytes) as f64;
        let instant = delta / elapsed.max(0.001);
        self.speed_bps = if self.speed_bps > 0.0 {
            self.speed_bps * 0.7 + instant * 0.3
        } else {
            instant
        };
        self.last_bytes = received;
        self.last_sample = now;
    }

    fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    fn progress(&self, received: u64, total: u64) -> TransferProgress {
        let remaining = total.saturating_sub(received);
        let eta_seconds = if self.speed_bps > 0.0 && total > 0 {
            Some((remaining as f64 / self.speed_bps).ceil() as u64)
        } else {
            None
        };
        TransferProgress {
            received_bytes: received,
            total_bytes: total,
            speed_bps: self.speed_bps,
            eta_seconds,
        }
    }
}

/// Streams one part to disk. The partial file at `save_path` is owned by the
/// worker for the duration of the call.
#[derive(Clone)]
pub struct TransferWorker {
    client: reqwest::Client,
    throttle: BandwidthThrottler,
    cooldown: HostCooldown,
    config: Arc<PipelineConfig>,
}

impl TransferWorker {
    pub fn new(config: Arc<PipelineConfig>, cooldown: HostCooldown) -> Self {
        Self {
            client: config.http_client(),
            throttle: BandwidthThrottler::new(config.max_bytes_per_second),
            cooldown,
            config,
        }
    }

    pub fn throttle(&self) -> &BandwidthThrottler {
        &self.throttle
    }

    pub async fn transfer(
        &self,
        request: &TransferRequest,
        control: &mut watch::Receiver<DownloadControl>,
        on_progress: &mut (dyn FnMut(TransferProgress) + Send),
    ) -> Result<TransferOutcome> {
        if let Some(parent) = request.save_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let state = *control.borrow();
            match state {
                DownloadControl::Cancelled => return self.finish_cancel(request).await,
                DownloadControl::Paused => {
                    let received = file_len(&request.save_path).await;
                    return Ok(TransferOutcome::Paused {
                        received,
                        total: request.expected_size.unwrap_or(0).max(received),
                    });
                }
                DownloadControl::Running => {}
            }

            let cooldown = self.config.cooldown_for(&request.host);
            if let Err(err) = self.cooldown.wait_turn(&request.host, cooldown, control).await {
                if matches!(err, LauncherError::Cancelled) {
                    return self.finish_cancel(request).await;
                }
                return Err(err);
            }

            let error = match self.attempt(request, control, on_progress).await {
                Ok(Attempt::Done(TransferOutcome::Cancelled { .. })) => {
                    return self.finish_cancel(request).await
                }
                Ok(Attempt::Done(outcome)) => return Ok(outcome),
                Ok(Attempt::Retry(err)) => err,
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            if attempt >= self.config.transfer_max_attempts {
                tracing::warn!(
                    "transfer giving up id={} host={} attempts={}: {}",
                    request.item_id,
                    request.host,
                    attempt,
                    error
                );
                return Err(error);
            }

            let delay = self.config.retry_delay(attempt);
            tracing::info!(
                "transfer retry id={} host={} attempt={} delay_ms={}: {}",
                request.item_id,
                request.host,
                attempt,
                delay.as_millis(),
                error
            );
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = control.changed() => {
                        if changed.is_err() {
                            return self.finish_cancel(request).await;
                        }
                        if *control.borrow() != DownloadControl::Running {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &TransferRequest,
        control: &mut watch::Receiver<DownloadControl>,
        on_progress: &mut (dyn FnMut(TransferProgress) + Send),
    ) -> Result<Attempt> {
        let mut offset = file_len(&request.save_path).await;
        if let Some(expected) = request.expected_size.filter(|size| *size > 0) {
            if offset == expected {
                on_progress(TransferProgress {
                    received_bytes: offset,
                    total_bytes: expected,
                    speed_bps: 0.0,
                    eta_seconds: None,
                });
                return Ok(Attempt::Done(TransferOutcome::Completed {
                    received: offset,
                    total: expected,
                }));
            }
            if offset > expected {
                tracing::warn!(
                    "partial file larger than remote size id={} local={} remote={}, restarting",
                    request.item_id,
                    offset,
                    expected
                );
                tokio::fs::remove_file(&request.save_path).await?;
                offset = 0;
            }
        }

        let mut builder = self.client.get(&request.url);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return Ok(Attempt::Retry(LauncherError::TransientNetwork(err.to_string()))),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(LauncherError::dead_link(
                &request.host,
                format!("HTTP {}", status.as_u16()),
            ));
        }
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            let remote_total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range_total);
            if remote_total == Some(offset) {
                return Ok(Attempt::Done(TransferOutcome::Completed {
                    received: offset,
                    total: offset,
                }));
            }
            tokio::fs::remove_file(&request.save_path).await?;
            return Ok(Attempt::Retry(LauncherError::TransientNetwork(
                "resume offset rejected by host".to_string(),
            )));
        }
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            return Ok(Attempt::Retry(LauncherError::TransientNetwork(format!(
                "HTTP {}",
                status.as_u16()
            ))));
        }
        if !status.is_success() {
            return Err(LauncherError::Http(format!(
                "HTTP {} from {}",
                status.as_u16(),
                request.host
            )));
        }

        // A host that ignores the range header sends the whole file again.
        let mut skip = if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            tracing::info!(
                "host ignored range id={} host={}, skipping {} bytes",
                request.item_id,
                request.host,
                offset
            );
            offset
        } else {
            0
        };

        let mut total = if status == StatusCode::PARTIAL_CONTENT {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range_total)
                .or_else(|| response.content_length().map(|len| len + offset))
        } else {
            response.content_length()
        }
        .or(request.expected_size)
        .unwrap_or(0);
        if let Some(expected) = request.expected_size.filter(|size| *size > 0) {
            if total > 0 && total != expected {
                tracing::warn!(
                    "remote size differs from resolved size id={} remote={} resolved={}",
                    request.item_id,
                    total,
                    expected
                );
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.save_path)
            .await?;
        let mut received = offset;
        let mut meter = SpeedMeter::new(received, self.config.progress_interval);
        if total > 0 && received > total {
            total = received;
        }
        on_progress(meter.progress(received, total));

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                biased;
                changed = control.changed() => {
                    let state = if changed.is_err() {
                        DownloadControl::Cancelled
                    } else {
                        *control.borrow()
                    };
                    match state {
                        DownloadControl::Running => continue,
                        DownloadControl::Paused => {
                            file.flush().await?;
                            on_progress(TransferProgress {
                                speed_bps: 0.0,
                                eta_seconds: None,
                                ..meter.progress(received, total)
                            });
                            return Ok(Attempt::Done(TransferOutcome::Paused { received, total }));
                        }
                        DownloadControl::Cancelled => {
                            file.flush().await?;
                            return Ok(Attempt::Done(TransferOutcome::Cancelled { received }));
                        }
                    }
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(chunk)) => {
                            let mut data = &chunk[..];
                            if skip > 0 {
                                let dropped = (skip as usize).min(data.len());
                                data = &data[dropped..];
                                skip -= dropped as u64;
                            }
                            if data.is_empty() {
                                continue;
                            }
                            self.throttle.acquire(data.len() as u64).await;
                            file.write_all(data).await?;
                            received += data.len() as u64;
                            if total > 0 && received > total {
                                total = received;
                            }
                            meter.sample(received);
                            if meter.due() {
                                on_progress(meter.progress(received, total));
                            }
                        }
                        Some(Err(err)) => {
                            file.flush().await?;
                            return Ok(Attempt::Retry(LauncherError::TransientNetwork(format!(
                                "stream interrupted at {} bytes: {}",
                                received, err
                            ))));
                        }
                        None => break,
                    }
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if total > 0 && received < total {
            return Ok(Attempt::Retry(LauncherError::TransientNetwork(format!(
                "stream ended early at {} of {} bytes",
                received, total
            ))));
        }
        if total == 0 {
            total = received;
        }
        on_progress(TransferProgress {
            received_bytes: received,
            total_bytes: total,
            speed_bps: meter.speed_bps,
            eta_seconds: Some(0),
        });
        Ok(Attempt::Done(TransferOutcome::Completed { received, total }))
    }

    async fn finish_cancel(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        let received = file_len(&request.save_path).await;
        if !self.config.keep_partial_on_cancel {
            match tokio::fs::remove_file(&request.save_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(
                    "failed to remove partial file {}: {}",
                    request.save_path.display(),
                    err
                ),
            }
        }
        Ok(TransferOutcome::Cancelled { received })
    }
}

pub async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{temp_dir, TestResponse, TestServer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 251) as u8).collect()
    }

    fn worker(config: PipelineConfig) -> TransferWorker {
        TransferWorker::new(Arc::new(config), HostCooldown::new())
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            host_cooldowns: Default::default(),
            retry_base: Duration::from_millis(10),
            retry_max: Duration::from_millis(20),
            progress_interval: Duration::from_millis(10),
            ..PipelineConfig::default()
        }
    }

    fn request(server: &TestServer, path: &str, save_path: PathBuf) -> TransferRequest {
        TransferRequest {
            item_id: "item-1".to_string(),
            host: "mirror".to_string(),
            url: server.url(path),
            save_path,
            expected_size: None,
        }
    }

    #[tokio::test]
    async fn resumes_from_existing_partial_file() {
        let data = payload(4096);
        let served = data.clone();
        let server = TestServer::start(move |request| TestResponse::ranged(request, &served));
        let dir = temp_dir("ucd-transfer");
        let save_path = dir.join("game.zip");
        std::fs::write(&save_path, &data[..1000]).unwrap();

        let (_tx, mut rx) = watch::channel(DownloadControl::Running);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut on_progress = move |progress: TransferProgress| {
            sink.lock().unwrap().push(progress);
        };
        let outcome = worker(fast_config())
            .transfer(&request(&server, "/game.zip", save_path.clone()), &mut rx, &mut on_progress)
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed { received: 4096, total: 4096 });
        assert_eq!(std::fs::read(&save_path).unwrap(), data);
        assert_eq!(
            server.requests()[0].header("range"),
            Some("bytes=1000-")
        );
        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|p| p.received_bytes <= p.total_bytes));
        assert!(seen.windows(2).all(|w| w[0].received_bytes <= w[1].received_bytes));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn ignored_range_does_not_duplicate_bytes() {
        let data = payload(3000);
        let served = data.clone();
        let server = TestServer::start(move |_| TestResponse::ok(served.clone()));
        let dir = temp_dir("ucd-transfer");
        let save_path = dir.join("game.zip");
        std::fs::write(&save_path, &data[..500]).unwrap();

        let (_tx, mut rx) = watch::channel(DownloadControl::Running);
        let outcome = worker(fast_config())
            .transfer(&request(&server, "/game.zip", save_path.clone()), &mut rx, &mut |_| {})
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed { received: 3000, total: 3000 });
        assert_eq!(std::fs::read(&save_path).unwrap(), data);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn not_found_is_dead_link_without_retry() {
        let server = TestServer::start(|_| TestResponse::not_found());
        let dir = temp_dir("ucd-transfer");

        let (_tx, mut rx) = watch::channel(DownloadControl::Running);
        let err = worker(fast_config())
            .transfer(&request(&server, "/gone.zip", dir.join("gone.zip")), &mut rx, &mut |_| {})
            .await
            .unwrap_err();

        assert!(err.is_dead_link());
        assert_eq!(server.hits("/gone.zip"), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn transient_failures_retry_and_resume() {
        let data = payload(2048);
        let served = data.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let server = TestServer::start(move |request| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => TestResponse::new(503, "busy"),
                1 => TestResponse::ranged(request, &served).truncated(700),
                _ => TestResponse::ranged(request, &served),
            }
        });
        let dir = temp_dir("ucd-transfer");
        let save_path = dir.join("game.zip");

        let (_tx, mut rx) = watch::channel(DownloadControl::Running);
        let outcome = worker(fast_config())
            .transfer(&request(&server, "/game.zip", save_path.clone()), &mut rx, &mut |_| {})
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed { received: 2048, total: 2048 });
        assert_eq!(std::fs::read(&save_path).unwrap(), data);
        let requests = server.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].header("range"), Some("bytes=700-"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let server = TestServer::start(|_| TestResponse::new(500, "down"));
        let dir = temp_dir("ucd-transfer");
        let config = PipelineConfig {
            transfer_max_attempts: 3,
            ..fast_config()
        };

        let (_tx, mut rx) = watch::channel(DownloadControl::Running);
        let err = worker(config)
            .transfer(&request(&server, "/game.zip", dir.join("game.zip")), &mut rx, &mut |_| {})
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(server.hits("/game.zip"), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn pause_keeps_partial_and_cancel_discards_it() {
        let data = payload(64 * 1024);
        let served = data.clone();
        let server = TestServer::start(move |request| {
            TestResponse::ranged(request, &served).throttled(1024, Duration::from_millis(20))
        });
        let dir = temp_dir("ucd-transfer");
        let save_path = dir.join("game.zip");
        let transfer = worker(fast_config());
        let req = request(&server, "/game.zip", save_path.clone());

        let (tx, mut rx) = watch::channel(DownloadControl::Running);
        let pause_tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = pause_tx.send(DownloadControl::Paused);
        });
        let outcome = transfer.transfer(&req, &mut rx, &mut |_| {}).await.unwrap();
        let TransferOutcome::Paused { received, .. } = outcome else {
            panic!("expected pause, got {outcome:?}");
        };
        assert!(received > 0 && received < data.len() as u64);
        assert_eq!(file_len(&save_path).await, received);

        tx.send(DownloadControl::Running).unwrap();
        let cancel_tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = cancel_tx.send(DownloadControl::Cancelled);
        });
        let outcome = transfer.transfer(&req, &mut rx, &mut |_| {}).await.unwrap();
        assert!(matches!(outcome, TransferOutcome::Cancelled { .. }));
        assert!(!save_path.exists());
        assert_eq!(
            server.requests()[1].header("range").map(str::to_string),
            Some(format!("bytes={}-", received))
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("bytes 100-199/200"), Some(200));
        assert_eq!(parse_content_range_total("bytes */50"), Some(50));
        assert_eq!(parse_content_range_total("bytes 0-1/*"), None);
    }
}
