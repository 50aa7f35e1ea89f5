use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://union-crax.xyz";
pub const DEFAULT_PIXELDRAIN_API: &str = "https://pixeldrain.com/api";

/// Tunables for the download pipeline, resolved once at startup.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub api_base: String,
    pub pixeldrain_api: String,
    pub max_concurrent_downloads: usize,
    pub max_downloads_per_host: usize,
    pub host_cooldowns: HashMap<String, Duration>,
    pub default_host_cooldown: Duration,
    pub transfer_max_attempts: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub resolve_timeout: Duration,
    pub http_timeout: Option<Duration>,
    pub http_connect_timeout: Duration,
    pub max_bytes_per_second: u64,
    pub extract_workers: usize,
    pub keep_partial_on_cancel: bool,
    pub keep_archives_after_install: bool,
    pub progress_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            pixeldrain_api: DEFAULT_PIXELDRAIN_API.to_string(),
            max_concurrent_downloads: 3,
            max_downloads_per_host: 1,
            host_cooldowns: default_host_cooldowns(),
            default_host_cooldown: Duration::ZERO,
            transfer_max_attempts: 5,
            retry_base: Duration::from_millis(1000),
            retry_max: Duration::from_millis(30_000),
            resolve_timeout: Duration::from_secs(12),
            http_timeout: None,
            http_connect_timeout: Duration::from_secs(15),
            max_bytes_per_second: 0,
            extract_workers: 1,
            keep_partial_on_cancel: false,
            keep_archives_after_install: false,
            progress_interval: Duration::from_millis(500),
        }
    }
}

fn default_host_cooldowns() -> HashMap<String, Duration> {
    let mut map = HashMap::new();
    map.insert("rootz".to_string(), Duration::from_millis(1000));
    map.insert("pixeldrain".to_string(), Duration::from_millis(500));
    map
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut host_cooldowns = defaults.host_cooldowns.clone();
        let mut default_host_cooldown = defaults.default_host_cooldown;
        if let Some(ms) = env_usize("LAUNCHER_HOST_COOLDOWN_MS") {
            let cooldown = Duration::from_millis(ms.clamp(0, 60_000) as u64);
            for value in host_cooldowns.values_mut() {
                *value = cooldown;
            }
            default_host_cooldown = cooldown;
        }

        let retry_base_ms = env_usize("LAUNCHER_TRANSFER_RETRY_BASE_MS")
            .unwrap_or(1000)
            .clamp(0, 60_000) as u64;
        let retry_max_ms = env_usize("LAUNCHER_TRANSFER_RETRY_MAX_MS")
            .unwrap_or(30_000)
            .clamp(retry_base_ms as usize, 300_000) as u64;

        Self {
            api_base: env_string("LAUNCHER_API_BASE").unwrap_or(defaults.api_base),
            pixeldrain_api: env_string("LAUNCHER_PIXELDRAIN_API")
                .unwrap_or(defaults.pixeldrain_api),
            max_concurrent_downloads: env_usize("LAUNCHER_MAX_CONCURRENT_DOWNLOADS")
                .unwrap_or(defaults.max_concurrent_downloads)
                .clamp(1, 16),
            max_downloads_per_host: env_usize("LAUNCHER_MAX_DOWNLOADS_PER_HOST")
                .unwrap_or(defaults.max_downloads_per_host)
                .clamp(1, 8),
            host_cooldowns,
            default_host_cooldown,
            transfer_max_attempts: env_usize("LAUNCHER_TRANSFER_MAX_ATTEMPTS")
                .unwrap_or(defaults.transfer_max_attempts)
                .clamp(1, 10),
            retry_base: Duration::from_millis(retry_base_ms),
            retry_max: Duration::from_millis(retry_max_ms),
            resolve_timeout: Duration::from_secs(
                env_usize("LAUNCHER_RESOLVE_TIMEOUT_SECONDS")
                    .unwrap_or(12)
                    .clamp(2, 120) as u64,
            ),
            http_timeout: env_usize("LAUNCHER_HTTP_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(|value| Duration::from_secs(value.clamp(5, 3600) as u64)),
            http_connect_timeout: Duration::from_secs(
                env_usize("LAUNCHER_HTTP_CONNECT_TIMEOUT_SECONDS")
                    .unwrap_or(15)
                    .clamp(1, 120) as u64,
            ),
            max_bytes_per_second: env_usize("LAUNCHER_MAX_BPS").unwrap_or(0) as u64,
            extract_workers: env_usize("LAUNCHER_EXTRACT_WORKERS")
                .unwrap_or(defaults.extract_workers)
                .clamp(1, 4),
            keep_partial_on_cancel: env_truthy("LAUNCHER_KEEP_PARTIAL_ON_CANCEL"),
            keep_archives_after_install: env_truthy("LAUNCHER_KEEP_ARCHIVES_AFTER_INSTALL"),
            progress_interval: Duration::from_millis(
                env_usize("LAUNCHER_PROGRESS_INTERVAL_MS")
                    .unwrap_or(500)
                    .clamp(50, 10_000) as u64,
            ),
        }
    }

    pub fn cooldown_for(&self, host: &str) -> Duration {
        self.host_cooldowns
            .get(host)
            .copied()
            .unwrap_or(self.default_host_cooldown)
    }

    /// Exponential backoff for the given 1-based attempt, capped at `retry_max`.
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let delay = self.retry_base.saturating_mul(1u32 << exponent);
        delay.min(self.retry_max)
    }

    pub fn http_client(&self) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("UnionCrax.Direct/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.http_connect_timeout);
        if let Some(timeout) = self.http_timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().unwrap_or_else(|err| {
            tracing::warn!("http client builder failed, using defaults: {}", err);
            reqwest::Client::new()
        })
    }
}

pub fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

pub fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let config = PipelineConfig {
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_millis(500),
            ..PipelineConfig::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(400));
        assert_eq!(config.retry_delay(4), Duration::from_millis(500));
        assert_eq!(config.retry_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn cooldown_table_has_known_hosts() {
        let config = PipelineConfig::default();
        assert_eq!(config.cooldown_for("rootz"), Duration::from_millis(1000));
        assert_eq!(config.cooldown_for("pixeldrain"), Duration::from_millis(500));
        assert_eq!(config.cooldown_for("direct"), Duration::ZERO);
    }
}
