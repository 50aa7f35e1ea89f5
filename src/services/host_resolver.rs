use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{StatusCode, Url};
use serde_json::Value;

use crate::config::PipelineConfig;
use crate::errors::{LauncherError, Result};
use crate::models::PartStatus;
use crate::services::api_client::{ApiClient, RootzFile};

pub const ROOTZ: &str = "rootz";
pub const PIXELDRAIN: &str = "pixeldrain";
const ROOTZ_SIGNED_HOST: &str = "signed-url.cloudflare.com";

static ROOTZ_DOWNLOAD_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/files/download/([0-9a-fA-F-]{36})").expect("valid regex"));
static UUID_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9a-fA-F-]{36})").expect("valid regex"));
static ROOTZ_SHORT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/d/([^/?#]+)").expect("valid regex"));
static PIXELDRAIN_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/u/([^/?#]+)").expect("valid regex"));
static DISPOSITION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"filename\*?=(?:UTF-8'')?"?([^";]+)"?"#).expect("valid regex"));

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedLink {
    pub url: String,
    pub filename: Option<String>,
    pub size: Option<u64>,
    pub resolved: bool,
}

impl ResolvedLink {
    fn direct(url: &str) -> Self {
        Self {
            url: url.to_string(),
            filename: infer_filename_from_url(url),
            size: None,
            resolved: true,
        }
    }

    fn unresolved(url: &str) -> Self {
        Self {
            url: url.to_string(),
            filename: None,
            size: None,
            resolved: false,
        }
    }

    fn from_rootz(file: RootzFile) -> Option<Self> {
        let url = file.url?;
        Some(Self {
            url,
            filename: file.file_name,
            size: file.size,
            resolved: true,
        })
    }
}

/// Maps a catalog host key (including aliases) to the host this resolver knows.
pub fn canonical_host(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "rootz" | "rootz.so" | "www.rootz.so" => Some(ROOTZ),
        "pixeldrain" | "pixeldrain.com" | "www.pixeldrain.com" => Some(PIXELDRAIN),
        _ => None,
    }
}

/// Key used for per-host limits and start spacing.
pub fn host_key(host: &str) -> String {
    canonical_host(host)
        .map(str::to_string)
        .unwrap_or_else(|| host.trim().to_ascii_lowercase())
}

/// Infers the host from a transfer URL, used for backend redirects.
pub fn host_for_url(url: &str) -> Option<&'static str> {
    let parsed = Url::parse(url).ok()?;
    let hostname = parsed.host_str()?.to_ascii_lowercase();
    if hostname.contains("pixeldrain.com") {
        Some(PIXELDRAIN)
    } else if hostname.contains("rootz.so") || hostname.contains(ROOTZ_SIGNED_HOST) {
        Some(ROOTZ)
    } else {
        None
    }
}

pub fn infer_filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.filter(|segment| !segment.is_empty()).last()?;
    let decoded = urlencoding::decode(last)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| last.to_string());
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn filename_from_disposition(value: &str) -> Option<String> {
    let captured = DISPOSITION_NAME.captures(value)?.get(1)?.as_str();
    let decoded = urlencoding::decode(captured)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| captured.to_string());
    let name = decoded.rsplit(['/', '\\']).next().unwrap_or("").trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn is_rootz_signed_url(url: &Url) -> bool {
    url.host_str()
        .map(|host| host.contains(ROOTZ_SIGNED_HOST))
        .unwrap_or(false)
}

fn is_rootz_url(url: &Url) -> bool {
    url.host_str()
        .map(|host| host.contains("rootz.so") || host.contains(ROOTZ_SIGNED_HOST))
        .unwrap_or(false)
}

pub fn extract_rootz_file_id(url: &Url) -> Option<String> {
    if let Some(found) = ROOTZ_DOWNLOAD_ID.captures(url.path()).and_then(|c| c.get(1)) {
        return Some(found.as_str().to_string());
    }
    if let Some(found) = UUID_LIKE.captures(url.path()).and_then(|c| c.get(1)) {
        return Some(found.as_str().to_string());
    }
    url.query_pairs()
        .find(|(key, _)| key == "fileId" || key == "id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| UUID_LIKE.is_match(value))
}

pub fn extract_rootz_short_id(url: &Url) -> Option<String> {
    if let Some(found) = ROOTZ_SHORT_ID.captures(url.path()).and_then(|c| c.get(1)) {
        return Some(found.as_str().to_string());
    }
    url.query_pairs()
        .find(|(key, _)| key == "shortId" || key == "shortid")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

pub fn extract_pixeldrain_file_id(url: &Url) -> Option<String> {
    if let Some(found) = PIXELDRAIN_ID.captures(url.path()).and_then(|c| c.get(1)) {
        return Some(found.as_str().to_string());
    }
    let segments: Vec<&str> = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.len() == 1 {
        return Some(segments[0].to_string());
    }
    None
}

/// Turns a mirror host + opaque link into a transfer URL.
///
/// Never retries. A host answering "not found" yields [`LauncherError::DeadLink`].
#[derive(Clone)]
pub struct HostResolver {
    client: reqwest::Client,
    api: ApiClient,
    pixeldrain_api: String,
    timeout: Duration,
}

impl HostResolver {
    pub fn new(config: &PipelineConfig, api: ApiClient) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.http_connect_timeout)
            .timeout(config.resolve_timeout)
            .build()
            .unwrap_or_else(|_| config.http_client());
        Self {
            client,
            api,
            pixeldrain_api: config.pixeldrain_api.trim_end_matches('/').to_string(),
            timeout: config.resolve_timeout,
        }
    }

    pub async fn resolve(&self, host: &str, link: &str) -> Result<ResolvedLink> {
        match tokio::time::timeout(self.timeout, self.resolve_inner(host, link)).await {
            Ok(result) => result,
            Err(_) => Err(LauncherError::TransientNetwork(format!(
                "resolving {} link timed out",
                host
            ))),
        }
    }

    async fn resolve_inner(&self, host: &str, link: &str) -> Result<ResolvedLink> {
        let link = link.trim();
        let Ok(parsed) = Url::parse(link) else {
            return Ok(ResolvedLink::unresolved(link));
        };
        match canonical_host(host) {
            Some(ROOTZ) => self.resolve_rootz(&parsed, link).await,
            Some(PIXELDRAIN) => self.resolve_pixeldrain(&parsed, link).await,
            _ if matches!(parsed.scheme(), "http" | "https") => Ok(ResolvedLink::direct(link)),
            _ => Ok(ResolvedLink::unresolved(link)),
        }
    }

    async fn resolve_rootz(&self, parsed: &Url, link: &str) -> Result<ResolvedLink> {
        if is_rootz_signed_url(parsed) || !is_rootz_url(parsed) {
            return Ok(ResolvedLink::direct(link));
        }

        if let Some(file_id) = extract_rootz_file_id(parsed) {
            if let Some(resolved) = self.rootz_by_file_id(&file_id).await? {
                return Ok(resolved);
            }
        }

        if let Some(short_id) = extract_rootz_short_id(parsed) {
            let path = format!("/files/short/{}", urlencoding::encode(&short_id));
            let meta = self.api.resolve_rootz(&path, Some(&short_id), None).await?;
            if let Some(meta) = meta {
                let meta_url_is_final = meta
                    .url
                    .as_deref()
                    .and_then(|url| Url::parse(url).ok())
                    .map(|url| is_rootz_signed_url(&url) || !is_rootz_url(&url))
                    .unwrap_or(false);
                if meta_url_is_final {
                    if let Some(resolved) = ResolvedLink::from_rootz(meta) {
                        return Ok(resolved);
                    }
                } else if let Some(id) = meta.id {
                    if let Some(resolved) = self.rootz_by_file_id(&id).await? {
                        return Ok(resolved);
                    }
                }
            }
        }

        Ok(ResolvedLink::unresolved(link))
    }

    async fn rootz_by_file_id(&self, file_id: &str) -> Result<Option<ResolvedLink>> {
        let path = format!("/files/download/{}", urlencoding::encode(file_id));
        let file = self.api.resolve_rootz(&path, None, Some(file_id)).await?;
        Ok(file.and_then(ResolvedLink::from_rootz))
    }

    fn pixeldrain_file_url(&self, file_id: &str) -> String {
        format!("{}/file/{}", self.pixeldrain_api, urlencoding::encode(file_id))
    }

    async fn resolve_pixeldrain(&self, parsed: &Url, link: &str) -> Result<ResolvedLink> {
        let Some(file_id) = extract_pixeldrain_file_id(parsed) else {
            return Ok(ResolvedLink::unresolved(link));
        };

        let info_url = format!("{}/info", self.pixeldrain_file_url(&file_id));
        let response = self
            .client
            .get(&info_url)
            .send()
            .await
            .map_err(|err| LauncherError::TransientNetwork(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(LauncherError::dead_link(
                PIXELDRAIN,
                format!("file {} returned HTTP {}", file_id, status.as_u16()),
            ));
        }
        if !status.is_success() {
            return Err(LauncherError::TransientNetwork(format!(
                "pixeldrain info returned HTTP {}",
                status.as_u16()
            )));
        }

        let info: Value = response.json().await.unwrap_or(Value::Null);
        Ok(ResolvedLink {
            url: self.pixeldrain_file_url(&file_id),
            filename: info
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            size: info.get("size").and_then(Value::as_u64),
            resolved: true,
        })
    }

    /// Lightweight liveness probe for one part. Never downloads the body.
    pub async fn probe(&self, host: &str, link: &str) -> PartStatus {
        let resolved = match self.resolve(host, link).await {
            Ok(resolved) => resolved,
            Err(err) if err.is_dead_link() => return PartStatus::Dead,
            Err(err) => {
                tracing::debug!("probe failed host={} link={}: {}", host, link, err);
                return PartStatus::Error;
            }
        };
        if !resolved.resolved {
            return PartStatus::Dead;
        }
        if resolved.size.is_some() {
            return PartStatus::Alive;
        }

        match self.client.head(&resolved.url).send().await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                    PartStatus::Dead
                } else if status.is_success()
                    || status.is_redirection()
                    || status == StatusCode::METHOD_NOT_ALLOWED
                {
                    PartStatus::Alive
                } else {
                    PartStatus::Error
                }
            }
            Err(err) => {
                tracing::debug!("probe HEAD failed host={} url={}: {}", host, resolved.url, err);
                PartStatus::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestResponse, TestServer};
    use serde_json::json;

    fn resolver_for(server: &TestServer) -> HostResolver {
        let config = PipelineConfig {
            api_base: server.base_url().to_string(),
            pixeldrain_api: server.url("/pd/api"),
            ..PipelineConfig::default()
        };
        HostResolver::new(&config, ApiClient::new(&config))
    }

    #[test]
    fn host_aliases_are_canonicalised() {
        assert_eq!(canonical_host("www.rootz.so"), Some(ROOTZ));
        assert_eq!(canonical_host("Pixeldrain.com"), Some(PIXELDRAIN));
        assert_eq!(canonical_host("fileq"), None);
        assert_eq!(host_for_url("https://signed-url.cloudflare.com/a.zip"), Some(ROOTZ));
        assert_eq!(host_for_url("https://pixeldrain.com/u/abc"), Some(PIXELDRAIN));
    }

    #[test]
    fn ids_are_extracted_from_links() {
        let uuid = "0f8fad5b-d9cb-469f-a165-70867728950e";
        let url = Url::parse(&format!("https://rootz.so/files/download/{uuid}")).unwrap();
        assert_eq!(extract_rootz_file_id(&url).as_deref(), Some(uuid));

        let short = Url::parse("https://rootz.so/d/Ab12").unwrap();
        assert_eq!(extract_rootz_file_id(&short), None);
        assert_eq!(extract_rootz_short_id(&short).as_deref(), Some("Ab12"));

        let pd = Url::parse("https://pixeldrain.com/u/xYz9").unwrap();
        assert_eq!(extract_pixeldrain_file_id(&pd).as_deref(), Some("xYz9"));
        let root = Url::parse("https://pixeldrain.com/xYz9").unwrap();
        assert_eq!(extract_pixeldrain_file_id(&root).as_deref(), Some("xYz9"));
    }

    #[test]
    fn filenames_are_inferred() {
        assert_eq!(
            infer_filename_from_url("https://cdn.example/files/My%20Game.part1.rar?x=1").as_deref(),
            Some("My Game.part1.rar")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=\"game.zip\"").as_deref(),
            Some("game.zip")
        );
    }

    #[tokio::test]
    async fn direct_links_need_no_lookup() {
        let server = TestServer::start(|_| TestResponse::not_found());
        let resolver = resolver_for(&server);

        let signed = resolver
            .resolve("rootz", "https://signed-url.cloudflare.com/abc/game.zip")
            .await
            .unwrap();
        assert!(signed.resolved);
        assert_eq!(signed.filename.as_deref(), Some("game.zip"));

        let other = resolver
            .resolve("fileq", "https://cdn.example/game.zip")
            .await
            .unwrap();
        assert!(other.resolved);
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn pixeldrain_not_found_is_a_dead_link() {
        let server = TestServer::start(|request| match request.path() {
            "/pd/api/file/alive/info" => {
                TestResponse::json(200, json!({ "name": "part1.rar", "size": 2048 }))
            }
            _ => TestResponse::not_found(),
        });
        let resolver = resolver_for(&server);

        let alive = resolver
            .resolve("pixeldrain", "https://pixeldrain.com/u/alive")
            .await
            .unwrap();
        assert_eq!(alive.url, server.url("/pd/api/file/alive"));
        assert_eq!(alive.size, Some(2048));
        assert_eq!(alive.filename.as_deref(), Some("part1.rar"));

        let dead = resolver
            .resolve("pixeldrain", "https://pixeldrain.com/u/gone")
            .await
            .unwrap_err();
        assert!(dead.is_dead_link());
        assert_eq!(server.hits("/pd/api/file/gone/info"), 1);
    }

    #[tokio::test]
    async fn rootz_short_id_takes_one_extra_hop() {
        let server = TestServer::start(|request| {
            let body = request.json();
            if body["shortId"] == "Ab12" {
                return TestResponse::json(
                    200,
                    json!({ "success": true, "data": { "id": "0f8fad5b-d9cb-469f-a165-70867728950e" } }),
                );
            }
            if body["fileId"] == "0f8fad5b-d9cb-469f-a165-70867728950e" {
                return TestResponse::json(
                    200,
                    json!({ "success": true, "data": { "url": "https://signed-url.cloudflare.com/x/game.zip", "fileName": "game.zip", "size": 10 } }),
                );
            }
            TestResponse::json(200, json!({ "success": false }))
        });
        let resolver = resolver_for(&server);

        let resolved = resolver.resolve("rootz", "https://rootz.so/d/Ab12").await.unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.url, "https://signed-url.cloudflare.com/x/game.zip");
        assert_eq!(resolved.size, Some(10));
        assert_eq!(server.hits("/api/rootz/resolve"), 2);
    }

    #[tokio::test]
    async fn probe_distinguishes_dead_from_error() {
        let server = TestServer::start(|request| match request.path() {
            "/pd/api/file/alive/info" => TestResponse::json(200, json!({ "size": 1 })),
            "/pd/api/file/broken/info" => TestResponse::new(500, "oops"),
            "/files/direct.zip" => TestResponse::ok(b"abc".to_vec()),
            _ => TestResponse::not_found(),
        });
        let resolver = resolver_for(&server);

        assert_eq!(
            resolver.probe("pixeldrain", "https://pixeldrain.com/u/alive").await,
            PartStatus::Alive
        );
        assert_eq!(
            resolver.probe("pixeldrain", "https://pixeldrain.com/u/missing").await,
            PartStatus::Dead
        );
        assert_eq!(
            resolver.probe("pixeldrain", "https://pixeldrain.com/u/broken").await,
            PartStatus::Error
        );
        assert_eq!(
            resolver.probe("mirror", &server.url("/files/direct.zip")).await,
            PartStatus::Alive
        );
        assert_eq!(
            resolver.probe("mirror", &server.url("/files/gone.zip")).await,
            PartStatus::Dead
        );
    }

    #[tokio::test]
    async fn rootz_backend_outage_is_an_error_not_a_dead_link() {
        let server = TestServer::start(|_| TestResponse::new(503, "maintenance"));
        let resolver = resolver_for(&server);

        assert_eq!(
            resolver.probe("rootz", "https://rootz.so/d/Ab12").await,
            PartStatus::Error
        );
        let err = resolver
            .resolve("rootz", "https://rootz.so/d/Ab12")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!err.is_dead_link());
    }

    #[tokio::test]
    async fn rootz_refusals_are_dead_only_when_the_file_is_gone() {
        let server = TestServer::start(|request| match request.json()["shortId"].as_str() {
            Some("gone") => TestResponse::json(
                200,
                json!({ "success": false, "error": "File not found" }),
            ),
            Some("busy") => TestResponse::json(
                200,
                json!({ "success": false, "error": "Rate limited, slow down" }),
            ),
            _ => TestResponse::new(200, "<html>bad gateway</html>")
                .header("Content-Type", "text/html"),
        });
        let resolver = resolver_for(&server);

        assert_eq!(
            resolver.probe("rootz", "https://rootz.so/d/gone").await,
            PartStatus::Dead
        );
        assert_eq!(
            resolver.probe("rootz", "https://rootz.so/d/busy").await,
            PartStatus::Error
        );
        assert_eq!(
            resolver.probe("rootz", "https://rootz.so/d/html").await,
            PartStatus::Error
        );
    }
}
