use std::collections::BTreeMap;

use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::errors::{LauncherError, Result};
use crate::models::{AvailabilityResult, GameVersion};

const CLIENT_HEADER: &str = "X-UC-Client";
const CLIENT_ID: &str = "unioncrax-direct";

/// What the catalog returns when asked for a game's links.
#[derive(Clone, Debug, PartialEq)]
pub enum LinksResult {
    Hosts(BTreeMap<String, Vec<String>>),
    /// The backend resolved the file itself and answered with a redirect.
    Redirect(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RootzFile {
    pub url: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
    pub id: Option<String>,
}

/// Client for the catalog backend.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    no_redirect: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &PipelineConfig) -> Self {
        let client = config.http_client();
        let no_redirect = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.http_connect_timeout)
            .timeout(config.resolve_timeout * 2)
            .build()
            .unwrap_or_else(|_| client.clone());
        Self {
            client,
            no_redirect,
            base_url: config.api_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn request_download_token(&self, appid: &str) -> Result<String> {
        let path = format!("/api/downloads/{}", urlencoding::encode(appid));
        let response = self
            .client
            .post(self.url(&path))
            .header(CLIENT_HEADER, CLIENT_ID)
            .json(&json!({}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| format!("Failed to start download: {}", status.as_u16()));
            return Err(LauncherError::Http(message));
        }

        let body: Value = response.json().await?;
        let success = body.get("success").and_then(Value::as_bool).unwrap_or(false);
        match body.get("downloadToken").and_then(Value::as_str) {
            Some(token) if success && !token.is_empty() => Ok(token.to_string()),
            _ => Err(LauncherError::Http(
                "Download token missing from response".to_string(),
            )),
        }
    }

    pub async fn fetch_links(
        &self,
        appid: &str,
        token: &str,
        version_id: Option<&str>,
    ) -> Result<LinksResult> {
        let mut path = format!(
            "/api/downloads/{}?fetchLinks=true&downloadToken={}",
            urlencoding::encode(appid),
            urlencoding::encode(token)
        );
        if let Some(version_id) = version_id.filter(|value| !value.is_empty()) {
            path.push_str(&format!("&versionId={}", urlencoding::encode(version_id)));
        }

        let response = self
            .no_redirect
            .get(self.url(&path))
            .header(CLIENT_HEADER, CLIENT_ID)
            .send()
            .await?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("application/json"))
            .unwrap_or(false);

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| LauncherError::Http("redirect without location".to_string()))?;
            return Ok(LinksResult::Redirect(location));
        }

        if !status.is_success() {
            let message = if is_json {
                response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
            } else {
                None
            };
            return Err(LauncherError::Http(
                message.unwrap_or_else(|| format!("HTTP {}: fetching links", status.as_u16())),
            ));
        }

        if !is_json {
            return Err(LauncherError::Http(
                "unexpected links response from catalog".to_string(),
            ));
        }
        let body: Value = response.json().await?;
        Ok(LinksResult::Hosts(sanitize_hosts(body.get("hosts"))))
    }

    pub async fn fetch_versions(&self, appid: &str, token: &str) -> Result<Vec<GameVersion>> {
        let path = format!(
            "/api/downloads/versions/{}?downloadToken={}",
            urlencoding::encode(appid),
            urlencoding::encode(token)
        );
        let body: Value = self.get(&path).await?;
        let raw = match body {
            Value::Array(_) => body,
            Value::Object(mut map) => map.remove("versions").unwrap_or(Value::Array(Vec::new())),
            _ => Value::Array(Vec::new()),
        };
        let mut versions: Vec<GameVersion> = serde_json::from_value(raw)?;
        let mut seen_current = false;
        for version in versions.iter_mut() {
            if version.is_current {
                if seen_current {
                    version.is_current = false;
                }
                seen_current = true;
            }
        }
        Ok(versions)
    }

    /// Server side availability report.
    pub async fn check_availability(
        &self,
        appid: &str,
        token: &str,
        version_id: Option<&str>,
    ) -> Result<AvailabilityResult> {
        self.post(
            "/api/downloads/check-availability",
            json!({
                "appid": appid,
                "downloadToken": token,
                "versionId": version_id,
            }),
        )
        .await
    }

    /// Asks the backend to turn a rootz path into a signed URL.
    ///
    /// A missing file is a dead link. Any other failure is transient so a flaky
    /// resolver never marks a part dead. `Ok(None)` means the backend answered
    /// but sent no file data.
    pub async fn resolve_rootz(
        &self,
        path: &str,
        short_id: Option<&str>,
        file_id: Option<&str>,
    ) -> Result<Option<RootzFile>> {
        let response = self
            .client
            .post(self.url("/api/rootz/resolve"))
            .json(&json!({
                "path": path,
                "shortId": short_id,
                "fileId": file_id,
            }))
            .send()
            .await
            .map_err(|err| LauncherError::TransientNetwork(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(LauncherError::dead_link("rootz", format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(LauncherError::TransientNetwork(format!(
                "rootz resolver returned HTTP {}",
                status.as_u16()
            )));
        }
        let body: Value = response.json().await.map_err(|err| {
            LauncherError::TransientNetwork(format!("rootz resolver sent an unreadable body: {err}"))
        })?;
        if !body.get("success").and_then(Value::as_bool).unwrap_or(false) {
            let message = body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("rootz resolver declined the request")
                .to_string();
            if reports_missing_file(&message) {
                return Err(LauncherError::dead_link("rootz", message));
            }
            return Err(LauncherError::TransientNetwork(message));
        }
        Ok(body.get("data").map(normalize_rootz_payload))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, Option::<()>::None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: B) -> Result<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn request<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<B>,
    ) -> Result<T> {
        let mut request = self
            .client
            .request(method, self.url(path))
            .header(CLIENT_HEADER, CLIENT_ID);
        if let Some(payload) = body.as_ref() {
            request = request.json(payload);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LauncherError::Http(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        let value = response.json::<T>().await?;
        Ok(value)
    }
}

fn sanitize_hosts(raw: Option<&Value>) -> BTreeMap<String, Vec<String>> {
    let mut hosts = BTreeMap::new();
    let Some(Value::Object(map)) = raw else {
        return hosts;
    };
    for (name, links) in map {
        if name.to_ascii_lowercase().contains("vikingfile") {
            continue;
        }
        let links = links
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|link| !link.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        hosts.insert(name.clone(), links);
    }
    hosts
}

fn reports_missing_file(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["not found", "deleted", "expired", "removed", "does not exist", "no such file"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn normalize_rootz_payload(value: &Value) -> RootzFile {
    let payload = value
        .get("data")
        .filter(|inner| inner.is_object())
        .or_else(|| value.get("file").filter(|inner| inner.is_object()))
        .unwrap_or(value);

    let first_string = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| payload.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    };
    let size = payload.get("size").and_then(|raw| match raw {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    });

    RootzFile {
        url: first_string(&["url", "downloadUrl", "signedUrl"]),
        file_name: first_string(&["fileName", "filename", "name"]),
        size,
        id: first_string(&["id", "fileId"]),
    }
}
