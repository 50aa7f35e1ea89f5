use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::join_all;

use crate::config::PipelineConfig;
use crate::errors::Result;
use crate::models::{
    AlternativeInfo, AvailabilityResult, HostAvailability, PartAvailability, PartSource,
    PartStatus,
};
use crate::services::api_client::{ApiClient, LinksResult};
use crate::services::host_resolver::{
    canonical_host, host_for_url, host_key, HostResolver, PIXELDRAIN, ROOTZ,
};
use crate::services::rate_limit::HostCooldown;

/// Host name used for a backend redirect whose URL matches no known mirror.
pub const DIRECT_HOST: &str = "direct";

/// Default host for a group plus the parts that must come from elsewhere.
#[derive(Clone, Debug, PartialEq)]
pub struct HostPlan {
    pub host: String,
    pub part_overrides: BTreeMap<u32, PartSource>,
}

/// Probes every part on every host. Nothing is cached between calls.
///
/// Probes take slots from the same [`HostCooldown`] the transfer worker uses,
/// so a check never bursts a host that is also serving downloads.
#[derive(Clone)]
pub struct AvailabilityChecker {
    api: ApiClient,
    resolver: HostResolver,
    config: Arc<PipelineConfig>,
    cooldown: HostCooldown,
}

impl AvailabilityChecker {
    pub fn new(
        config: Arc<PipelineConfig>,
        api: ApiClient,
        resolver: HostResolver,
        cooldown: HostCooldown,
    ) -> Self {
        Self {
            api,
            resolver,
            config,
            cooldown,
        }
    }

    /// Requests its own download token, then runs [`Self::check_with_token`].
    pub async fn check(&self, appid: &str, version_id: Option<&str>) -> Result<AvailabilityResult> {
        let token = self.api.request_download_token(appid).await?;
        self.check_with_token(appid, &token, version_id).await
    }

    pub async fn check_with_token(
        &self,
        appid: &str,
        token: &str,
        version_id: Option<&str>,
    ) -> Result<AvailabilityResult> {
        let hosts = match self.api.fetch_links(appid, token, version_id).await? {
            LinksResult::Hosts(hosts) => hosts,
            LinksResult::Redirect(url) => {
                let host = host_for_url(&url).unwrap_or(DIRECT_HOST).to_string();
                BTreeMap::from([(host, vec![url])])
            }
        };
        let probes = hosts
            .iter()
            .map(|(host, links)| self.probe_host(host, links));
        let reports: BTreeMap<String, HostAvailability> = hosts
            .keys()
            .cloned()
            .zip(join_all(probes).await)
            .collect();
        let result = aggregate(reports);
        tracing::info!(
            "availability appid={} available={} hosts={} fully_dead={:?}",
            appid,
            result.game_available,
            result.hosts.len(),
            result.fully_dead_parts
        );
        Ok(result)
    }

    /// Server-side check, normalised so the derived fields always agree with the parts.
    pub async fn check_remote(
        &self,
        appid: &str,
        token: &str,
        version_id: Option<&str>,
    ) -> Result<AvailabilityResult> {
        let remote = self.api.check_availability(appid, token, version_id).await?;
        let hosts = remote
            .hosts
            .into_iter()
            .map(|(host, report)| (host, host_report(report.parts)))
            .collect();
        Ok(aggregate(hosts))
    }

    /// Parts on one host are probed in order, spaced by that host's cooldown.
    async fn probe_host(&self, host: &str, links: &[String]) -> HostAvailability {
        let canonical = canonical_host(host).unwrap_or(host);
        let key = host_key(host);
        let cooldown = self.config.cooldown_for(&key);
        let mut parts = Vec::with_capacity(links.len());
        for (index, link) in links.iter().enumerate() {
            self.cooldown.wait(&key, cooldown).await;
            let status = self.resolver.probe(canonical, link).await;
            parts.push(PartAvailability {
                part: index as u32 + 1,
                status,
            });
        }
        host_report(parts)
    }
}

pub fn host_report(parts: Vec<PartAvailability>) -> HostAvailability {
    let total_parts = parts.len() as u32;
    let alive_parts = parts
        .iter()
        .filter(|part| part.status == PartStatus::Alive)
        .count() as u32;
    HostAvailability {
        parts,
        total_parts,
        alive_parts,
        all_alive: total_parts > 0 && alive_parts == total_parts,
    }
}

/// Builds the game level verdict from per-host reports.
///
/// The game is unavailable only when no host has a single alive part. A part is
/// fully dead only when every host listing it reports it dead.
pub fn aggregate(hosts: BTreeMap<String, HostAvailability>) -> AvailabilityResult {
    let game_available = hosts.values().any(|report| report.alive_parts > 0);

    let part_numbers: BTreeSet<u32> = hosts
        .values()
        .flat_map(|report| report.parts.iter().map(|part| part.part))
        .collect();

    let mut alternatives = BTreeMap::new();
    let mut fully_dead_parts = Vec::new();
    for part in part_numbers {
        let mut info = AlternativeInfo::default();
        let mut listed = 0;
        let mut dead = 0;
        let mut unhealthy = false;
        for (host, report) in &hosts {
            let Some(entry) = report.parts.iter().find(|entry| entry.part == part) else {
                continue;
            };
            listed += 1;
            match entry.status {
                PartStatus::Alive => info.alive_on.push(host.clone()),
                PartStatus::Dead => {
                    dead += 1;
                    unhealthy = true;
                    info.dead_on.push(host.clone());
                }
                PartStatus::Error => unhealthy = true,
            }
        }
        if listed > 0 && dead == listed {
            fully_dead_parts.push(part);
        }
        if unhealthy {
            alternatives.insert(part.to_string(), info);
        }
    }

    AvailabilityResult {
        game_available,
        hosts,
        alternatives,
        fully_dead_parts,
    }
}

fn host_rank(host: &str) -> (u8, &str) {
    match canonical_host(host) {
        Some(ROOTZ) => (0, host),
        Some(PIXELDRAIN) => (1, host),
        _ => (2, host),
    }
}

/// Picks the host a download should start from.
///
/// Order: the preferred host when fully alive, any fully alive host, the
/// preferred host when it has something alive, then the host with the most
/// alive parts. Parts dead on the chosen host are mapped to a host where they live.
pub fn pick_default_host(result: &AvailabilityResult, preferred: Option<&str>) -> Option<HostPlan> {
    let preferred_key = preferred.and_then(|name| {
        let canonical = canonical_host(name).unwrap_or(name);
        result
            .hosts
            .keys()
            .find(|host| canonical_host(host).unwrap_or(host.as_str()) == canonical)
            .cloned()
    });
    let mut ordered: Vec<&String> = result.hosts.keys().collect();
    ordered.sort_by(|a, b| host_rank(a).cmp(&host_rank(b)));

    let report = |host: &str| result.hosts.get(host);
    let chosen = preferred_key
        .clone()
        .filter(|host| report(host).map_or(false, |r| r.all_alive))
        .or_else(|| {
            ordered
                .iter()
                .find(|host| report(host).map_or(false, |r| r.all_alive))
                .map(|host| host.to_string())
        })
        .or_else(|| {
            preferred_key
                .clone()
                .filter(|host| report(host).map_or(false, |r| r.alive_parts > 0))
        })
        .or_else(|| {
            ordered
                .iter()
                .filter(|host| report(host).map_or(false, |r| r.alive_parts > 0))
                .max_by(|a, b| {
                    let alive = |host: &str| report(host).map_or(0, |r| r.alive_parts);
                    alive(a)
                        .cmp(&alive(b))
                        .then_with(|| host_rank(b).cmp(&host_rank(a)))
                })
                .map(|host| host.to_string())
        })?;

    let mut part_overrides = BTreeMap::new();
    if let Some(chosen_report) = report(&chosen) {
        for entry in &chosen_report.parts {
            if entry.status == PartStatus::Alive {
                continue;
            }
            let substitute = ordered.iter().find(|host| {
                host.as_str() != chosen
                    && report(host).map_or(false, |r| {
                        r.parts
                            .iter()
                            .any(|p| p.part == entry.part && p.status == PartStatus::Alive)
                    })
            });
            if let Some(host) = substitute {
                part_overrides.insert(
                    entry.part,
                    PartSource {
                        host: host.to_string(),
                        url: None,
                    },
                );
            }
        }
    }
    Some(HostPlan {
        host: chosen,
        part_overrides,
    })
}
