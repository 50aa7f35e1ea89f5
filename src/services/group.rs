use crate::models::{DownloadGroup, DownloadItem, DownloadStatus, GroupPhase};

/// Phase of one game's download, computed from its items alone.
pub fn derive_phase(items: &[&DownloadItem]) -> GroupPhase {
    let any = |status: DownloadStatus| items.iter().any(|item| item.status == status);
    let all = |check: &dyn Fn(DownloadStatus) -> bool| items.iter().all(|item| check(item.status));

    if items.is_empty() {
        return GroupPhase::Queued;
    }
    if any(DownloadStatus::Installing) {
        return GroupPhase::Installing;
    }
    if any(DownloadStatus::Extracting) {
        return GroupPhase::Extracting;
    }
    if any(DownloadStatus::Paused) {
        return GroupPhase::Paused;
    }
    if any(DownloadStatus::Downloading) {
        return GroupPhase::Downloading;
    }
    if any(DownloadStatus::Queued) {
        return if all(&|status| status == DownloadStatus::Queued) {
            GroupPhase::Queued
        } else {
            GroupPhase::Downloading
        };
    }
    if all(&|status| status == DownloadStatus::Installed) {
        return GroupPhase::Completed;
    }
    if all(&|status| matches!(status, DownloadStatus::Completed | DownloadStatus::Installed)) {
        return GroupPhase::Extracting;
    }
    if any(DownloadStatus::ExtractFailed) {
        return GroupPhase::ExtractFailed;
    }
    if any(DownloadStatus::Failed) {
        return GroupPhase::Failed;
    }
    GroupPhase::Cancelled
}

/// Group total inferred from the parts whose size is known.
pub fn inferred_total(items: &[&DownloadItem]) -> u64 {
    let received: u64 = items.iter().map(|item| item.received_bytes).sum();
    let known: Vec<u64> = items
        .iter()
        .map(|item| item.total_bytes)
        .filter(|total| *total > 0)
        .collect();
    let known_sum: u64 = known.iter().sum();
    let part_total = items
        .iter()
        .filter_map(|item| item.part_total)
        .map(|value| value as usize)
        .max()
        .unwrap_or(0)
        .max(items.len());

    let inferred = if known.is_empty() {
        0
    } else if known.len() >= part_total {
        known_sum
    } else {
        let average = known_sum / known.len() as u64;
        known_sum + average * (part_total - known.len()) as u64
    };
    inferred.max(known_sum).max(received)
}

pub fn summarize(items: &[&DownloadItem]) -> Option<DownloadGroup> {
    let first = items.first()?;
    let received_bytes: u64 = items.iter().map(|item| item.received_bytes).sum();
    let total_bytes = inferred_total(items);
    let speed_bps: f64 = items
        .iter()
        .filter(|item| item.status == DownloadStatus::Downloading)
        .map(|item| item.speed_bps)
        .sum();
    let eta_seconds = if speed_bps > 0.0 && total_bytes > received_bytes {
        Some(((total_bytes - received_bytes) as f64 / speed_bps).ceil() as u64)
    } else {
        None
    };
    let part_total = items
        .iter()
        .filter_map(|item| item.part_total)
        .max()
        .unwrap_or(0)
        .max(items.len() as u32);
    let completed_parts = items
        .iter()
        .filter(|item| {
            matches!(
                item.status,
                DownloadStatus::Completed
                    | DownloadStatus::Extracting
                    | DownloadStatus::Installing
                    | DownloadStatus::Installed
            )
        })
        .count() as u32;
    let failed_parts = items
        .iter()
        .filter(|item| item.status == DownloadStatus::Failed)
        .count() as u32;

    Some(DownloadGroup {
        appid: first.appid.clone(),
        game_name: first.game_name.clone(),
        phase: derive_phase(items),
        received_bytes,
        total_bytes,
        speed_bps,
        eta_seconds,
        part_total,
        completed_parts,
        failed_parts,
        item_ids: items.iter().map(|item| item.id.clone()).collect(),
    })
}

/// Groups items by appid in order of first appearance.
pub fn group_items(items: &[DownloadItem]) -> Vec<DownloadGroup> {
    let mut order: Vec<&str> = Vec::new();
    for item in items {
        if !order.contains(&item.appid.as_str()) {
            order.push(&item.appid);
        }
    }
    order
        .into_iter()
        .filter_map(|appid| {
            let members: Vec<&DownloadItem> =
                items.iter().filter(|item| item.appid == appid).collect();
            summarize(&members)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn item(id: &str, status: DownloadStatus, received: u64, total: u64) -> DownloadItem {
        DownloadItem {
            id: id.to_string(),
            appid: "730".to_string(),
            game_name: "Sample".to_string(),
            host: "pixeldrain".to_string(),
            url: String::new(),
            original_url: None,
            filename: format!("{id}.rar"),
            status,
            received_bytes: received,
            total_bytes: total,
            speed_bps: 0.0,
            eta_seconds: None,
            part_index: None,
            part_total: Some(2),
            save_path: None,
            version_label: None,
            fallbacks: Vec::new(),
            started_at: 0,
            completed_at: None,
            error: None,
        }
    }

    fn phase(items: &[DownloadItem]) -> GroupPhase {
        let refs: Vec<&DownloadItem> = items.iter().collect();
        derive_phase(&refs)
    }

    #[test]
    fn completed_parts_mean_extracting_until_installed() {
        let done = vec![
            item("a", DownloadStatus::Completed, 100 * MB, 100 * MB),
            item("b", DownloadStatus::Completed, 100 * MB, 100 * MB),
        ];
        assert_eq!(phase(&done), GroupPhase::Extracting);

        let installed = vec![
            item("a", DownloadStatus::Installed, 100 * MB, 100 * MB),
            item("b", DownloadStatus::Installed, 100 * MB, 100 * MB),
        ];
        assert_eq!(phase(&installed), GroupPhase::Completed);
    }

    #[test]
    fn phase_priority_follows_the_install_pipeline() {
        use DownloadStatus::*;
        let cases = [
            (vec![Installing, Extracting, Downloading], GroupPhase::Installing),
            (vec![Extracting, Completed], GroupPhase::Extracting),
            (vec![Paused, Downloading], GroupPhase::Paused),
            (vec![Downloading, Queued], GroupPhase::Downloading),
            (vec![Queued, Queued], GroupPhase::Queued),
            (vec![Completed, Queued], GroupPhase::Downloading),
            (vec![Completed, ExtractFailed], GroupPhase::ExtractFailed),
            (vec![Completed, Failed], GroupPhase::Failed),
            (vec![Cancelled, Completed], GroupPhase::Cancelled),
        ];
        for (statuses, expected) in cases {
            let items: Vec<DownloadItem> = statuses
                .iter()
                .enumerate()
                .map(|(index, status)| item(&index.to_string(), *status, 0, 0))
                .collect();
            assert_eq!(phase(&items), expected, "statuses {statuses:?}");
        }
    }

    #[test]
    fn inferred_total_never_trails_received() {
        let items = vec![
            item("a", DownloadStatus::Downloading, 40, 100),
            item("b", DownloadStatus::Queued, 0, 0),
        ];
        let refs: Vec<&DownloadItem> = items.iter().collect();
        assert_eq!(inferred_total(&refs), 200);

        let overshoot = vec![item("a", DownloadStatus::Downloading, 500, 0)];
        let refs: Vec<&DownloadItem> = overshoot.iter().collect();
        assert_eq!(inferred_total(&refs), 500);
    }

    #[test]
    fn groups_keep_first_seen_order_and_counts() {
        let mut other = item("c", DownloadStatus::Failed, 0, 0);
        other.appid = "440".to_string();
        let items = vec![
            item("a", DownloadStatus::Completed, 10, 10),
            other,
            item("b", DownloadStatus::Failed, 0, 10),
        ];
        let groups = group_items(&items);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].appid, "730");
        assert_eq!(groups[0].completed_parts, 1);
        assert_eq!(groups[0].failed_parts, 1);
        assert_eq!(groups[0].phase, GroupPhase::Failed);
        assert_eq!(groups[1].appid, "440");
    }
}
