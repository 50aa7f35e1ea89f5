use std::collections::HashSet;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{LauncherError, Result};
use crate::models::ExecutableCandidate;

const MAX_SCAN_DEPTH: u32 = 8;
const CONFIDENT_SCORE: i32 = 6;

static JUNK_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:vc_?redist|dxsetup|dxwebsetup|dotnet|unins\d{3}|uninstall|crashreport|bugreport|senddump|ue4prereqsetup|ue4-preq|directx|oalinst|physx)",
    )
    .expect("valid regex")
});
static JUNK_DIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[\\/](?:_?redist|__support|_commonredist|directx|vcredist)[\\/]")
        .expect("valid regex")
});

const HELPER_TOKENS: [&str; 10] = [
    "crash", "report", "dump", "helper", "uninstall", "setup", "install", "redist", "updater",
    "patch",
];

/// Outcome of the auto-pick. When `confident` is false the caller shows `ranked`.
#[derive(Debug, Clone)]
pub struct ExecutablePick {
    pub pick: Option<ExecutableCandidate>,
    pub confident: bool,
    pub ranked: Vec<ExecutableCandidate>,
}

pub fn is_helper_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    HELPER_TOKENS.iter().any(|token| lower.contains(token))
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn path_key(path: &str) -> String {
    path.to_lowercase().replace('/', "\\")
}

/// Drops redistributables, uninstallers and crash handlers.
pub fn filter_candidates(candidates: Vec<ExecutableCandidate>) -> Vec<ExecutableCandidate> {
    candidates
        .into_iter()
        .filter(|exe| {
            !JUNK_NAME.is_match(&exe.name.to_lowercase()) && !JUNK_DIR.is_match(&exe.path)
        })
        .collect()
}

pub fn score_executable(exe: &ExecutableCandidate, game_name: &str) -> i32 {
    let name = exe.name.to_lowercase();
    let path = exe.path.to_lowercase();
    let game_token = normalize_name(game_name);
    let tokens: Vec<String> = game_name
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() >= 3)
        .map(str::to_string)
        .collect();

    let mut score = 0;
    if !game_token.is_empty() && (name.contains(&game_token) || path.contains(&game_token)) {
        score += 6;
    }
    if tokens
        .iter()
        .any(|token| name.contains(token.as_str()) || path.contains(token.as_str()))
    {
        score += 3;
    }
    if name.contains("game") || name.contains("play") {
        score += 2;
    }
    if name.contains("launcher") || name.contains("start") {
        score -= 1;
    }
    if ["setup", "install", "uninstall", "redist"]
        .iter()
        .any(|token| name.contains(token))
    {
        score -= 6;
    }
    if ["crash", "report", "dump", "helper"]
        .iter()
        .any(|token| name.contains(token))
    {
        score -= 6;
    }
    if name.contains("editor") {
        score -= 4;
    }

    score += 4 - exe.depth.min(4) as i32;

    const MIB: u64 = 1024 * 1024;
    if exe.size >= 50 * MIB {
        score += 2;
    } else if exe.size >= 10 * MIB {
        score += 1;
    }

    if is_helper_name(&exe.name) {
        score -= 2;
    }
    score
}

/// Scores every candidate, best first; ties go to the shallower file, then by name.
pub fn rank_executables(
    candidates: &[ExecutableCandidate],
    game_name: &str,
) -> Vec<ExecutableCandidate> {
    let mut ranked: Vec<ExecutableCandidate> = candidates
        .iter()
        .cloned()
        .map(|mut exe| {
            exe.score = score_executable(&exe, game_name);
            exe
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.depth.cmp(&b.depth))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    ranked
}

pub fn pick_executable(candidates: &[ExecutableCandidate], game_name: &str) -> ExecutablePick {
    let mut seen = HashSet::new();
    let unique: Vec<ExecutableCandidate> = candidates
        .iter()
        .filter(|exe| seen.insert(path_key(&exe.path)))
        .cloned()
        .collect();

    let filtered = filter_candidates(unique);
    let ranked = rank_executables(&filtered, game_name);
    match ranked.len() {
        0 => ExecutablePick {
            pick: None,
            confident: false,
            ranked,
        },
        1 => ExecutablePick {
            pick: ranked.first().cloned(),
            confident: true,
            ranked,
        },
        _ => {
            let top = ranked.first().cloned();
            let confident = top
                .as_ref()
                .map_or(false, |exe| exe.score >= CONFIDENT_SCORE);
            ExecutablePick {
                pick: top,
                confident,
                ranked,
            }
        }
    }
}

/// Lists every `.exe` below `root`. Depth 0 means the file sits in `root` itself.
pub fn discover_executables(root: &Path) -> Result<Vec<ExecutableCandidate>> {
    if !root.is_dir() {
        return Err(LauncherError::NotFound(format!(
            "install folder missing: {}",
            root.display()
        )));
    }
    let mut found = Vec::new();
    walk(root, 0, &mut found);
    found.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.path.cmp(&b.path)));
    Ok(found)
}

fn walk(dir: &Path, depth: u32, found: &mut Vec<ExecutableCandidate>) {
    if depth > MAX_SCAN_DEPTH {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!("skip unreadable dir {}: {}", dir.display(), err);
            return;
        }
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_dir() {
            walk(&path, depth + 1, found);
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.to_ascii_lowercase().ends_with(".exe") {
            continue;
        }
        let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        found.push(ExecutableCandidate {
            name,
            path: path.to_string_lossy().to_string(),
            size,
            depth,
            score: 0,
        });
    }
}

pub async fn discover_executables_async(root: &Path) -> Result<Vec<ExecutableCandidate>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || discover_executables(&root))
        .await
        .map_err(|err| LauncherError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    fn exe(name: &str, path: &str, depth: u32, size: u64) -> ExecutableCandidate {
        ExecutableCandidate {
            name: name.to_string(),
            path: path.to_string(),
            size,
            depth,
            score: 0,
        }
    }

    #[test]
    fn junk_is_filtered() {
        let list = vec![
            exe("vc_redist.x64.exe", "C:\\G\\vc_redist.x64.exe", 0, 1),
            exe("unins000.exe", "C:\\G\\unins000.exe", 0, 1),
            exe("setup.exe", "C:\\G\\_CommonRedist\\setup.exe", 1, 1),
            exe("Hollow.exe", "C:\\G\\Hollow.exe", 0, 1),
        ];
        let kept = filter_candidates(list);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Hollow.exe");
    }

    #[test]
    fn name_match_outranks_helpers() {
        let list = vec![
            exe("CrashHandler.exe", "C:\\G\\CrashHandler.exe", 0, 1),
            exe("HollowKnight.exe", "C:\\G\\HollowKnight.exe", 0, 60 * 1024 * 1024),
            exe("Launcher.exe", "C:\\G\\Launcher.exe", 0, 1),
        ];
        let result = pick_executable(&list, "Hollow Knight");
        let pick = result.pick.unwrap();
        assert_eq!(pick.name, "HollowKnight.exe");
        assert!(result.confident);
        assert_eq!(result.ranked.len(), 3);
    }

    #[test]
    fn single_candidate_is_confident_and_duplicates_collapse() {
        let list = vec![
            exe("a.exe", "C:/Games/X/a.exe", 2, 1),
            exe("a.exe", "c:\\games\\x\\A.EXE", 2, 1),
            exe("unins000.exe", "C:/Games/X/unins000.exe", 2, 1),
        ];
        let result = pick_executable(&list, "Unrelated");
        assert!(result.confident);
        assert_eq!(result.ranked.len(), 1);
    }

    #[test]
    fn low_scores_are_not_confident() {
        let list = vec![
            exe("alpha.exe", "C:\\G\\bin\\x\\y\\z\\alpha.exe", 5, 1),
            exe("beta.exe", "C:\\G\\bin\\x\\y\\z\\beta.exe", 5, 1),
        ];
        let result = pick_executable(&list, "Gamma");
        assert!(!result.confident);
        assert_eq!(result.pick.unwrap().name, "alpha.exe");
    }

    #[test]
    fn discovery_reports_depth_and_size() {
        let root = temp_dir("exe-scan");
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("Game.exe"), vec![0u8; 16]).unwrap();
        std::fs::write(root.join("bin").join("tool.EXE"), vec![0u8; 4]).unwrap();
        std::fs::write(root.join("readme.txt"), b"hi").unwrap();

        let found = discover_executables(&root).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "Game.exe");
        assert_eq!(found[0].depth, 0);
        assert_eq!(found[0].size, 16);
        assert_eq!(found[1].depth, 1);
        let _ = std::fs::remove_dir_all(root);
    }
}
