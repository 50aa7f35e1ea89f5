use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Semaphore;
use uuid::Uuid;
use zip::ZipArchive;

use crate::config::PipelineConfig;
use crate::errors::{LauncherError, Result};
use crate::utils::FileManager;

static SPLIT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<base>.+)\.(?P<index>\d{3})$").expect("valid regex"));
static RAR_VOLUME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<base>.+)\.part(?P<index>\d+)\.rar$").expect("valid regex")
});

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const RAR_MAGIC: [u8; 6] = [0x52, 0x61, 0x72, 0x21, 0x1a, 0x07];
const SEVEN_ZIP_MAGIC: [u8; 6] = [0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
    SevenZip,
    Rar,
    /// Not an archive; copied into the install folder as is.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    pub name: String,
    pub pieces: Vec<PathBuf>,
    /// `name.partN.rar` volumes. unrar walks them itself starting from the first.
    pub multi_volume: bool,
}

impl ArchiveSource {
    fn is_split(&self) -> bool {
        !self.multi_volume && self.pieces.len() > 1
    }
}

/// One finished group handed to the install step.
#[derive(Debug, Clone)]
pub struct ExtractJob {
    pub appid: String,
    pub folder: String,
    pub parts: Vec<PathBuf>,
}

/// Unpacks completed parts on a bounded blocking pool, one extraction per appid.
#[derive(Clone)]
pub struct Extractor {
    config: Arc<PipelineConfig>,
    files: FileManager,
    active: Arc<Mutex<HashSet<String>>>,
    permits: Arc<Semaphore>,
}

struct ActiveExtraction {
    appid: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for ActiveExtraction {
    fn drop(&mut self) {
        lock_set(&self.active).remove(&self.appid);
    }
}

fn lock_set(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Extractor {
    pub fn new(config: Arc<PipelineConfig>, files: FileManager) -> Self {
        let workers = config.extract_workers.max(1);
        Self {
            config,
            files,
            active: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn is_active(&self, appid: &str) -> bool {
        lock_set(&self.active).contains(appid)
    }

    fn claim(&self, appid: &str) -> Result<ActiveExtraction> {
        let mut active = lock_set(&self.active);
        if !active.insert(appid.to_string()) {
            return Err(LauncherError::ExtractionInProgress(appid.to_string()));
        }
        Ok(ActiveExtraction {
            appid: appid.to_string(),
            active: self.active.clone(),
        })
    }

    /// Extracts `job.parts` into `installed/<folder>` and returns that directory.
    /// Parts stay on disk when anything fails so the user can retry.
    pub async fn extract(&self, job: ExtractJob) -> Result<PathBuf> {
        let _claim = self.claim(&job.appid)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LauncherError::Extraction("extraction pool closed".to_string()))?;

        let target = self.files.installed_dir(&job.folder);
        let staging = self
            .files
            .installed_root()
            .join(format!(".staging-{}-{}", job.folder, Uuid::new_v4()));
        tracing::info!(
            "extract start appid={} parts={} target={}",
            job.appid,
            job.parts.len(),
            target.display()
        );

        let parts = job.parts.clone();
        let staging_dir = staging.clone();
        let target_dir = target.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            extract_all(&parts, &staging_dir)?;
            promote_staging(&staging_dir, &target_dir)
        })
        .await
        .map_err(|err| LauncherError::Extraction(format!("extract task failed: {err}")))?;

        if let Err(err) = outcome {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            tracing::error!("extract failed appid={} err={}", job.appid, err);
            return Err(match err {
                LauncherError::Extraction(_) => err,
                other => LauncherError::Extraction(other.to_string()),
            });
        }

        if !self.config.keep_archives_after_install {
            for part in &job.parts {
                let _ = tokio::fs::remove_file(part).await;
            }
            if let Some(parent) = job.parts.first().and_then(|part| part.parent()) {
                // Only succeeds when the folder is empty.
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
        tracing::info!("extract done appid={} target={}", job.appid, target.display());
        Ok(target)
    }
}

/// Groups `name.ext.001`, `name.ext.002`, ... into one source to be joined, and
/// `name.part1.rar`, `name.part2.rar`, ... into one multi-volume source. Other
/// files stand alone.
pub fn plan_sources(parts: &[PathBuf]) -> Vec<ArchiveSource> {
    let mut split: BTreeMap<String, Vec<(u32, PathBuf)>> = BTreeMap::new();
    let mut volumes: BTreeMap<String, Vec<(u32, PathBuf)>> = BTreeMap::new();
    let mut sources = Vec::new();
    for part in parts {
        let name = part
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(captures) = SPLIT_SUFFIX.captures(&name) {
            let index = captures["index"].parse::<u32>().unwrap_or(0);
            split
                .entry(captures["base"].to_string())
                .or_default()
                .push((index, part.clone()));
            continue;
        }
        if let Some(captures) = RAR_VOLUME.captures(&name) {
            let index = captures["index"].parse::<u32>().unwrap_or(0);
            volumes
                .entry(captures["base"].to_ascii_lowercase())
                .or_default()
                .push((index, part.clone()));
            continue;
        }
        sources.push(ArchiveSource {
            name,
            pieces: vec![part.clone()],
            multi_volume: false,
        });
    }
    for (name, pieces) in split {
        sources.push(ArchiveSource {
            name,
            pieces: ordered(pieces),
            multi_volume: false,
        });
    }
    for (_, pieces) in volumes {
        let pieces = ordered(pieces);
        let name = pieces
            .first()
            .and_then(|path| path.file_name())
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_default();
        sources.push(ArchiveSource {
            name,
            pieces,
            multi_volume: true,
        });
    }
    sources
}

fn ordered(mut pieces: Vec<(u32, PathBuf)>) -> Vec<PathBuf> {
    pieces.sort_by_key(|(index, _)| *index);
    pieces.into_iter().map(|(_, path)| path).collect()
}

pub fn detect_kind(name: &str, head: &[u8]) -> Result<ArchiveKind> {
    let lower = name.to_ascii_lowercase();
    if head.starts_with(&RAR_MAGIC) || lower.ends_with(".rar") {
        return Ok(ArchiveKind::Rar);
    }
    if head.starts_with(&SEVEN_ZIP_MAGIC) || lower.ends_with(".7z") {
        return Ok(ArchiveKind::SevenZip);
    }
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        return Ok(ArchiveKind::TarGz);
    }
    if lower.ends_with(".tar") {
        return Ok(ArchiveKind::Tar);
    }
    if head.starts_with(&ZIP_MAGIC) {
        return Ok(ArchiveKind::Zip);
    }
    if lower.ends_with(".zip") {
        return Err(LauncherError::Extraction(format!(
            "{name} is not a valid zip archive"
        )));
    }
    if head.starts_with(&GZIP_MAGIC) {
        return Ok(ArchiveKind::TarGz);
    }
    Ok(ArchiveKind::Plain)
}

fn read_head(path: &Path) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SEVEN_ZIP_MAGIC.len());
    File::open(path)?
        .take(SEVEN_ZIP_MAGIC.len() as u64)
        .read_to_end(&mut head)?;
    Ok(head)
}

fn extract_all(parts: &[PathBuf], staging: &Path) -> Result<()> {
    if parts.is_empty() {
        return Err(LauncherError::Extraction("no parts to extract".to_string()));
    }
    for part in parts {
        if !part.is_file() {
            return Err(LauncherError::Extraction(format!(
                "missing part {}",
                part.display()
            )));
        }
    }
    fs::create_dir_all(staging)?;
    for source in plan_sources(parts) {
        if source.multi_volume {
            if let Some(first) = source.pieces.first() {
                extract_one(&source.name, first, staging)?;
            }
        } else if source.is_split() {
            let joined = staging.with_extension("joined");
            join_pieces(&source.pieces, &joined)?;
            let result = extract_one(&source.name, &joined, staging);
            let _ = fs::remove_file(&joined);
            result?;
        } else if let Some(path) = source.pieces.first() {
            extract_one(&source.name, path, staging)?;
        }
    }
    Ok(())
}

fn join_pieces(pieces: &[PathBuf], joined: &Path) -> Result<()> {
    let mut out = File::create(joined)?;
    for piece in pieces {
        let mut input = File::open(piece)?;
        io::copy(&mut input, &mut out)?;
    }
    out.sync_all()?;
    Ok(())
}

fn extract_one(name: &str, path: &Path, staging: &Path) -> Result<()> {
    let head = read_head(path)?;
    match detect_kind(name, &head)? {
        ArchiveKind::Zip => extract_zip_archive(path, staging),
        ArchiveKind::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
            unpack_tar(&mut archive, staging)
        }
        ArchiveKind::Tar => {
            let mut archive = tar::Archive::new(File::open(path)?);
            unpack_tar(&mut archive, staging)
        }
        ArchiveKind::SevenZip => extract_seven_zip(path, staging),
        ArchiveKind::Rar => extract_rar(path, staging),
        ArchiveKind::Plain => {
            fs::copy(path, staging.join(name))?;
            Ok(())
        }
    }
}

fn is_safe_relative_path(path: &Path) -> bool {
    path.components().all(|component| {
        !matches!(
            component,
            Component::Prefix(_) | Component::RootDir | Component::ParentDir
        )
    })
}

fn extract_zip_archive(archive_path: &Path, install_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }
        let entry_path = Path::new(&name);
        if !is_safe_relative_path(entry_path) {
            tracing::warn!("skip unsafe zip entry {}", name);
            continue;
        }
        let out_path = install_dir.join(entry_path);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
    }
    Ok(())
}

fn extract_seven_zip(archive_path: &Path, install_dir: &Path) -> Result<()> {
    sevenz_rust2::decompress_file_with_extract_fn(archive_path, install_dir, |entry, reader, dest| {
        let name = entry.name().replace('\\', "/");
        if !is_safe_relative_path(Path::new(&name)) {
            tracing::warn!("skip unsafe 7z entry {}", name);
            return Ok(true);
        }
        sevenz_rust2::default_entry_extract_fn(entry, reader, dest)
    })
    .map_err(|err| {
        LauncherError::Extraction(format!("7z {}: {err}", archive_path.display()))
    })
}

/// Extracts a RAR archive. For multi-volume sets `archive_path` is the first
/// volume; the remaining ones are picked up from the same folder.
fn extract_rar(archive_path: &Path, install_dir: &Path) -> Result<()> {
    let rar_error = |err: unrar::error::UnrarError| {
        LauncherError::Extraction(format!("rar {}: {err}", archive_path.display()))
    };
    let mut archive = unrar::Archive::new(archive_path)
        .open_for_processing()
        .map_err(rar_error)?;
    while let Some(header) = archive.read_header().map_err(rar_error)? {
        let entry_path = header.entry().filename.clone();
        archive = if !header.entry().is_file() {
            header.skip().map_err(rar_error)?
        } else if !is_safe_relative_path(&entry_path) {
            tracing::warn!("skip unsafe rar entry {}", entry_path.display());
            header.skip().map_err(rar_error)?
        } else {
            header.extract_with_base(install_dir).map_err(rar_error)?
        };
    }
    Ok(())
}

fn unpack_tar<R: Read>(archive: &mut tar::Archive<R>, install_dir: &Path) -> Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        if !is_safe_relative_path(&entry_path) {
            tracing::warn!("skip unsafe tar entry {}", entry_path.display());
            continue;
        }
        entry.unpack_in(install_dir)?;
    }
    Ok(())
}

/// Moves the staged tree into `target`. A staging tree holding one folder and
/// nothing else is flattened so installs do not nest `Game/Game/`.
fn promote_staging(staging: &Path, target: &Path) -> Result<PathBuf> {
    let root = single_child_dir(staging)?.unwrap_or_else(|| staging.to_path_buf());
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if !target.exists() {
        fs::rename(&root, target)?;
    } else {
        merge_into(&root, target)?;
    }
    if staging.exists() {
        fs::remove_dir_all(staging)?;
    }
    Ok(target.to_path_buf())
}

fn single_child_dir(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    if entries.len() != 1 {
        return Ok(None);
    }
    let entry = entries.remove(0);
    Ok(entry.file_type()?.is_dir().then(|| entry.path()))
}

fn merge_into(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            merge_into(&entry.path(), &dest)?;
        } else {
            if dest.exists() {
                fs::remove_file(&dest)?;
            }
            fs::rename(entry.path(), &dest)?;
        }
    }
    Ok(())
}
