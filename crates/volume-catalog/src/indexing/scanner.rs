//! Recursive directory walker for volume cataloging.
//!
//! Walks depth-first with a hard depth ceiling and lists each directory in chunks, so
//! memory per directory stays bounded no matter how wide it is. Every item is stat-ed
//! individually: a vanished path is skipped with a warning, any other failure is recorded
//! (or ignored inside system-noise directories) and the walk moves on. One unreadable
//! subtree never aborts a scan.
//!
//! Entries are handed to an [`EntrySink`] one at a time, parents before their children.
//! Symlinks are skipped entirely. Files with more than one link are grouped by
//! `(device, inode)`: every path of the inode shares one hard-link group id, and only
//! the first path seen counts toward the byte total.
//!
//! `jwalk` provides an optional parallel pre-count so progress can report a total.

use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use jwalk::WalkDir;
use serde::{Deserialize, Serialize};

use crate::config::CatalogConfig;
use crate::ignore_poison::IgnorePoison;
use crate::indexing::cancel::{CancellationToken, Deadline};
use crate::indexing::paths;
use crate::indexing::store::{IndexStoreError, ScannedEntry};

// ── Types ────────────────────────────────────────────────────────────

/// Knobs for one walk.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Children read per chunk from one directory.
    pub batch_size: usize,
    /// Deepest level (relative to the root) whose children are still listed.
    pub max_depth: usize,
    /// Names or absolute prefixes whose errors are ignored.
    pub noise_dirs: Vec<String>,
    pub error_sample_limit: usize,
    pub deadline: Deadline,
}

impl ScanOptions {
    pub fn from_config(config: &CatalogConfig) -> Self {
        Self {
            batch_size: config.scan_batch_size.max(1),
            max_depth: config.max_depth,
            noise_dirs: config.noise_dirs.clone(),
            error_sample_limit: config.error_sample_limit,
            deadline: Deadline::after(config.scan_timeout()),
        }
    }
}

/// Live counters for an active scan. Updated by the scan thread, read by anyone.
#[derive(Debug, Default)]
pub struct ScanProgress {
    processed: AtomicU64,
    errors: AtomicU64,
    /// Expected entry count, 0 while unknown.
    total: AtomicU64,
    current_dir: Mutex<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub total: Option<u64>,
    pub current_dir: String,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read current progress snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        ProgressSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total: (total > 0).then_some(total),
            current_dir: self.current_dir.lock_ignore_poison().clone(),
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn set_current_dir(&self, dir: &str) {
        let mut current = self.current_dir.lock_ignore_poison();
        current.clear();
        current.push_str(dir);
    }
}

/// A per-item failure kept for the scan report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanIssue {
    pub path: String,
    pub message: String,
}

/// Summary returned when a walk finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub total_entries: u64,
    pub total_dirs: u64,
    /// Bytes under the root, each hard-link group counted once.
    pub total_bytes: u64,
    pub hard_link_groups: u64,
    /// Counted per-item errors (noise excluded).
    pub errors: u64,
    pub ignored_errors: u64,
    pub skipped_missing: u64,
    /// First `error_sample_limit` counted errors.
    pub error_samples: Vec<ScanIssue>,
    pub duration_ms: u64,
}

/// Receives entries in walk order.
pub trait EntrySink {
    fn accept(&mut self, entry: ScannedEntry) -> Result<(), ScanError>;
}

impl EntrySink for Vec<ScannedEntry> {
    fn accept(&mut self, entry: ScannedEntry) -> Result<(), ScanError> {
        self.push(entry);
        Ok(())
    }
}

// ── Errors ───────────────────────────────────────────────────────────

/// Errors that end a walk. Per-item failures never surface here.
#[derive(Debug)]
pub enum ScanError {
    /// The root itself could not be read.
    Io(std::io::Error),
    /// The sink failed to persist entries.
    Store(IndexStoreError),
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Io(e) => write!(f, "I/O error: {e}"),
            ScanError::Store(e) => write!(f, "Persisting scan results failed: {e}"),
            ScanError::Cancelled => write!(f, "Scan cancelled"),
            ScanError::TimedOut => write!(f, "Scan exceeded its time limit"),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Io(err)
    }
}

impl From<IndexStoreError> for ScanError {
    fn from(err: IndexStoreError) -> Self {
        ScanError::Store(err)
    }
}

// ── Public API ───────────────────────────────────────────────────────

/// Walk `root` and feed every entry to `sink`, root first.
///
/// Runs in the caller's thread. Returns `Cancelled` or `TimedOut` as soon as the token
/// or deadline trips; the item being processed at that moment is not emitted.
pub fn scan_tree(
    root: &Path,
    volume_id: &str,
    options: &ScanOptions,
    cancel: &CancellationToken,
    progress: &ScanProgress,
    sink: &mut dyn EntrySink,
) -> Result<ScanSummary, ScanError> {
    let start = Instant::now();
    let root_norm = paths::normalize_path(&root.to_string_lossy());

    let root_meta = fs::metadata(root)?;
    if !root_meta.is_dir() {
        return Err(ScanError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        )));
    }

    let mut walk = Walk {
        volume_id,
        root_norm: &root_norm,
        options,
        cancel,
        progress,
        sink,
        inodes: HashMap::new(),
        summary: ScanSummary::default(),
    };

    walk.check_stop()?;
    walk.emit(build_entry(volume_id, &root_norm, &root_norm, &root_meta, None))?;
    walk.summary.total_dirs += 1;
    let bytes = walk.walk_dir(root, &root_norm, 0)?;

    let mut summary = walk.summary;
    summary.total_bytes = bytes;
    summary.hard_link_groups = walk.inodes.values().filter(|g| g.paths.len() > 1).count() as u64;
    summary.duration_ms = start.elapsed().as_millis() as u64;

    log::info!(
        "Scanner: {} entries ({} dirs, {} bytes) under {root_norm} in {}ms, {} errors",
        summary.total_entries,
        summary.total_dirs,
        summary.total_bytes,
        summary.duration_ms,
        summary.errors
    );
    Ok(summary)
}

/// Fast parallel count of everything under `root` (root included), for progress totals.
///
/// Returns `None` if cancelled midway.
pub fn estimate_total(root: &Path, max_depth: usize, cancel: &CancellationToken) -> Option<u64> {
    let walker = WalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
        .sort(false)
        .max_depth(max_depth)
        .parallelism(jwalk::Parallelism::RayonNewPool(0));

    let mut count = 0u64;
    for entry in walker.into_iter().flatten() {
        if entry.file_type().is_symlink() {
            continue;
        }
        count += 1;
        if count % 4096 == 0 && cancel.is_cancelled() {
            return None;
        }
    }
    Some(count)
}

// ── Core walk ────────────────────────────────────────────────────────

struct HardLinkGroup {
    id: String,
    paths: Vec<String>,
}

struct Walk<'a> {
    volume_id: &'a str,
    root_norm: &'a str,
    options: &'a ScanOptions,
    cancel: &'a CancellationToken,
    progress: &'a ScanProgress,
    sink: &'a mut dyn EntrySink,
    inodes: HashMap<(u64, u64), HardLinkGroup>,
    summary: ScanSummary,
}

impl Walk<'_> {
    fn check_stop(&self) -> Result<(), ScanError> {
        if self.cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        if self.options.deadline.expired() {
            log::warn!("Scanner: time limit reached under {}", self.root_norm);
            return Err(ScanError::TimedOut);
        }
        Ok(())
    }

    fn emit(&mut self, entry: ScannedEntry) -> Result<(), ScanError> {
        self.sink.accept(entry)?;
        self.summary.total_entries += 1;
        self.progress.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// List `dir` chunk by chunk and descend. Returns the subtree's byte total.
    fn walk_dir(&mut self, dir: &Path, dir_norm: &str, depth: usize) -> Result<u64, ScanError> {
        if depth >= self.options.max_depth {
            log::debug!("Scanner: depth limit reached at {dir_norm}");
            return Ok(0);
        }
        self.progress.set_current_dir(dir_norm);

        let mut read_dir = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) => {
                self.record_error(dir_norm, &e);
                return Ok(0);
            }
        };

        let mut bytes = 0u64;
        let mut chunk = Vec::with_capacity(self.options.batch_size.min(1024));
        loop {
            chunk.clear();
            for item in read_dir.by_ref() {
                match item {
                    Ok(child) => chunk.push(child),
                    Err(e) => self.record_error(dir_norm, &e),
                }
                if chunk.len() >= self.options.batch_size {
                    break;
                }
            }
            if chunk.is_empty() {
                break;
            }
            for child in std::mem::take(&mut chunk) {
                self.check_stop()?;
                bytes += self.visit(&child.path(), dir_norm, depth + 1)?;
            }
        }
        Ok(bytes)
    }

    /// Stat, emit, and (for directories) descend into one child.
    fn visit(&mut self, path: &Path, parent_norm: &str, depth: usize) -> Result<u64, ScanError> {
        let path_norm = paths::normalize_path(&path.to_string_lossy());

        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Scanner: {path_norm} vanished before it could be read, skipping");
                self.summary.skipped_missing += 1;
                return Ok(0);
            }
            Err(e) => {
                self.record_error(&path_norm, &e);
                return Ok(0);
            }
        };

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            return Ok(0);
        }

        let mut entry = build_entry(self.volume_id, self.root_norm, &path_norm, &meta, Some(parent_norm));

        if file_type.is_dir() {
            self.emit(entry)?;
            self.summary.total_dirs += 1;
            return self.walk_dir(path, &path_norm, depth);
        }

        let counted = self.group_hard_link(&mut entry, &meta);
        let size = entry.size.unwrap_or(0);
        self.emit(entry)?;
        Ok(if counted { size } else { 0 })
    }

    /// Attach hard-link data. Returns whether this path counts toward size totals.
    fn group_hard_link(&mut self, entry: &mut ScannedEntry, meta: &Metadata) -> bool {
        let Some(key) = inode_key(meta) else {
            return true;
        };
        if entry.hard_link_count <= 1 {
            return true;
        }
        entry.is_hard_link = true;
        let mut first = false;
        let group = self.inodes.entry(key).or_insert_with(|| {
            first = true;
            HardLinkGroup {
                id: format!("hl-{:x}-{:x}", key.0, key.1),
                paths: Vec::new(),
            }
        });
        group.paths.push(entry.path.clone());
        entry.hard_link_group = Some(group.id.clone());
        first
    }

    fn record_error(&mut self, path: &str, err: &std::io::Error) {
        if is_noise(path, &self.options.noise_dirs) {
            log::debug!("Scanner: ignoring error in system directory {path}: {err}");
            self.summary.ignored_errors += 1;
            return;
        }
        self.summary.errors += 1;
        self.progress.errors.fetch_add(1, Ordering::Relaxed);
        if self.summary.error_samples.len() < self.options.error_sample_limit {
            log::warn!("Scanner: cannot read {path}: {err}");
            self.summary.error_samples.push(ScanIssue {
                path: path.to_string(),
                message: err.to_string(),
            });
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn build_entry(volume_id: &str, root_norm: &str, path_norm: &str, meta: &Metadata, parent: Option<&str>) -> ScannedEntry {
    let is_directory = meta.is_dir();
    let name = if parent.is_none() {
        root_name(root_norm)
    } else {
        path_norm.rsplit('/').next().unwrap_or(path_norm).to_string()
    };
    ScannedEntry {
        volume_id: volume_id.to_string(),
        kind: paths::kind_tag(&name, is_directory),
        name,
        path: path_norm.to_string(),
        parent_path: parent.map(str::to_string),
        is_directory,
        size: if is_directory { None } else { Some(meta.len()) },
        created_at: unix_secs(meta.created()),
        modified_at: unix_secs(meta.modified()),
        depth: paths::depth_from_root(path_norm, root_norm),
        inode: inode_key(meta).map(|(_, ino)| ino),
        hard_link_count: link_count(meta),
        is_hard_link: false,
        hard_link_group: None,
        volume_root: root_norm.to_string(),
    }
}

fn root_name(root_norm: &str) -> String {
    match root_norm.rsplit('/').find(|s| !s.is_empty()) {
        Some(name) => name.to_string(),
        None => root_norm.to_string(),
    }
}

fn unix_secs(time: std::io::Result<SystemTime>) -> Option<i64> {
    let time = time.ok()?;
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).ok(),
        Err(e) => i64::try_from(e.duration().as_secs()).ok().map(|s| -s),
    }
}

#[cfg(unix)]
fn inode_key(meta: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn inode_key(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}

#[cfg(unix)]
fn link_count(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn link_count(_meta: &Metadata) -> u64 {
    1
}

/// Whether `path` sits inside a system-noise directory.
///
/// Absolute entries (`/proc`) match as path prefixes, bare names match any component.
fn is_noise(path: &str, noise_dirs: &[String]) -> bool {
    noise_dirs.iter().any(|noise| {
        if noise.starts_with('/') {
            paths::is_same_or_child(path, noise)
        } else {
            path.split('/').any(|component| component == noise)
        }
    })
}

// ── Tests ────────────────────────────────────────────────────────────
