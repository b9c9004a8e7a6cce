//! Volume cataloging.
//!
//! Scans volumes into per-volume SQLite stores, answers listing and name-search queries,
//! and re-syncs volumes through a shadow store so a failed or interrupted sync never
//! costs the previously cataloged data.
//!
//! [`CatalogService`] is the host-facing entry point. Scans run on their own thread
//! ([`ScanJob`]); only one runs at a time.

pub mod aggregator;
pub mod backup;
pub mod cancel;
pub mod live;
pub mod paths;
pub mod progress;
pub mod scanner;
pub mod scheduler;
pub mod search;
pub mod sentinel;
pub mod space;
pub mod store;
pub mod streaming;
mod sync;
pub mod validation;
pub mod volumes;
pub mod writer;


use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{CONFIG_FILE_NAME, CatalogConfig, load_config};
use crate::ignore_poison::IgnorePoison;
use aggregator::DirSizeCache;
use backup::{BackupError, BackupService, DirectoryBackupStore};
use live::{LiveStore, StoreRegistry};
use progress::{LogListener, ProgressEvent, ProgressKind, ProgressListener};
use scanner::{ScanError, ScanProgress, ScanSummary};
use scheduler::{ScanConflict, ScanGrant, ScanPriority, ScanRejection, ScanScheduler, ScanState, ScanStatus};
use search::{IndexHealth, SearchHit};
use sentinel::{SentinelError, SentinelFile, SyncSentinel};
use store::{IndexStatus, IndexStore, IndexStoreError, IndexedEntry, remove_db_files};
use streaming::{PipelineRun, stream_scan};
use sync::SyncEnv;
use validation::{ValidationInput, ValidationWarning};
use volumes::{Volume, VolumeCatalog, VolumeSpace};

pub const CATALOG_FILE_NAME: &str = "catalog.db";
pub const VOLUMES_DIR_NAME: &str = "volumes";
pub const BACKUPS_DIR_NAME: &str = "backups";

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CatalogError {
    Store(IndexStoreError),
    Scan(ScanError),
    Backup(BackupError),
    Sentinel(SentinelError),
    Rejected(ScanRejection),
    VolumeNotFound(String),
    InvalidPath(String),
    /// An interrupted sync must be resolved before anything is scanned.
    RecoveryRequired(Box<SyncSentinel>),
    /// The sync failed but recovery put everything back.
    SyncFailed { cause: String, recovered: bool },
    /// The sync failed and so did recovery. Needs a manual restore.
    RecoveryFailed { cause: String, recovery_error: String },
    Io(std::io::Error),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Store(e) => write!(f, "{e}"),
            CatalogError::Scan(e) => write!(f, "{e}"),
            CatalogError::Backup(e) => write!(f, "{e}"),
            CatalogError::Sentinel(e) => write!(f, "{e}"),
            CatalogError::Rejected(r) => write!(f, "{r}"),
            CatalogError::VolumeNotFound(id) => write!(f, "Volume not found: {id}"),
            CatalogError::InvalidPath(path) => write!(f, "Not a readable directory: {path}"),
            CatalogError::RecoveryRequired(s) => write!(
                f,
                "An interrupted {} of {} ({}) must be resolved first",
                s.operation, s.volume_name, s.phase
            ),
            CatalogError::SyncFailed { cause, recovered } => {
                write!(f, "Sync failed: {cause} (data restored: {recovered})")
            }
            CatalogError::RecoveryFailed { cause, recovery_error } => {
                write!(f, "Sync failed: {cause}; recovery also failed: {recovery_error}")
            }
            CatalogError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<IndexStoreError> for CatalogError {
    fn from(err: IndexStoreError) -> Self {
        CatalogError::Store(err)
    }
}

impl From<ScanError> for CatalogError {
    fn from(err: ScanError) -> Self {
        CatalogError::Scan(err)
    }
}

impl From<BackupError> for CatalogError {
    fn from(err: BackupError) -> Self {
        CatalogError::Backup(err)
    }
}

impl From<SentinelError> for CatalogError {
    fn from(err: SentinelError) -> Self {
        CatalogError::Sentinel(err)
    }
}

impl From<ScanRejection> for CatalogError {
    fn from(err: ScanRejection) -> Self {
        CatalogError::Rejected(err)
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err)
    }
}

// ── Response types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanOutcome {
    Completed,
    Cancelled,
}

/// Result of a finished scan job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub volume_id: String,
    pub outcome: ScanOutcome,
    pub summary: ScanSummary,
    pub entries_written: u64,
    pub duplicates: u64,
    pub warnings: Vec<ValidationWarning>,
}

impl ScanReport {
    fn completed(volume_id: &str, run: &PipelineRun, warnings: Vec<ValidationWarning>) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            outcome: ScanOutcome::Completed,
            summary: run.summary.clone(),
            entries_written: run.outcome.written.inserted,
            duplicates: run.outcome.written.duplicates,
            warnings,
        }
    }

    fn cancelled(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            outcome: ScanOutcome::Cancelled,
            summary: ScanSummary::default(),
            entries_written: 0,
            duplicates: 0,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeIndexStatus {
    pub volume_id: String,
    #[serde(flatten)]
    pub meta: IndexStatus,
    pub entry_count: u64,
    pub db_file_size: u64,
}

/// What the operator wants done about a sync that was interrupted by a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryChoice {
    RestoreFromBackup,
    /// Delete the sentinel and keep the current state as is.
    ContinueAnyway,
    ShowDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum RecoveryResolution {
    NothingPending,
    Details { sentinel: SyncSentinel },
    Continued { sentinel: SyncSentinel },
    Restored { sentinel: SyncSentinel },
}

// ── ScanJob ──────────────────────────────────────────────────────────

/// A scan running on its own thread.
#[derive(Debug)]
pub struct ScanJob {
    volume_id: String,
    handle: thread::JoinHandle<Result<ScanReport, CatalogError>>,
}

impl ScanJob {
    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the scan to end.
    pub fn join(self) -> Result<ScanReport, CatalogError> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(CatalogError::Io(std::io::Error::other("scan thread panicked"))))
    }
}

// ── CatalogService ───────────────────────────────────────────────────

struct ServiceInner {
    config: CatalogConfig,
    catalog: VolumeCatalog,
    registry: StoreRegistry,
    scheduler: ScanScheduler,
    size_cache: Mutex<DirSizeCache>,
    backups: Arc<dyn BackupService>,
    listener: Arc<dyn ProgressListener>,
    sentinel: SentinelFile,
    /// Sentinel found at startup, until the operator resolves it.
    interrupted: Mutex<Option<SyncSentinel>>,
}

/// Central coordinator: the volume catalog, the live stores, the scan slot, and syncs.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct CatalogService {
    inner: Arc<ServiceInner>,
}

impl CatalogService {
    /// Open the catalog in `data_dir` with the config file found there, the directory
    /// backup store under `backups/`, and progress going to the log.
    pub fn open(data_dir: &Path) -> Result<Self, CatalogError> {
        fs::create_dir_all(data_dir)?;
        let config = load_config(&data_dir.join(CONFIG_FILE_NAME));
        let backups = DirectoryBackupStore::open(&data_dir.join(BACKUPS_DIR_NAME))?;
        Self::with_collaborators(data_dir, config, Arc::new(backups), Arc::new(LogListener))
    }

    /// Open with explicit collaborators.
    ///
    /// A sentinel left by a crashed sync blocks new scans until
    /// [`resolve_interrupted_sync`](Self::resolve_interrupted_sync) is called.
    pub fn with_collaborators(
        data_dir: &Path,
        config: CatalogConfig,
        backups: Arc<dyn BackupService>,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<Self, CatalogError> {
        let volumes_dir = data_dir.join(VOLUMES_DIR_NAME);
        fs::create_dir_all(&volumes_dir)?;

        let catalog = VolumeCatalog::open(&data_dir.join(CATALOG_FILE_NAME))?;
        let sentinel = SentinelFile::in_dir(data_dir);
        let scheduler = ScanScheduler::new(config.state_retention());

        let interrupted = sentinel.read()?;
        if let Some(found) = &interrupted {
            log::warn!(
                "Found an interrupted {} of volume {} ({}), started {}, stopped during {}",
                found.operation,
                found.volume_name,
                found.volume_id,
                found.started_at,
                found.phase
            );
            scheduler.set_recovery_required(Some(found.volume_id.clone()));
        }

        log::info!("Catalog opened at {}", data_dir.display());
        Ok(Self {
            inner: Arc::new(ServiceInner {
                registry: StoreRegistry::new(&volumes_dir, config.index_drift_tolerance),
                size_cache: Mutex::new(DirSizeCache::new(config.size_cache_capacity)),
                config,
                catalog,
                scheduler,
                backups,
                listener,
                sentinel,
                interrupted: Mutex::new(interrupted),
            }),
        })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.inner.config
    }

    // ── Interrupted syncs ────────────────────────────────────────────

    /// The sync a crash interrupted, if it hasn't been resolved yet.
    pub fn check_interrupted_sync(&self) -> Option<SyncSentinel> {
        self.inner.interrupted.lock_ignore_poison().clone()
    }

    pub fn resolve_interrupted_sync(&self, choice: RecoveryChoice) -> Result<RecoveryResolution, CatalogError> {
        let Some(sentinel) = self.check_interrupted_sync() else {
            return Ok(RecoveryResolution::NothingPending);
        };
        let inner = &self.inner;
        let resolution = match choice {
            RecoveryChoice::ShowDetails => return Ok(RecoveryResolution::Details { sentinel }),
            RecoveryChoice::ContinueAnyway => {
                log::warn!("Continuing without recovery after interrupted sync of {}", sentinel.volume_id);
                inner.discard_stray_shadow(&sentinel)?;
                inner.sentinel.delete()?;
                RecoveryResolution::Continued { sentinel }
            }
            RecoveryChoice::RestoreFromBackup => {
                sync::recover(&inner.sync_env(), &sentinel, true).map_err(|e| CatalogError::RecoveryFailed {
                    cause: format!("interrupted {} of {}", sentinel.operation, sentinel.volume_id),
                    recovery_error: e.to_string(),
                })?;
                inner.size_cache.lock_ignore_poison().invalidate_volume(&sentinel.volume_id);
                RecoveryResolution::Restored { sentinel }
            }
        };
        *inner.interrupted.lock_ignore_poison() = None;
        inner.scheduler.set_recovery_required(None);
        Ok(resolution)
    }

    // ── Scans ────────────────────────────────────────────────────────

    /// Catalog a new volume rooted at `path` and scan it straight into its live store.
    pub fn add_volume(&self, path: &Path) -> Result<ScanJob, CatalogError> {
        let root = readable_dir(path)?;
        let root_norm = paths::normalize_path(&root.to_string_lossy());
        let volume_id = uuid::Uuid::new_v4().simple().to_string();
        let grant = self.inner.acquire(&volume_id, &root_norm, ScanPriority::UserRequested)?;

        let space = space::space_for_path(&root);
        let volume = Volume {
            name: root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| root_norm.clone()),
            root_path: root_norm,
            total_capacity: space.as_ref().map(|s| s.total_capacity),
            used_space: space.as_ref().map(|s| s.used_space),
            free_space: space.as_ref().map(|s| s.free_space),
            format: space.and_then(|s| s.format),
            added_at: Utc::now(),
            last_synced_at: None,
            is_deleted: false,
            deleted_at: None,
            db_file: format!("vol-{volume_id}.db"),
            id: volume_id,
        };
        if let Err(e) = self.inner.catalog.upsert_volume(&volume) {
            self.inner.scheduler.finish(&volume.id, ScanStatus::Failed, &e.to_string());
            return Err(e.into());
        }
        log::info!("Added volume {} ({}) at {}", volume.name, volume.id, volume.root_path);

        self.spawn_job(grant, move |inner, grant| inner.scan_new_volume(&volume, &root, grant))
    }

    /// Re-scan a volume at its current root, as background work.
    pub fn start_scan(&self, volume_id: &str) -> Result<ScanJob, CatalogError> {
        self.spawn_sync(volume_id, None, ScanPriority::Background)
    }

    /// Re-scan a volume through a shadow store, optionally from a new root path.
    pub fn sync_volume(&self, volume_id: &str, new_path: Option<&Path>) -> Result<ScanJob, CatalogError> {
        self.spawn_sync(volume_id, new_path, ScanPriority::UserRequested)
    }

    fn spawn_sync(
        &self,
        volume_id: &str,
        new_path: Option<&Path>,
        priority: ScanPriority,
    ) -> Result<ScanJob, CatalogError> {
        let volume = self.inner.active_volume(volume_id)?;
        let root = readable_dir(new_path.unwrap_or_else(|| Path::new(&volume.root_path)))?;
        let root_norm = paths::normalize_path(&root.to_string_lossy());
        let grant = self.inner.acquire(volume_id, &root_norm, priority)?;

        self.spawn_job(grant, move |inner, grant| {
            let result = sync::run_sync(&inner.sync_env(), &volume, &root, grant);
            inner.size_cache.lock_ignore_poison().invalidate_volume(&volume.id);
            if let Err(CatalogError::RecoveryFailed { .. }) = &result {
                inner.hold_for_recovery();
            }
            if result.is_ok()
                && let Err(e) = inner.refresh_space(&volume.id)
            {
                log::debug!("Could not refresh space of {}: {e}", volume.id);
            }
            result
        })
    }

    /// Cancel the running scan. `false` if nothing cancelable is running.
    pub fn cancel_scan(&self) -> bool {
        self.inner.scheduler.cancel_scan()
    }

    pub fn scan_status(&self, volume_id: Option<&str>) -> Vec<ScanState> {
        self.inner.scheduler.scan_status(volume_id)
    }

    fn spawn_job(
        &self,
        grant: ScanGrant,
        work: impl FnOnce(&ServiceInner, &ScanGrant) -> Result<ScanReport, CatalogError> + Send + 'static,
    ) -> Result<ScanJob, CatalogError> {
        let inner = Arc::clone(&self.inner);
        let volume_id = grant.volume_id.clone();
        let spawned = thread::Builder::new().name("index-scanner".into()).spawn(move || {
            let id = grant.volume_id.clone();
            inner
                .listener
                .on_event(ProgressEvent::new(ProgressKind::Start, &id, "Scan started"));
            inner.scheduler.mark_running(&id, "Scanning");

            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let reporter = spawn_progress_reporter(&id, &grant.progress, &inner.listener, stop_rx);

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work(&inner, &grant)))
                .unwrap_or_else(|_| Err(CatalogError::Io(std::io::Error::other("scan worker panicked"))));

            drop(stop_tx);
            if let Some(reporter) = reporter {
                let _ = reporter.join();
            }

            let (status, message) = match &result {
                Ok(report) if report.outcome == ScanOutcome::Completed => (ScanStatus::Completed, "Scan complete".to_string()),
                Ok(_) => (ScanStatus::Cancelled, "Cancelled".to_string()),
                Err(e) => (ScanStatus::Failed, e.to_string()),
            };
            inner.scheduler.finish(&id, status, &message);

            let snap = grant.progress.snapshot();
            inner.listener.on_event(
                ProgressEvent::new(ProgressKind::Complete, &id, message).counts(snap.processed, snap.total, snap.errors),
            );
            result
        });

        match spawned {
            Ok(handle) => Ok(ScanJob { volume_id, handle }),
            Err(e) => {
                self.inner
                    .scheduler
                    .finish(&volume_id, ScanStatus::Failed, "Could not start scan thread");
                Err(e.into())
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Name search across every active volume, best matches first.
    pub fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, CatalogError> {
        let Some(fts_query) = search::build_fts_query(query) else {
            return Ok(Vec::new());
        };
        let mut per_volume = Vec::new();
        for volume in self.inner.catalog.list_volumes(true)? {
            let hits = self
                .inner
                .registry
                .get(&volume)
                .and_then(|live| live.with_store(|store| store.search_names(&fts_query, limit)));
            match hits {
                Ok(hits) => per_volume.push(
                    hits.into_iter()
                        .map(|(entry, rank)| SearchHit {
                            volume_id: volume.id.clone(),
                            volume_name: volume.name.clone(),
                            entry,
                            rank,
                        })
                        .collect(),
                ),
                Err(e) => log::warn!("Search skipped volume {}: {e}", volume.id),
            }
        }
        Ok(search::merge_ranked(per_volume, limit as usize))
    }

    /// A page of the children of `parent_path`, read from the live store.
    ///
    /// During a sync this is the pre-sync tree; the shadow store is never read.
    pub fn list_children(
        &self,
        volume_id: &str,
        parent_path: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<IndexedEntry>, CatalogError> {
        let parent = paths::normalize_path(parent_path);
        let live = self.inner.live_store(volume_id)?;
        Ok(live.with_store(|store| store.list_children(volume_id, &parent, limit, offset))?)
    }

    pub fn list_volumes(&self, active_only: bool) -> Result<Vec<Volume>, CatalogError> {
        Ok(self.inner.catalog.list_volumes(active_only)?)
    }

    pub fn get_volume(&self, volume_id: &str) -> Result<Volume, CatalogError> {
        self.inner.volume(volume_id)
    }

    pub fn index_status(&self, volume_id: &str) -> Result<VolumeIndexStatus, CatalogError> {
        let live = self.inner.live_store(volume_id)?;
        Ok(live.with_store(|store| {
            Ok(VolumeIndexStatus {
                volume_id: volume_id.to_string(),
                meta: store.get_index_status()?,
                entry_count: store.entry_count()?,
                db_file_size: store.db_file_size()?,
            })
        })?)
    }

    // ── Volume lifecycle ─────────────────────────────────────────────

    /// Soft delete: the volume leaves active listings and search, its store stays on disk.
    pub fn tombstone_volume(&self, volume_id: &str) -> Result<(), CatalogError> {
        let inner = &self.inner;
        inner.volume(volume_id)?;
        inner.ensure_idle(volume_id)?;
        inner.catalog.tombstone(volume_id, Utc::now())?;
        inner.registry.retire(volume_id);
        inner.size_cache.lock_ignore_poison().invalidate_volume(volume_id);
        log::info!("Tombstoned volume {volume_id}");
        Ok(())
    }

    /// Hard delete: the catalog row and the store file are gone.
    pub fn remove_volume(&self, volume_id: &str) -> Result<(), CatalogError> {
        let inner = &self.inner;
        let volume = inner.volume(volume_id)?;
        inner.ensure_idle(volume_id)?;
        inner.catalog.remove(volume_id)?;
        inner.registry.retire(volume_id);
        remove_db_files(&inner.registry.store_path(&volume.db_file))?;
        inner.size_cache.lock_ignore_poison().invalidate_volume(volume_id);
        log::info!("Removed volume {volume_id}");
        Ok(())
    }

    /// Re-read capacity figures from the disk holding the volume. `None` if it isn't mounted.
    pub fn refresh_volume_space(&self, volume_id: &str) -> Result<Option<VolumeSpace>, CatalogError> {
        self.inner.refresh_space(volume_id)
    }

    // ── Entries ──────────────────────────────────────────────────────

    /// Recursive size of a directory, computed on first request and cached.
    pub fn directory_size(&self, volume_id: &str, path: &str) -> Result<u64, CatalogError> {
        let path = paths::normalize_path(path);
        if let Some(size) = self.inner.size_cache.lock_ignore_poison().get(volume_id, &path) {
            return Ok(size);
        }
        let live = self.inner.live_store(volume_id)?;
        let size = live.with_store(|store| aggregator::compute_and_persist(store.connection(), volume_id, &path))?;
        self.inner
            .size_cache
            .lock_ignore_poison()
            .insert(volume_id, &path, size);
        Ok(size)
    }

    pub fn update_entry_size(&self, volume_id: &str, entry_id: i64, size: u64) -> Result<(), CatalogError> {
        let live = self.inner.live_store(volume_id)?;
        live.with_store(|store| IndexStore::update_entry_size(store.connection(), entry_id, size))?;
        self.inner.size_cache.lock_ignore_poison().invalidate_volume(volume_id);
        Ok(())
    }

    /// Soft-delete one entry (for example, after it vanished from disk).
    pub fn mark_entry_deleted(&self, volume_id: &str, path: &str, reason: &str) -> Result<(), CatalogError> {
        let path = paths::normalize_path(path);
        let live = self.inner.live_store(volume_id)?;
        live.with_store(|store| IndexStore::mark_entry_deleted(store.connection(), volume_id, &path, reason))?;
        self.inner
            .size_cache
            .lock_ignore_poison()
            .invalidate_path(volume_id, &path);
        Ok(())
    }

    /// Compare the name index against the live rows; rebuild in the background if they drifted.
    pub fn verify_search_index(&self, volume_id: &str) -> Result<IndexHealth, CatalogError> {
        let live = self.inner.live_store(volume_id)?;
        let health = live.with_store(|store| search::check_name_index(store, self.inner.config.index_drift_tolerance))?;
        if health.needs_rebuild {
            log::info!(
                "Search index of {volume_id} drifted ({} indexed vs {} live), rebuilding",
                health.indexed_rows,
                health.live_rows
            );
            search::spawn_rebuild(live.db_path(), volume_id)?;
        }
        Ok(health)
    }
}

// ── ServiceInner ─────────────────────────────────────────────────────

impl ServiceInner {
    fn sync_env(&self) -> SyncEnv<'_> {
        SyncEnv {
            config: &self.config,
            catalog: &self.catalog,
            registry: &self.registry,
            backups: self.backups.as_ref(),
            sentinel: &self.sentinel,
            scheduler: &self.scheduler,
            listener: Arc::clone(&self.listener),
        }
    }

    fn volume(&self, volume_id: &str) -> Result<Volume, CatalogError> {
        self.catalog
            .get_volume(volume_id)?
            .ok_or_else(|| CatalogError::VolumeNotFound(volume_id.to_string()))
    }

    fn active_volume(&self, volume_id: &str) -> Result<Volume, CatalogError> {
        self.volume(volume_id)
            .and_then(|v| if v.is_deleted { Err(CatalogError::VolumeNotFound(volume_id.to_string())) } else { Ok(v) })
    }

    fn live_store(&self, volume_id: &str) -> Result<Arc<LiveStore>, CatalogError> {
        let volume = self.volume(volume_id)?;
        Ok(self.registry.get(&volume)?)
    }

    fn acquire(&self, volume_id: &str, volume_path: &str, priority: ScanPriority) -> Result<ScanGrant, CatalogError> {
        self.scheduler
            .start_scan(volume_id, volume_path, priority)
            .map_err(|rejection| {
                let blocked = rejection
                    .conflicts
                    .iter()
                    .any(|c| matches!(c, ScanConflict::RecoveryRequired { .. }));
                match self.interrupted.lock_ignore_poison().clone() {
                    Some(sentinel) if blocked => CatalogError::RecoveryRequired(Box::new(sentinel)),
                    _ => CatalogError::Rejected(rejection),
                }
            })
    }

    /// Block new scans on the sentinel a failed recovery left behind, as if found at startup.
    fn hold_for_recovery(&self) {
        match self.sentinel.read() {
            Ok(Some(found)) => {
                log::warn!("Sync of {} needs recovery before scans can resume", found.volume_id);
                self.scheduler.set_recovery_required(Some(found.volume_id.clone()));
                *self.interrupted.lock_ignore_poison() = Some(found);
            }
            Ok(None) => {}
            Err(e) => log::error!("Could not read the sync sentinel after a failed recovery: {e}"),
        }
    }

    /// Fail if a scan of `volume_id` holds its lock or the slot.
    fn ensure_idle(&self, volume_id: &str) -> Result<(), CatalogError> {
        let conflicts: Vec<ScanConflict> = self
            .scheduler
            .check_conflicts(volume_id)
            .into_iter()
            .filter(|c| match c {
                ScanConflict::VolumeLocked { .. } => true,
                ScanConflict::ScanRunning { volume_id: id } | ScanConflict::CleanupPending { volume_id: id } => {
                    id == volume_id
                }
                ScanConflict::RecoveryRequired { volume_id: id } => id == volume_id,
            })
            .collect();
        if conflicts.is_empty() {
            return Ok(());
        }
        Err(CatalogError::Rejected(ScanRejection {
            volume_id: volume_id.to_string(),
            conflicts,
        }))
    }

    fn refresh_space(&self, volume_id: &str) -> Result<Option<VolumeSpace>, CatalogError> {
        let volume = self.volume(volume_id)?;
        let Some(space) = space::space_for_path(Path::new(&volume.root_path)) else {
            return Ok(None);
        };
        self.catalog.update_space(volume_id, &space)?;
        Ok(Some(space))
    }

    /// First scan of a new volume, straight into its live store.
    ///
    /// On cancellation the rows written so far stay and `scan_completed_at` stays unset.
    fn scan_new_volume(&self, volume: &Volume, root: &Path, grant: &ScanGrant) -> Result<ScanReport, CatalogError> {
        let live = self.registry.get(volume)?;
        let db_path = live.db_path().to_path_buf();
        let run = match stream_scan(
            root,
            &volume.id,
            &db_path,
            &self.config,
            Arc::clone(&self.listener),
            &grant.cancel,
            &grant.progress,
        ) {
            Ok(run) => run,
            Err(ScanError::Cancelled) => {
                log::info!("First scan of {} cancelled, keeping what was written", volume.id);
                return Ok(ScanReport::cancelled(&volume.id));
            }
            Err(e) => return Err(e.into()),
        };

        let conn = IndexStore::open_write_connection(&db_path)?;
        let warnings = validation::validate(
            &conn,
            &ValidationInput {
                volume_id: &volume.id,
                root_path: &volume.root_path,
                duplicates: run.outcome.written.duplicates,
                scanned_bytes: Some(run.summary.total_bytes),
            },
        )?;
        sync::write_scan_meta(&conn, &run.summary)?;
        drop(conn);

        self.catalog.mark_synced(&volume.id, Utc::now())?;
        self.size_cache.lock_ignore_poison().invalidate_volume(&volume.id);
        Ok(ScanReport::completed(&volume.id, &run, warnings))
    }

    /// After "continue anyway": drop the half-built shadow unless the catalog already uses it.
    fn discard_stray_shadow(&self, sentinel: &SyncSentinel) -> Result<(), CatalogError> {
        let in_use = self
            .catalog
            .get_volume(&sentinel.volume_id)?
            .is_some_and(|v| v.db_file == sentinel.shadow_db_file);
        if !in_use {
            remove_db_files(&self.registry.store_path(&sentinel.shadow_db_file))?;
        }
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Canonical form of `path`, which must be a readable directory.
fn readable_dir(path: &Path) -> Result<PathBuf, CatalogError> {
    let invalid = || CatalogError::InvalidPath(path.display().to_string());
    let canonical = fs::canonicalize(path).map_err(|_| invalid())?;
    if !canonical.is_dir() {
        return Err(invalid());
    }
    fs::read_dir(&canonical).map_err(|_| invalid())?;
    Ok(canonical)
}

/// Emit a progress event every [`PROGRESS_INTERVAL`] until `stop` is dropped.
fn spawn_progress_reporter(
    volume_id: &str,
    progress: &Arc<ScanProgress>,
    listener: &Arc<dyn ProgressListener>,
    stop: mpsc::Receiver<()>,
) -> Option<thread::JoinHandle<()>> {
    let volume_id = volume_id.to_string();
    let progress = Arc::clone(progress);
    let listener = Arc::clone(listener);
    let spawned = thread::Builder::new().name("scan-progress".into()).spawn(move || {
        while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(PROGRESS_INTERVAL) {
            let snap = progress.snapshot();
            listener.on_event(
                ProgressEvent::new(ProgressKind::Progress, &volume_id, format!("Scanning {}", snap.current_dir))
                    .counts(snap.processed, snap.total, snap.errors),
            );
        }
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::warn!("Could not start progress reporter: {e}");
            None
        }
    }
}
