//! Re-syncing an existing volume through a shadow store, and recovering when that fails.
//!
//! Phases, each recorded in the sentinel before it starts:
//!
//! 1. **initialization**: the sentinel is written.
//! 2. **catalog-backup**: best-effort snapshots of the catalog and of the live store.
//! 3. **file-scan**: the tree is streamed into a brand-new shadow store. The live store
//!    is not written in this phase, or in any earlier one.
//! 4. **finalization**: the shadow is validated and stamped, the catalog is repointed at
//!    it in one transaction, the in-memory handle is swapped, the name index is rebuilt,
//!    the new live store is backed up and the pre-sync snapshots are dropped. The sentinel
//!    is deleted next, and only then the old store file.
//!
//! Cancellation and errors in phases 2-4 go through [`recover`], which is also what an
//! operator picks at startup when a sentinel survived a crash.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;

use crate::config::CatalogConfig;
use crate::indexing::backup::BackupService;
use crate::indexing::live::StoreRegistry;
use crate::indexing::paths::normalize_path;
use crate::indexing::progress::ProgressListener;
use crate::indexing::scanner::{ScanError, ScanSummary};
use crate::indexing::scheduler::{ScanGrant, ScanScheduler};
use crate::indexing::sentinel::{SentinelError, SentinelFile, SyncPhase, SyncSentinel};
use crate::indexing::store::{IndexStore, IndexStoreError, remove_db_files};
use crate::indexing::streaming::stream_scan;
use crate::indexing::validation::{self, ValidationInput};
use crate::indexing::volumes::{Volume, VolumeCatalog};
use crate::indexing::{CatalogError, ScanReport};

/// Everything a sync or a recovery touches.
pub(crate) struct SyncEnv<'a> {
    pub config: &'a CatalogConfig,
    pub catalog: &'a VolumeCatalog,
    pub registry: &'a StoreRegistry,
    pub backups: &'a dyn BackupService,
    pub sentinel: &'a SentinelFile,
    pub scheduler: &'a ScanScheduler,
    pub listener: Arc<dyn ProgressListener>,
}

enum SyncStop {
    Cancelled,
    Failed(CatalogError),
}

impl From<ScanError> for SyncStop {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Cancelled => SyncStop::Cancelled,
            other => SyncStop::Failed(CatalogError::Scan(other)),
        }
    }
}

impl From<IndexStoreError> for SyncStop {
    fn from(err: IndexStoreError) -> Self {
        SyncStop::Failed(CatalogError::Store(err))
    }
}

impl From<SentinelError> for SyncStop {
    fn from(err: SentinelError) -> Self {
        SyncStop::Failed(CatalogError::Sentinel(err))
    }
}

// ── Sync ─────────────────────────────────────────────────────────────

/// Re-scan `volume` from `root` into a shadow store and promote it.
///
/// A cancelled sync is recovered and reported as a cancelled scan. A failed one is
/// recovered and reported as `SyncFailed`; if recovery fails too, `RecoveryFailed`.
pub(crate) fn run_sync(
    env: &SyncEnv<'_>,
    volume: &Volume,
    root: &Path,
    grant: &ScanGrant,
) -> Result<ScanReport, CatalogError> {
    let mut sentinel = SyncSentinel {
        volume_id: volume.id.clone(),
        volume_name: volume.name.clone(),
        operation: "sync".to_string(),
        started_at: Utc::now(),
        live_db_file: volume.db_file.clone(),
        shadow_db_file: format!("vol-{}-{}.db", volume.id, uuid::Uuid::new_v4().simple()),
        catalog_backup_created: false,
        phase: SyncPhase::Initialization,
    };
    log::info!("Sync {}: {} (shadow {})", volume.id, sentinel.phase, sentinel.shadow_db_file);
    env.sentinel.write(&sentinel)?;

    let mut pre_sync_backups = Vec::new();
    match drive(env, volume, root, grant, &mut sentinel, &mut pre_sync_backups) {
        Ok(report) => Ok(report),
        Err(SyncStop::Cancelled) => {
            log::info!("Sync {}: cancelled during {}", volume.id, sentinel.phase);
            let restore_live = sentinel.phase == SyncPhase::Finalization;
            match recover(env, &sentinel, restore_live) {
                Ok(()) => Ok(ScanReport::cancelled(&volume.id)),
                Err(e) => Err(CatalogError::RecoveryFailed {
                    cause: "sync cancelled".to_string(),
                    recovery_error: e.to_string(),
                }),
            }
        }
        Err(SyncStop::Failed(cause)) => {
            log::warn!("Sync {}: failed during {}: {cause}", volume.id, sentinel.phase);
            let restore_live = sentinel.phase == SyncPhase::Finalization;
            match recover(env, &sentinel, restore_live) {
                Ok(()) => Err(CatalogError::SyncFailed {
                    cause: cause.to_string(),
                    recovered: true,
                }),
                Err(e) => Err(CatalogError::RecoveryFailed {
                    cause: cause.to_string(),
                    recovery_error: e.to_string(),
                }),
            }
        }
    }
}

fn drive(
    env: &SyncEnv<'_>,
    volume: &Volume,
    root: &Path,
    grant: &ScanGrant,
    sentinel: &mut SyncSentinel,
    pre_sync_backups: &mut Vec<String>,
) -> Result<ScanReport, SyncStop> {
    let id = volume.id.as_str();
    let live_path = env.registry.store_path(&volume.db_file);
    let shadow_path = env.registry.store_path(&sentinel.shadow_db_file);

    // ── catalog-backup ──
    enter(env, sentinel, SyncPhase::CatalogBackup)?;
    env.scheduler.set_message(id, "Backing up catalog");
    match env.backups.backup_catalog(env.catalog.db_path()) {
        Ok(info) => {
            sentinel.catalog_backup_created = true;
            pre_sync_backups.push(info.id);
        }
        Err(e) => log::warn!("Sync {id}: catalog backup failed, continuing without it: {e}"),
    }
    if live_path.exists() {
        match env.backups.backup(id, &live_path) {
            Ok(info) => pre_sync_backups.push(info.id),
            Err(e) => log::warn!("Sync {id}: live store backup failed, continuing without it: {e}"),
        }
    }
    stop_if_cancelled(grant)?;

    // ── file-scan ──
    enter(env, sentinel, SyncPhase::FileScan)?;
    drop(IndexStore::create_new(&shadow_path)?);
    env.scheduler.set_message(id, "Scanning");
    let run = stream_scan(
        root,
        id,
        &shadow_path,
        env.config,
        Arc::clone(&env.listener),
        &grant.cancel,
        &grant.progress,
    )?;

    // ── finalization ──
    env.scheduler.set_cancelable(id, false);
    stop_if_cancelled(grant)?;
    enter(env, sentinel, SyncPhase::Finalization)?;
    env.scheduler.set_message(id, "Finalizing");

    let root_norm = normalize_path(&root.to_string_lossy());
    let warnings = {
        let conn = IndexStore::open_write_connection(&shadow_path)?;
        let warnings = validation::validate(
            &conn,
            &ValidationInput {
                volume_id: id,
                root_path: &root_norm,
                duplicates: run.outcome.written.duplicates,
                scanned_bytes: Some(run.summary.total_bytes),
            },
        )?;
        write_scan_meta(&conn, &run.summary)?;
        warnings
    };

    env.catalog
        .promote_store(id, &sentinel.shadow_db_file, &root_norm, Utc::now())?;
    env.registry.install(id, &sentinel.shadow_db_file)?;
    log::info!("Sync {id}: promoted {}", sentinel.shadow_db_file);

    let indexed = IndexStore::rebuild_name_index(&IndexStore::open_write_connection(&shadow_path)?)?;
    log::debug!("Sync {id}: name index rebuilt ({indexed} rows)");

    match env.backups.backup(id, &shadow_path) {
        Ok(_) => discard_backups(env, id, pre_sync_backups),
        Err(e) => log::warn!("Sync {id}: backup of the new store failed, keeping pre-sync backups: {e}"),
    }
    env.sentinel.delete()?;

    // Recovery may still need the old store until the sentinel is gone
    if let Err(e) = remove_db_files(&live_path) {
        log::warn!("Sync {id}: could not delete old store {}: {e}", live_path.display());
    }
    log::info!("Sync {id}: done, {} entries", run.summary.total_entries);

    Ok(ScanReport::completed(id, &run, warnings))
}

fn enter(env: &SyncEnv<'_>, sentinel: &mut SyncSentinel, phase: SyncPhase) -> Result<(), SentinelError> {
    log::info!("Sync {}: {phase}", sentinel.volume_id);
    env.sentinel.advance(sentinel, phase)
}

fn stop_if_cancelled(grant: &ScanGrant) -> Result<(), SyncStop> {
    if grant.cancel.is_cancelled() {
        return Err(SyncStop::Cancelled);
    }
    Ok(())
}

fn discard_backups(env: &SyncEnv<'_>, volume_id: &str, backup_ids: &[String]) {
    for backup_id in backup_ids {
        match env.backups.delete_backup(backup_id) {
            Ok(_) => {}
            Err(e) => log::warn!("Sync {volume_id}: could not delete pre-sync backup {backup_id}: {e}"),
        }
    }
}

/// Mark a store's scan complete. The volume id and root were stamped when the scan started.
pub(crate) fn write_scan_meta(conn: &Connection, summary: &ScanSummary) -> Result<(), IndexStoreError> {
    IndexStore::update_meta(conn, "scan_completed_at", &Utc::now().to_rfc3339())?;
    IndexStore::update_meta(conn, "scan_duration_ms", &summary.duration_ms.to_string())?;
    IndexStore::update_meta(conn, "total_entries", &summary.total_entries.to_string())
}

// ── Recovery ─────────────────────────────────────────────────────────

/// Put the volume back the way it was before the sync in `sentinel`.
///
/// `restore_live` also overwrites the live store with its latest backup. The sentinel is
/// deleted only when every step, integrity checks included, succeeded.
pub(crate) fn recover(env: &SyncEnv<'_>, sentinel: &SyncSentinel, restore_live: bool) -> Result<(), CatalogError> {
    let id = sentinel.volume_id.as_str();
    log::warn!(
        "Sync {id}: recovering from an interrupted {} (phase {}, started {})",
        sentinel.operation,
        sentinel.phase,
        sentinel.started_at
    );
    env.registry.suspend(id);
    let result = restore(env, sentinel, restore_live);
    env.registry.resume(id);

    match &result {
        Ok(()) => log::info!("Sync {id}: recovery complete"),
        Err(e) => log::error!("Sync {id}: recovery failed, manual restore needed: {e}"),
    }
    result
}

fn restore(env: &SyncEnv<'_>, sentinel: &SyncSentinel, restore_live: bool) -> Result<(), CatalogError> {
    let id = sentinel.volume_id.as_str();
    let shadow_path = env.registry.store_path(&sentinel.shadow_db_file);
    let live_path = env.registry.store_path(&sentinel.live_db_file);
    let points_at_shadow = env
        .catalog
        .get_volume(id)?
        .is_some_and(|v| v.db_file == sentinel.shadow_db_file);

    if restore_live {
        match env.backups.restore_volume_backup(id, &live_path)? {
            Some(info) => log::info!("Sync {id}: live store restored from backup {}", info.id),
            None if live_path.exists() => log::warn!("Sync {id}: no backup to restore, keeping the live store as is"),
            None if points_at_shadow && shadow_path.exists() => {
                log::warn!(
                    "Sync {id}: old store and its backup are both gone, keeping the promoted store {}",
                    sentinel.shadow_db_file
                );
                return verify_and_clear(env, id);
            }
            None => return Err(IndexStoreError::NotFound(format!("backup of volume {id}")).into()),
        }
    }

    remove_db_files(&shadow_path)?;

    if sentinel.catalog_backup_created {
        restore_catalog_row(env, id)?;
    }

    // Without a catalog snapshot the catalog may still name the deleted shadow
    if let Some(mut volume) = env.catalog.get_volume(id)?
        && volume.db_file == sentinel.shadow_db_file
    {
        log::warn!("Sync {id}: pointing the catalog back at {}", sentinel.live_db_file);
        volume.db_file = sentinel.live_db_file.clone();
        env.catalog.upsert_volume(&volume)?;
    }

    verify_and_clear(env, id)
}

/// Bring back this volume's catalog row from the latest catalog backup. Rows of other
/// volumes may have changed since the backup and are kept as they are now.
fn restore_catalog_row(env: &SyncEnv<'_>, id: &str) -> Result<(), CatalogError> {
    let snapshot = env.catalog.db_path().with_extension("restore.db");
    match env.backups.restore_catalog_backup(&snapshot)? {
        Some(info) => log::info!("Sync {id}: catalog row restored from backup {}", info.id),
        None => return Err(IndexStoreError::NotFound("catalog backup".to_string()).into()),
    }
    let restored = env.catalog.restore_volume_row(id, &snapshot);
    if let Err(e) = remove_db_files(&snapshot) {
        log::warn!("Sync {id}: could not delete {}: {e}", snapshot.display());
    }
    if !restored? {
        log::warn!("Sync {id}: catalog backup has no row for this volume, keeping the current one");
    }
    Ok(())
}

fn verify_and_clear(env: &SyncEnv<'_>, id: &str) -> Result<(), CatalogError> {
    env.catalog.quick_check()?;
    if let Some(volume) = env.catalog.get_volume(id)? {
        let path = env.registry.store_path(&volume.db_file);
        if path.exists() {
            IndexStore::open_existing(&path)?.quick_check()?;
        } else {
            log::warn!("Sync {id}: live store {} is missing, it will start empty", volume.db_file);
        }
    }

    env.sentinel.delete()?;
    Ok(())
}
