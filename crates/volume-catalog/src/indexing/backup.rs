//! Backup collaborator contract and a directory-backed implementation.
//!
//! The sync protocol only needs a narrow surface: snapshot a volume store or the catalog,
//! restore the most recent snapshot over a target path, and list/validate/delete snapshots.
//! [`DirectoryBackupStore`] keeps snapshots as SQLite files (`VACUUM INTO`) in one directory,
//! described by a JSON manifest.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};

use crate::ignore_poison::IgnorePoison;
use crate::indexing::store::{quick_check, remove_db_files};

const MANIFEST_FILE_NAME: &str = "manifest.json";

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Volume,
    Catalog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub id: String,
    pub kind: BackupKind,
    /// Set for volume backups.
    pub volume_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub file_name: String,
    pub size_bytes: u64,
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum BackupError {
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
    Manifest(serde_json::Error),
    UnknownBackup(String),
}

impl std::fmt::Display for BackupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupError::Io(e) => write!(f, "Backup I/O error: {e}"),
            BackupError::Sqlite(e) => write!(f, "Backup SQLite error: {e}"),
            BackupError::Manifest(e) => write!(f, "Backup manifest is unreadable: {e}"),
            BackupError::UnknownBackup(id) => write!(f, "No backup with id {id}"),
        }
    }
}

impl std::error::Error for BackupError {}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::Io(err)
    }
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Sqlite(err)
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Manifest(err)
    }
}

// ── Contract ─────────────────────────────────────────────────────────

/// What the sync protocol needs from a backup system.
pub trait BackupService: Send + Sync {
    /// Snapshot a volume's store.
    fn backup(&self, volume_id: &str, db_path: &Path) -> Result<BackupInfo, BackupError>;

    /// Snapshot the volume catalog.
    fn backup_catalog(&self, catalog_path: &Path) -> Result<BackupInfo, BackupError>;

    /// Write the volume's most recent snapshot to `target`. `None` if there is none.
    ///
    /// Nothing may hold `target` open while this runs.
    fn restore_volume_backup(&self, volume_id: &str, target: &Path) -> Result<Option<BackupInfo>, BackupError>;

    /// Write the most recent catalog snapshot to `target`. `None` if there is none.
    fn restore_catalog_backup(&self, target: &Path) -> Result<Option<BackupInfo>, BackupError>;

    /// All snapshots, oldest first.
    fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError>;

    /// Whether the snapshot exists and passes an integrity check.
    fn validate_backup(&self, backup_id: &str) -> Result<bool, BackupError>;

    /// Delete a snapshot. `false` if it did not exist.
    fn delete_backup(&self, backup_id: &str) -> Result<bool, BackupError>;
}

// ── DirectoryBackupStore ─────────────────────────────────────────────

/// Snapshots in a directory, with a JSON manifest listing them in creation order.
pub struct DirectoryBackupStore {
    dir: PathBuf,
    /// Serializes manifest read-modify-write cycles.
    manifest_lock: Mutex<()>,
}

impl DirectoryBackupStore {
    pub fn open(dir: &Path) -> Result<Self, BackupError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest_lock: Mutex::new(()),
        })
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE_NAME)
    }

    fn read_manifest(&self) -> Result<Vec<BackupInfo>, BackupError> {
        match fs::read(self.manifest_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_manifest(&self, entries: &[BackupInfo]) -> Result<(), BackupError> {
        let tmp = self.dir.join(format!("{MANIFEST_FILE_NAME}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, self.manifest_path())?;
        Ok(())
    }

    fn snapshot(&self, kind: BackupKind, volume_id: Option<&str>, source: &Path) -> Result<BackupInfo, BackupError> {
        let _guard = self.manifest_lock.lock_ignore_poison();
        let created_at = Utc::now();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let label = volume_id.unwrap_or("catalog");
        let file_name = format!("{label}-{}-{}.db", created_at.format("%Y%m%dT%H%M%S"), &id[..8]);
        let target = self.dir.join(&file_name);

        let conn = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
        conn.execute("VACUUM INTO ?1", params![target.to_string_lossy()])?;
        drop(conn);

        let info = BackupInfo {
            id,
            kind,
            volume_id: volume_id.map(str::to_string),
            created_at,
            file_name,
            size_bytes: fs::metadata(&target)?.len(),
        };
        let mut manifest = self.read_manifest()?;
        manifest.push(info.clone());
        self.write_manifest(&manifest)?;
        log::info!("Backup: saved {} as {}", source.display(), info.file_name);
        Ok(info)
    }

    fn restore_latest(
        &self,
        matches: impl Fn(&BackupInfo) -> bool,
        target: &Path,
    ) -> Result<Option<BackupInfo>, BackupError> {
        let _guard = self.manifest_lock.lock_ignore_poison();
        let Some(latest) = self.read_manifest()?.into_iter().rev().find(|b| matches(b)) else {
            return Ok(None);
        };
        remove_db_files(target)?;
        let tmp = target.with_extension("restore.tmp");
        fs::copy(self.dir.join(&latest.file_name), &tmp)?;
        fs::rename(&tmp, target)?;
        log::info!("Backup: restored {} to {}", latest.file_name, target.display());
        Ok(Some(latest))
    }
}

impl BackupService for DirectoryBackupStore {
    fn backup(&self, volume_id: &str, db_path: &Path) -> Result<BackupInfo, BackupError> {
        self.snapshot(BackupKind::Volume, Some(volume_id), db_path)
    }

    fn backup_catalog(&self, catalog_path: &Path) -> Result<BackupInfo, BackupError> {
        self.snapshot(BackupKind::Catalog, None, catalog_path)
    }

    fn restore_volume_backup(&self, volume_id: &str, target: &Path) -> Result<Option<BackupInfo>, BackupError> {
        self.restore_latest(
            |b| b.kind == BackupKind::Volume && b.volume_id.as_deref() == Some(volume_id),
            target,
        )
    }

    fn restore_catalog_backup(&self, target: &Path) -> Result<Option<BackupInfo>, BackupError> {
        self.restore_latest(|b| b.kind == BackupKind::Catalog, target)
    }

    fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        let _guard = self.manifest_lock.lock_ignore_poison();
        self.read_manifest()
    }

    fn validate_backup(&self, backup_id: &str) -> Result<bool, BackupError> {
        let info = {
            let _guard = self.manifest_lock.lock_ignore_poison();
            self.read_manifest()?.into_iter().find(|b| b.id == backup_id)
        };
        let Some(info) = info else {
            return Err(BackupError::UnknownBackup(backup_id.to_string()));
        };
        let path = self.dir.join(&info.file_name);
        if !path.exists() {
            return Ok(false);
        }
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        match quick_check(&conn) {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("Backup {backup_id} failed its integrity check: {e}");
                Ok(false)
            }
        }
    }

    fn delete_backup(&self, backup_id: &str) -> Result<bool, BackupError> {
        let _guard = self.manifest_lock.lock_ignore_poison();
        let mut manifest = self.read_manifest()?;
        let Some(pos) = manifest.iter().position(|b| b.id == backup_id) else {
            return Ok(false);
        };
        let removed = manifest.remove(pos);
        match fs::remove_file(self.dir.join(&removed.file_name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.write_manifest(&manifest)?;
        Ok(true)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::store::IndexStore;
    use crate::indexing::store::tests::file_entry;

    fn store_with(dir: &Path, name: &str, files: &[&str]) -> PathBuf {
        let db_path = dir.join(name);
        IndexStore::open(&db_path).unwrap();
        let conn = IndexStore::open_write_connection(&db_path).unwrap();
        let entries: Vec<_> = files.iter().map(|f| file_entry("v1", "/r", f, 1)).collect();
        IndexStore::insert_entries_batch(&conn, &entries).unwrap();
        db_path
    }

    fn paths_in(db_path: &Path) -> Vec<String> {
        let store = IndexStore::open(db_path).unwrap();
        IndexStore::all_entries(store.connection(), "v1")
            .unwrap()
            .into_iter()
            .map(|e| e.entry.path)
            .collect()
    }

    #[test]
    fn backup_and_restore_latest_volume_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let backups = DirectoryBackupStore::open(&dir.path().join("backups")).unwrap();
        let live = store_with(dir.path(), "live.db", &["/r/a"]);

        backups.backup("v1", &live).unwrap();
        {
            let conn = IndexStore::open_write_connection(&live).unwrap();
            IndexStore::insert_entries_batch(&conn, &[file_entry("v1", "/r", "/r/b", 1)]).unwrap();
        }
        let second = backups.backup("v1", &live).unwrap();

        let target = dir.path().join("restored.db");
        let restored = backups.restore_volume_backup("v1", &target).unwrap().unwrap();
        assert_eq!(restored.id, second.id);
        assert_eq!(paths_in(&target), vec!["/r/a", "/r/b"]);

        assert!(backups.restore_volume_backup("other", &target).unwrap().is_none());
        assert!(backups.restore_catalog_backup(&target).unwrap().is_none());
    }

    #[test]
    fn restore_overwrites_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let backups = DirectoryBackupStore::open(&dir.path().join("backups")).unwrap();
        let live = store_with(dir.path(), "live.db", &["/r/original"]);
        backups.backup("v1", &live).unwrap();

        {
            let conn = IndexStore::open_write_connection(&live).unwrap();
            IndexStore::replace_entry_tree(&conn, "v1", &[file_entry("v1", "/r", "/r/changed", 1)]).unwrap();
        }
        backups.restore_volume_backup("v1", &live).unwrap().unwrap();
        assert_eq!(paths_in(&live), vec!["/r/original"]);
    }

    #[test]
    fn list_validate_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backups = DirectoryBackupStore::open(&dir.path().join("backups")).unwrap();
        let live = store_with(dir.path(), "live.db", &["/r/a"]);

        let vol = backups.backup("v1", &live).unwrap();
        let cat = backups.backup_catalog(&live).unwrap();
        let listed = backups.list_backups().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].kind, BackupKind::Volume);
        assert_eq!(listed[1].kind, BackupKind::Catalog);
        assert!(listed[0].size_bytes > 0);

        assert!(backups.validate_backup(&vol.id).unwrap());
        fs::write(dir.path().join("backups").join(&cat.file_name), b"garbage garbage garbage").unwrap();
        assert!(!backups.validate_backup(&cat.id).unwrap_or(false));
        assert!(matches!(
            backups.validate_backup("nope"),
            Err(BackupError::UnknownBackup(_))
        ));

        assert!(backups.delete_backup(&vol.id).unwrap());
        assert!(!backups.delete_backup(&vol.id).unwrap());
        assert_eq!(backups.list_backups().unwrap().len(), 1);
        assert!(!dir.path().join("backups").join(&vol.file_name).exists());
    }
}
