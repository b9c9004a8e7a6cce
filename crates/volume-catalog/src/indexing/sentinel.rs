//! Durable record of an in-progress sync.
//!
//! Written before a sync touches anything, rewritten on entry to every phase, and deleted
//! only when the sync finalized or recovery succeeded. Finding one at startup means the
//! process died mid-sync.
//!
//! Writes go to a temp file that is fsynced and renamed over the real one, so a crash
//! leaves either the previous record or the new one, never a torn file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SENTINEL_FILE_NAME: &str = "sync-sentinel.json";

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Initialization,
    CatalogBackup,
    FileScan,
    Finalization,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Initialization => "initialization",
            SyncPhase::CatalogBackup => "catalog-backup",
            SyncPhase::FileScan => "file-scan",
            SyncPhase::Finalization => "finalization",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSentinel {
    pub volume_id: String,
    pub volume_name: String,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    /// Live store file name at the time the sync began.
    pub live_db_file: String,
    /// Shadow store file name this sync builds.
    pub shadow_db_file: String,
    pub catalog_backup_created: bool,
    pub phase: SyncPhase,
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SentinelError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for SentinelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SentinelError::Io(e) => write!(f, "Sentinel I/O error: {e}"),
            SentinelError::Json(e) => write!(f, "Sentinel is not valid JSON: {e}"),
        }
    }
}

impl std::error::Error for SentinelError {}

impl From<std::io::Error> for SentinelError {
    fn from(err: std::io::Error) -> Self {
        SentinelError::Io(err)
    }
}

impl From<serde_json::Error> for SentinelError {
    fn from(err: serde_json::Error) -> Self {
        SentinelError::Json(err)
    }
}

// ── SentinelFile ─────────────────────────────────────────────────────

/// The sentinel's location on disk.
#[derive(Debug, Clone)]
pub struct SentinelFile {
    path: PathBuf,
}

impl SentinelFile {
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SENTINEL_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the record on disk.
    pub fn write(&self, sentinel: &SyncSentinel) -> Result<(), SentinelError> {
        let json = serde_json::to_vec_pretty(sentinel)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path);
        Ok(())
    }

    /// Rewrite the record with a new phase.
    pub fn advance(&self, sentinel: &mut SyncSentinel, phase: SyncPhase) -> Result<(), SentinelError> {
        sentinel.phase = phase;
        self.write(sentinel)
    }

    /// Read the record, if one exists.
    pub fn read(&self) -> Result<Option<SyncSentinel>, SentinelError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the record. A missing file is fine.
    pub fn delete(&self) -> Result<(), SentinelError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                sync_parent_dir(&self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Make a rename or delete durable. Not supported everywhere, so failures are only logged.
fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent()
        && let Err(e) = File::open(parent).and_then(|dir| dir.sync_all())
    {
        log::debug!("Could not fsync {}: {e}", parent.display());
    }
    #[cfg(not(unix))]
    let _ = path;
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SyncSentinel {
        SyncSentinel {
            volume_id: "v1".into(),
            volume_name: "Photos".into(),
            operation: "sync".into(),
            started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            live_db_file: "vol-v1.db".into(),
            shadow_db_file: "vol-v1-abc.db".into(),
            catalog_backup_created: false,
            phase: SyncPhase::Initialization,
        }
    }

    #[test]
    fn write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let file = SentinelFile::in_dir(dir.path());
        assert_eq!(file.read().unwrap(), None);

        let mut sentinel = sample();
        file.write(&sentinel).unwrap();
        assert_eq!(file.read().unwrap(), Some(sentinel.clone()));

        sentinel.catalog_backup_created = true;
        file.advance(&mut sentinel, SyncPhase::FileScan).unwrap();
        let read = file.read().unwrap().unwrap();
        assert_eq!(read.phase, SyncPhase::FileScan);
        assert!(read.catalog_backup_created);

        file.delete().unwrap();
        assert_eq!(file.read().unwrap(), None);
        file.delete().unwrap();
    }

    #[test]
    fn field_names_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = SentinelFile::in_dir(dir.path());
        file.write(&sample()).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&fs::read(file.path()).unwrap()).unwrap();
        assert_eq!(json["volumeId"], "v1");
        assert_eq!(json["shadowDbFile"], "vol-v1-abc.db");
        assert_eq!(json["catalogBackupCreated"], false);
        assert_eq!(json["phase"], "initialization");
        assert!(!dir.path().join("sync-sentinel.json.tmp").exists());
    }

    #[test]
    fn corrupt_sentinel_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = SentinelFile::in_dir(dir.path());
        fs::write(file.path(), b"{ not json").unwrap();
        assert!(matches!(file.read(), Err(SentinelError::Json(_))));
    }
}
