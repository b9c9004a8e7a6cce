//! The volume catalog: one row per cataloged volume, in `catalog.db`.
//!
//! Besides the descriptive fields, each row names the volume's current live store file
//! (`db_file`). Promoting a shadow store is a single update of that column, so the catalog
//! on disk always points at exactly one complete store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::ignore_poison::IgnorePoison;
use crate::indexing::store::{IndexStoreError, quick_check};

const CATALOG_SCHEMA_VERSION: &str = "1";

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub total_capacity: Option<u64>,
    pub used_space: Option<u64>,
    pub free_space: Option<u64>,
    pub format: Option<String>,
    pub added_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// File name of the live store inside the volumes directory.
    pub db_file: String,
}

/// Capacity figures for the disk a volume lives on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpace {
    pub total_capacity: u64,
    pub used_space: u64,
    pub free_space: u64,
    pub format: Option<String>,
}

// ── Schema ───────────────────────────────────────────────────────────

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS volumes (
        id             TEXT PRIMARY KEY,
        name           TEXT    NOT NULL,
        root_path      TEXT    NOT NULL,
        total_capacity INTEGER,
        used_space     INTEGER,
        free_space     INTEGER,
        format         TEXT,
        added_at       INTEGER NOT NULL,
        last_synced_at INTEGER,
        is_deleted     INTEGER NOT NULL DEFAULT 0,
        deleted_at     INTEGER,
        db_file        TEXT    NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

const VOLUME_COLUMNS: &str = "id, name, root_path, total_capacity, used_space, free_space, format,
     added_at, last_synced_at, is_deleted, deleted_at, db_file";

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn volume_from_row(row: &Row<'_>) -> rusqlite::Result<Volume> {
    Ok(Volume {
        id: row.get(0)?,
        name: row.get(1)?,
        root_path: row.get(2)?,
        total_capacity: row.get(3)?,
        used_space: row.get(4)?,
        free_space: row.get(5)?,
        format: row.get(6)?,
        added_at: from_millis(row.get(7)?),
        last_synced_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        is_deleted: row.get::<_, i32>(9)? != 0,
        deleted_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
        db_file: row.get(11)?,
    })
}

fn open_connection(db_path: &Path) -> Result<Connection, IndexStoreError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA busy_timeout = 5000;",
    )?;
    conn.execute_batch(CREATE_TABLES_SQL)?;

    let version: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
        .optional()?;
    match version {
        Some(v) if v == CATALOG_SCHEMA_VERSION => {}
        Some(v) => {
            return Err(IndexStoreError::SchemaMismatch {
                expected: CATALOG_SCHEMA_VERSION.to_string(),
                found: v,
            });
        }
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![CATALOG_SCHEMA_VERSION],
            )?;
        }
    }
    Ok(conn)
}

fn copy_row_from_snapshot(conn: &Connection, volume_id: &str) -> Result<bool, IndexStoreError> {
    let tx = conn.unchecked_transaction()?;
    let present: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM snapshot.volumes WHERE id = ?1)",
        params![volume_id],
        |row| row.get(0),
    )?;
    if !present {
        return Ok(false);
    }
    tx.execute("DELETE FROM main.volumes WHERE id = ?1", params![volume_id])?;
    let sql = format!(
        "INSERT INTO main.volumes ({VOLUME_COLUMNS}) SELECT {VOLUME_COLUMNS} FROM snapshot.volumes WHERE id = ?1"
    );
    tx.execute(&sql, params![volume_id])?;
    tx.commit()?;
    Ok(true)
}

// ── VolumeCatalog ────────────────────────────────────────────────────

/// Handle to `catalog.db`. The table is small, so one connection serves reads and writes.
pub struct VolumeCatalog {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl VolumeCatalog {
    /// Open (or create) the catalog.
    ///
    /// Unlike per-volume stores, a corrupt catalog is never deleted automatically: it is the
    /// only record of which volumes exist, and the backup collaborator may still restore it.
    pub fn open(db_path: &Path) -> Result<Self, IndexStoreError> {
        let conn = open_connection(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert a volume or overwrite every field of an existing one.
    pub fn upsert_volume(&self, volume: &Volume) -> Result<(), IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        conn.execute(
            "INSERT INTO volumes (id, name, root_path, total_capacity, used_space, free_space, format,
                                  added_at, last_synced_at, is_deleted, deleted_at, db_file)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 root_path = excluded.root_path,
                 total_capacity = excluded.total_capacity,
                 used_space = excluded.used_space,
                 free_space = excluded.free_space,
                 format = excluded.format,
                 added_at = excluded.added_at,
                 last_synced_at = excluded.last_synced_at,
                 is_deleted = excluded.is_deleted,
                 deleted_at = excluded.deleted_at,
                 db_file = excluded.db_file",
            params![
                volume.id,
                volume.name,
                volume.root_path,
                volume.total_capacity,
                volume.used_space,
                volume.free_space,
                volume.format,
                to_millis(volume.added_at),
                volume.last_synced_at.map(to_millis),
                volume.is_deleted as i32,
                volume.deleted_at.map(to_millis),
                volume.db_file,
            ],
        )?;
        Ok(())
    }

    pub fn get_volume(&self, volume_id: &str) -> Result<Option<Volume>, IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE id = ?1");
        let volume = conn.query_row(&sql, params![volume_id], volume_from_row).optional()?;
        Ok(volume)
    }

    /// All volumes, oldest first. `active_only` leaves out tombstoned ones.
    pub fn list_volumes(&self, active_only: bool) -> Result<Vec<Volume>, IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        let filter = if active_only { "WHERE is_deleted = 0" } else { "" };
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes {filter} ORDER BY added_at, id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], volume_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Durably repoint a volume at a newly promoted store, in one transaction.
    pub fn promote_store(
        &self,
        volume_id: &str,
        db_file: &str,
        root_path: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        let tx = conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE volumes SET db_file = ?2, root_path = ?3, last_synced_at = ?4 WHERE id = ?1",
            params![volume_id, db_file, root_path, to_millis(synced_at)],
        )?;
        if changed == 0 {
            return Err(IndexStoreError::NotFound(format!("volume {volume_id}")));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn mark_synced(&self, volume_id: &str, synced_at: DateTime<Utc>) -> Result<(), IndexStoreError> {
        self.update_one(
            "UPDATE volumes SET last_synced_at = ?2 WHERE id = ?1",
            volume_id,
            to_millis(synced_at),
        )
    }

    pub fn update_space(&self, volume_id: &str, space: &VolumeSpace) -> Result<(), IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        let changed = conn.execute(
            "UPDATE volumes SET total_capacity = ?2, used_space = ?3, free_space = ?4, format = ?5 WHERE id = ?1",
            params![volume_id, space.total_capacity, space.used_space, space.free_space, space.format],
        )?;
        if changed == 0 {
            return Err(IndexStoreError::NotFound(format!("volume {volume_id}")));
        }
        Ok(())
    }

    /// Soft delete: the row stays for audit, but drops out of active listings.
    pub fn tombstone(&self, volume_id: &str, at: DateTime<Utc>) -> Result<(), IndexStoreError> {
        self.update_one(
            "UPDATE volumes SET is_deleted = 1, deleted_at = ?2 WHERE id = ?1",
            volume_id,
            to_millis(at),
        )
    }

    /// Hard delete of the catalog row. The caller removes the store file.
    pub fn remove(&self, volume_id: &str) -> Result<(), IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        let changed = conn.execute("DELETE FROM volumes WHERE id = ?1", params![volume_id])?;
        if changed == 0 {
            return Err(IndexStoreError::NotFound(format!("volume {volume_id}")));
        }
        Ok(())
    }

    pub fn quick_check(&self) -> Result<(), IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        quick_check(&conn)
    }

    /// Put one volume's row back the way it is in `snapshot`, a catalog backup file.
    ///
    /// Other rows are left alone. Returns `false` (and changes nothing) when the snapshot has
    /// no row for the volume.
    pub fn restore_volume_row(&self, volume_id: &str, snapshot: &Path) -> Result<bool, IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        conn.execute("ATTACH DATABASE ?1 AS snapshot", params![snapshot.to_string_lossy()])?;
        let outcome = copy_row_from_snapshot(&conn, volume_id);
        if let Err(e) = conn.execute_batch("DETACH DATABASE snapshot") {
            log::warn!("Catalog: couldn't detach snapshot {}: {e}", snapshot.display());
        }
        outcome
    }

    fn update_one(&self, sql: &str, volume_id: &str, value: i64) -> Result<(), IndexStoreError> {
        let conn = self.conn.lock_ignore_poison();
        let changed = conn.execute(sql, params![volume_id, value])?;
        if changed == 0 {
            return Err(IndexStoreError::NotFound(format!("volume {volume_id}")));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp_catalog() -> (VolumeCatalog, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let catalog = VolumeCatalog::open(&dir.path().join("catalog.db")).expect("failed to open catalog");
        (catalog, dir)
    }

    fn volume(id: &str) -> Volume {
        Volume {
            id: id.into(),
            name: format!("Volume {id}"),
            root_path: format!("/mnt/{id}"),
            total_capacity: None,
            used_space: None,
            free_space: None,
            format: None,
            added_at: from_millis(1_700_000_000_000),
            last_synced_at: None,
            is_deleted: false,
            deleted_at: None,
            db_file: format!("vol-{id}.db"),
        }
    }

    #[test]
    fn upsert_and_get() {
        let (catalog, _dir) = open_temp_catalog();
        let mut v = volume("a");
        catalog.upsert_volume(&v).unwrap();
        assert_eq!(catalog.get_volume("a").unwrap(), Some(v.clone()));

        v.name = "Renamed".into();
        catalog.upsert_volume(&v).unwrap();
        assert_eq!(catalog.get_volume("a").unwrap().unwrap().name, "Renamed");
        assert_eq!(catalog.get_volume("missing").unwrap(), None);
    }

    #[test]
    fn paths_are_not_unique() {
        let (catalog, _dir) = open_temp_catalog();
        let a = volume("a");
        let mut b = volume("b");
        b.root_path = a.root_path.clone();
        catalog.upsert_volume(&a).unwrap();
        catalog.upsert_volume(&b).unwrap();
        assert_eq!(catalog.list_volumes(false).unwrap().len(), 2);
    }

    #[test]
    fn tombstoned_volumes_leave_active_listing() {
        let (catalog, _dir) = open_temp_catalog();
        catalog.upsert_volume(&volume("a")).unwrap();
        catalog.upsert_volume(&volume("b")).unwrap();
        catalog.tombstone("a", Utc::now()).unwrap();

        let active: Vec<_> = catalog.list_volumes(true).unwrap().into_iter().map(|v| v.id).collect();
        assert_eq!(active, vec!["b"]);
        let all = catalog.list_volumes(false).unwrap();
        assert_eq!(all.len(), 2);
        let a = catalog.get_volume("a").unwrap().unwrap();
        assert!(a.is_deleted);
        assert!(a.deleted_at.is_some());
    }

    #[test]
    fn promote_store_repoints_file_and_path() {
        let (catalog, _dir) = open_temp_catalog();
        catalog.upsert_volume(&volume("a")).unwrap();
        let at = from_millis(1_800_000_000_000);
        catalog.promote_store("a", "vol-a-new.db", "/media/a", at).unwrap();

        let a = catalog.get_volume("a").unwrap().unwrap();
        assert_eq!(a.db_file, "vol-a-new.db");
        assert_eq!(a.root_path, "/media/a");
        assert_eq!(a.last_synced_at, Some(at));

        assert!(matches!(
            catalog.promote_store("zzz", "x.db", "/x", at),
            Err(IndexStoreError::NotFound(_))
        ));
    }

    #[test]
    fn update_space_and_remove() {
        let (catalog, _dir) = open_temp_catalog();
        catalog.upsert_volume(&volume("a")).unwrap();
        let space = VolumeSpace {
            total_capacity: 1000,
            used_space: 600,
            free_space: 400,
            format: Some("apfs".into()),
        };
        catalog.update_space("a", &space).unwrap();
        let a = catalog.get_volume("a").unwrap().unwrap();
        assert_eq!(a.free_space, Some(400));
        assert_eq!(a.format.as_deref(), Some("apfs"));

        catalog.remove("a").unwrap();
        assert!(catalog.get_volume("a").unwrap().is_none());
        assert!(catalog.remove("a").is_err());
    }

    #[test]
    fn restore_volume_row_touches_only_that_row() {
        let (catalog, dir) = open_temp_catalog();
        catalog.upsert_volume(&volume("a")).unwrap();
        catalog.upsert_volume(&volume("b")).unwrap();

        // Snapshot, then diverge on both rows and add a third
        let snapshot = dir.path().join("snapshot.db");
        {
            let conn = catalog.conn.lock_ignore_poison();
            conn.execute("VACUUM INTO ?1", params![snapshot.to_string_lossy()]).unwrap();
        }
        catalog
            .promote_store("a", "vol-a-shadow.db", "/mnt/a", from_millis(1_800_000_000_000))
            .unwrap();
        catalog.tombstone("b", Utc::now()).unwrap();
        catalog.upsert_volume(&volume("c")).unwrap();

        assert!(catalog.restore_volume_row("a", &snapshot).unwrap());
        assert_eq!(catalog.get_volume("a").unwrap(), Some(volume("a")));
        assert!(catalog.get_volume("b").unwrap().unwrap().is_deleted);
        assert!(catalog.get_volume("c").unwrap().is_some());

        // Not in the snapshot: nothing changes
        assert!(!catalog.restore_volume_row("c", &snapshot).unwrap());
        assert!(catalog.get_volume("c").unwrap().is_some());

        // The attachment is gone, so the handle keeps working normally
        catalog.upsert_volume(&volume("d")).unwrap();
        assert_eq!(catalog.list_volumes(false).unwrap().len(), 4);
        catalog.quick_check().unwrap();
    }
}
