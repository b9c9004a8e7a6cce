//! SQLite store for one volume's file tree.
//!
//! One DB file per cataloged volume (the live store), plus at most one shadow
//! file while that volume is being re-synced. WAL mode for concurrent reads.
//! Bulk writes go through the writer thread (see `writer.rs`); this module provides
//! the schema, read queries, and static write helpers.
//!
//! The `entry_names` FTS5 table mirrors `entries.name` through triggers, so inserts,
//! renames, and deletes keep it current without an explicit rebuild.

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SCHEMA_VERSION: &str = "2";

// ── Types ────────────────────────────────────────────────────────────

/// A file or directory as produced by the scanner (everything but the row id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedEntry {
    pub volume_id: String,
    pub name: String,
    /// Full normalized path.
    pub path: String,
    /// `None` for the volume root.
    pub parent_path: Option<String>,
    pub is_directory: bool,
    /// Bytes for files. Directories start as `None` ("unknown") until computed on demand.
    pub size: Option<u64>,
    /// Unix seconds.
    pub created_at: Option<i64>,
    /// Unix seconds.
    pub modified_at: Option<i64>,
    pub depth: u32,
    pub inode: Option<u64>,
    pub hard_link_count: u64,
    pub is_hard_link: bool,
    pub hard_link_group: Option<String>,
    pub volume_root: String,
    /// `directory`, a lowercase extension, or `file`.
    pub kind: String,
}

/// A stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedEntry {
    pub id: i64,
    #[serde(flatten)]
    pub entry: ScannedEntry,
    pub is_deleted: bool,
    pub deleted_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub schema_version: Option<String>,
    pub volume_id: Option<String>,
    pub volume_path: Option<String>,
    pub scan_completed_at: Option<String>,
    pub scan_duration_ms: Option<String>,
    pub total_entries: Option<String>,
}

/// Row counts behind the search-index health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameIndexCounts {
    pub live_rows: u64,
    pub indexed_rows: u64,
}

impl NameIndexCounts {
    pub fn drift(&self) -> u64 {
        self.live_rows.abs_diff(self.indexed_rows)
    }
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum IndexStoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    SchemaMismatch { expected: String, found: String },
    NotFound(String),
}

impl From<rusqlite::Error> for IndexStoreError {
    fn from(err: rusqlite::Error) -> Self {
        IndexStoreError::Sqlite(err)
    }
}

impl From<std::io::Error> for IndexStoreError {
    fn from(err: std::io::Error) -> Self {
        IndexStoreError::Io(err)
    }
}

impl std::fmt::Display for IndexStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexStoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            IndexStoreError::Io(e) => write!(f, "I/O error: {e}"),
            IndexStoreError::SchemaMismatch { expected, found } => {
                write!(f, "Schema mismatch: expected {expected}, found {found}")
            }
            IndexStoreError::NotFound(what) => write!(f, "Not found: {what}"),
        }
    }
}

impl std::error::Error for IndexStoreError {}

// ── Schema ───────────────────────────────────────────────────────────

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        id              INTEGER PRIMARY KEY,
        volume_id       TEXT    NOT NULL,
        name            TEXT    NOT NULL,
        path            TEXT    NOT NULL,
        parent_path     TEXT,
        is_directory    INTEGER NOT NULL DEFAULT 0,
        size            INTEGER,
        created_at      INTEGER,
        modified_at     INTEGER,
        depth           INTEGER NOT NULL DEFAULT 0,
        inode           INTEGER,
        hard_link_count INTEGER NOT NULL DEFAULT 1,
        is_hard_link    INTEGER NOT NULL DEFAULT 0,
        hard_link_group TEXT,
        volume_root     TEXT    NOT NULL,
        kind            TEXT    NOT NULL DEFAULT 'file',
        is_deleted      INTEGER NOT NULL DEFAULT 0,
        deleted_reason  TEXT,
        UNIQUE (volume_id, path)
    );

    CREATE INDEX IF NOT EXISTS idx_entries_parent ON entries (volume_id, parent_path, name);
    CREATE INDEX IF NOT EXISTS idx_entries_link_group ON entries (hard_link_group)
        WHERE hard_link_group IS NOT NULL;

    CREATE VIRTUAL TABLE IF NOT EXISTS entry_names USING fts5(
        name,
        path UNINDEXED,
        tokenize = 'unicode61'
    );

    CREATE TRIGGER IF NOT EXISTS entries_after_insert AFTER INSERT ON entries BEGIN
        INSERT INTO entry_names (rowid, name, path) VALUES (new.id, new.name, new.path);
    END;

    CREATE TRIGGER IF NOT EXISTS entries_after_delete AFTER DELETE ON entries BEGIN
        DELETE FROM entry_names WHERE rowid = old.id;
    END;

    CREATE TRIGGER IF NOT EXISTS entries_after_rename AFTER UPDATE OF name, path ON entries BEGIN
        DELETE FROM entry_names WHERE rowid = old.id;
        INSERT INTO entry_names (rowid, name, path) VALUES (new.id, new.name, new.path);
    END;

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

const ENTRY_COLUMNS: &str = "id, volume_id, name, path, parent_path, is_directory, size, created_at, modified_at,
     depth, inode, hard_link_count, is_hard_link, hard_link_group, volume_root, kind, is_deleted, deleted_reason";

const INSERT_ENTRY_SQL: &str = "INSERT INTO entries
         (volume_id, name, path, parent_path, is_directory, size, created_at, modified_at,
          depth, inode, hard_link_count, is_hard_link, hard_link_group, volume_root, kind)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
     ON CONFLICT (volume_id, path) DO NOTHING";

/// Apply WAL-mode pragmas for performance.
fn apply_pragmas(conn: &Connection) -> Result<(), IndexStoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -65536;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), IndexStoreError> {
    conn.execute_batch(CREATE_TABLES_SQL)?;
    Ok(())
}

/// Drop all tables and recreate them from scratch.
fn reset_schema(conn: &Connection) -> Result<(), IndexStoreError> {
    conn.execute_batch(
        "DROP TRIGGER IF EXISTS entries_after_insert;
         DROP TRIGGER IF EXISTS entries_after_delete;
         DROP TRIGGER IF EXISTS entries_after_rename;
         DROP TABLE IF EXISTS entry_names;
         DROP TABLE IF EXISTS entries;
         DROP TABLE IF EXISTS meta;",
    )?;
    create_tables(conn)?;
    stamp_schema_version(conn)
}

fn stamp_schema_version(conn: &Connection) -> Result<(), IndexStoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    Ok(())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<IndexedEntry> {
    Ok(IndexedEntry {
        id: row.get(0)?,
        entry: ScannedEntry {
            volume_id: row.get(1)?,
            name: row.get(2)?,
            path: row.get(3)?,
            parent_path: row.get(4)?,
            is_directory: row.get::<_, i32>(5)? != 0,
            size: row.get(6)?,
            created_at: row.get(7)?,
            modified_at: row.get(8)?,
            depth: row.get(9)?,
            inode: row.get(10)?,
            hard_link_count: row.get(11)?,
            is_hard_link: row.get::<_, i32>(12)? != 0,
            hard_link_group: row.get(13)?,
            volume_root: row.get(14)?,
            kind: row.get(15)?,
        },
        is_deleted: row.get::<_, i32>(16)? != 0,
        deleted_reason: row.get(17)?,
    })
}

/// Remove a DB file and its WAL/SHM sidecars. Missing files are fine.
pub fn remove_db_files(db_path: &Path) -> Result<(), std::io::Error> {
    match std::fs::remove_file(db_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    // Sidecars can be stale even if the base DB was already deleted.
    for sidecar in sidecar_paths(db_path) {
        let _ = std::fs::remove_file(sidecar);
    }
    Ok(())
}

fn sidecar_paths(db_path: &Path) -> [PathBuf; 2] {
    let mut wal = db_path.as_os_str().to_os_string();
    wal.push("-wal");
    let mut shm = db_path.as_os_str().to_os_string();
    shm.push("-shm");
    [PathBuf::from(wal), PathBuf::from(shm)]
}

// ── IndexStore ───────────────────────────────────────────────────────

/// Read-oriented handle to one volume's database.
///
/// Holds a single read connection. Write operations use a separate connection
/// obtained via [`IndexStore::open_write_connection`].
pub struct IndexStore {
    db_path: PathBuf,
    read_conn: Connection,
}

impl IndexStore {
    /// Open (or create) the store at `db_path`.
    ///
    /// On version mismatch the schema is reset; on corruption the file is deleted and recreated.
    pub fn open(db_path: &Path) -> Result<Self, IndexStoreError> {
        match Self::try_open(db_path) {
            Ok(store) => Ok(store),
            Err(e) => {
                log::warn!("Volume store open failed for {} ({e}), deleting and recreating", db_path.display());
                Self::delete_and_recreate(db_path)
            }
        }
    }

    /// Create a brand-new, empty store. Fails if anything already exists at `db_path`.
    ///
    /// Used for shadow stores: never falls back to deleting a file.
    pub fn create_new(db_path: &Path) -> Result<Self, IndexStoreError> {
        if db_path.exists() {
            return Err(IndexStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("store already exists at {}", db_path.display()),
            )));
        }
        Self::try_open(db_path)
    }

    /// Open an existing store without any self-healing. Used for integrity checks
    /// and for reading stores whose contents must not be discarded.
    pub fn open_existing(db_path: &Path) -> Result<Self, IndexStoreError> {
        if !db_path.exists() {
            return Err(IndexStoreError::NotFound(db_path.display().to_string()));
        }
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        let version = Self::read_meta_value(&conn, "schema_version")?;
        match version {
            Some(v) if v == SCHEMA_VERSION => Ok(Self {
                db_path: db_path.to_path_buf(),
                read_conn: conn,
            }),
            Some(v) => Err(IndexStoreError::SchemaMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: v,
            }),
            None => Err(IndexStoreError::SchemaMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: "none".to_string(),
            }),
        }
    }

    fn try_open(db_path: &Path) -> Result<Self, IndexStoreError> {
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;

        match Self::read_meta_value(&conn, "schema_version")? {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                log::warn!("Schema version mismatch (expected {SCHEMA_VERSION}, found {v}), resetting");
                reset_schema(&conn)?;
            }
            None => stamp_schema_version(&conn)?,
        }

        Ok(Self {
            db_path: db_path.to_path_buf(),
            read_conn: conn,
        })
    }

    fn delete_and_recreate(db_path: &Path) -> Result<Self, IndexStoreError> {
        remove_db_files(db_path)?;
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;
        stamp_schema_version(&conn)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            read_conn: conn,
        })
    }

    /// Open a separate write connection with WAL pragmas.
    pub fn open_write_connection(db_path: &Path) -> Result<Connection, IndexStoreError> {
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        Ok(conn)
    }

    /// Borrow the read connection (for helpers that take a `&Connection`).
    pub fn connection(&self) -> &Connection {
        &self.read_conn
    }

    // ── Read methods ─────────────────────────────────────────────────

    /// Page through the live children of `parent_path`, directories first, then by name.
    pub fn list_children(
        &self,
        volume_id: &str,
        parent_path: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<IndexedEntry>, IndexStoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             WHERE volume_id = ?1 AND parent_path = ?2 AND is_deleted = 0
             ORDER BY is_directory DESC, name COLLATE NOCASE, name
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self.read_conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![volume_id, parent_path, limit, offset], entry_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Look up a single entry by path (soft-deleted entries included).
    pub fn get_entry_by_path(&self, volume_id: &str, path: &str) -> Result<Option<IndexedEntry>, IndexStoreError> {
        Self::entry_by_path(&self.read_conn, volume_id, path)
    }

    /// Run an already-escaped FTS5 query and return hits with their bm25 rank (lower is better).
    pub fn search_names(&self, fts_query: &str, limit: u32) -> Result<Vec<(IndexedEntry, f64)>, IndexStoreError> {
        let columns = ENTRY_COLUMNS
            .split(',')
            .map(|c| format!("e.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns}, bm25(entry_names) AS rank
             FROM entry_names JOIN entries e ON e.id = entry_names.rowid
             WHERE entry_names MATCH ?1 AND e.is_deleted = 0
             ORDER BY rank
             LIMIT ?2"
        );
        let mut stmt = self.read_conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![fts_query, limit], |row| Ok((entry_from_row(row)?, row.get::<_, f64>(18)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_index_status(&self) -> Result<IndexStatus, IndexStoreError> {
        Ok(IndexStatus {
            schema_version: Self::read_meta_value(&self.read_conn, "schema_version")?,
            volume_id: Self::read_meta_value(&self.read_conn, "volume_id")?,
            volume_path: Self::read_meta_value(&self.read_conn, "volume_path")?,
            scan_completed_at: Self::read_meta_value(&self.read_conn, "scan_completed_at")?,
            scan_duration_ms: Self::read_meta_value(&self.read_conn, "scan_duration_ms")?,
            total_entries: Self::read_meta_value(&self.read_conn, "total_entries")?,
        })
    }

    pub fn entry_count(&self) -> Result<u64, IndexStoreError> {
        Self::get_entry_count(&self.read_conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// DB file size on disk (bytes).
    pub fn db_file_size(&self) -> Result<u64, IndexStoreError> {
        Ok(std::fs::metadata(&self.db_path)?.len())
    }

    /// Run SQLite's structural check. `Ok(())` only if it reports `ok`.
    pub fn quick_check(&self) -> Result<(), IndexStoreError> {
        quick_check(&self.read_conn)
    }

    // ── Static write helpers (for the writer thread) ─────────────────

    /// Insert a batch inside one transaction. Returns how many rows were skipped
    /// because their `(volume_id, path)` already existed.
    pub fn insert_entries_batch(conn: &Connection, entries: &[ScannedEntry]) -> Result<u64, IndexStoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let tx = conn.unchecked_transaction()?;
        let duplicates = insert_all(&tx, entries)?;
        tx.commit()?;
        Ok(duplicates)
    }

    /// Atomically replace every entry of `volume_id` with `entries`.
    ///
    /// One transaction: concurrent readers see either the whole old tree or the whole new one.
    pub fn replace_entry_tree(conn: &Connection, volume_id: &str, entries: &[ScannedEntry]) -> Result<u64, IndexStoreError> {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM entries WHERE volume_id = ?1", params![volume_id])?;
        let duplicates = insert_all(&tx, entries)?;
        tx.commit()?;
        Ok(duplicates)
    }

    /// Set the size of one entry. Zero is stored as zero, never as NULL.
    pub fn update_entry_size(conn: &Connection, entry_id: i64, size: u64) -> Result<(), IndexStoreError> {
        let changed = conn.execute("UPDATE entries SET size = ?1 WHERE id = ?2", params![size, entry_id])?;
        if changed == 0 {
            return Err(IndexStoreError::NotFound(format!("entry {entry_id}")));
        }
        Ok(())
    }

    /// Soft-delete one entry. It stays in the table but drops out of listings, search, and totals.
    pub fn mark_entry_deleted(conn: &Connection, volume_id: &str, path: &str, reason: &str) -> Result<(), IndexStoreError> {
        let changed = conn.execute(
            "UPDATE entries SET is_deleted = 1, deleted_reason = ?3 WHERE volume_id = ?1 AND path = ?2",
            params![volume_id, path, reason],
        )?;
        if changed == 0 {
            return Err(IndexStoreError::NotFound(path.to_string()));
        }
        Ok(())
    }

    /// Drop and refill the name index from `entries`.
    pub fn rebuild_name_index(conn: &Connection) -> Result<u64, IndexStoreError> {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM entry_names", [])?;
        let inserted = tx.execute(
            "INSERT INTO entry_names (rowid, name, path) SELECT id, name, path FROM entries",
            [],
        )?;
        tx.commit()?;
        Ok(inserted as u64)
    }

    /// Live rows vs. rows in the name index.
    pub fn name_index_counts(conn: &Connection) -> Result<NameIndexCounts, IndexStoreError> {
        let live_rows = Self::get_entry_count(conn)?;
        let indexed_rows: u64 = conn.query_row("SELECT COUNT(*) FROM entry_names", [], |row| row.get(0))?;
        Ok(NameIndexCounts { live_rows, indexed_rows })
    }

    /// Ask SQLite to hand back as much cache memory as it can.
    pub fn release_memory(conn: &Connection) -> Result<(), IndexStoreError> {
        conn.execute_batch("PRAGMA shrink_memory;")?;
        Ok(())
    }

    pub fn update_meta(conn: &Connection, key: &str, value: &str) -> Result<(), IndexStoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, IndexStoreError> {
        Self::read_meta_value(conn, key)
    }

    pub fn get_entry_count(conn: &Connection) -> Result<u64, IndexStoreError> {
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn entry_by_path(conn: &Connection, volume_id: &str, path: &str) -> Result<Option<IndexedEntry>, IndexStoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE volume_id = ?1 AND path = ?2");
        let mut stmt = conn.prepare_cached(&sql)?;
        let result = stmt.query_row(params![volume_id, path], entry_from_row).optional()?;
        Ok(result)
    }

    /// All stored entries of a volume in insertion order.
    pub fn all_entries(conn: &Connection, volume_id: &str) -> Result<Vec<IndexedEntry>, IndexStoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE volume_id = ?1 ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![volume_id], entry_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Internal helpers ─────────────────────────────────────────────

    fn read_meta_value(conn: &Connection, key: &str) -> Result<Option<String>, IndexStoreError> {
        let mut stmt = conn.prepare_cached("SELECT value FROM meta WHERE key = ?1")?;
        let value = stmt.query_row(params![key], |row| row.get::<_, String>(0)).optional()?;
        Ok(value)
    }
}

fn insert_all(conn: &Connection, entries: &[ScannedEntry]) -> Result<u64, IndexStoreError> {
    let mut duplicates = 0u64;
    let mut stmt = conn.prepare_cached(INSERT_ENTRY_SQL)?;
    for e in entries {
        let inserted = stmt.execute(params![
            e.volume_id,
            e.name,
            e.path,
            e.parent_path,
            e.is_directory as i32,
            e.size,
            e.created_at,
            e.modified_at,
            e.depth,
            e.inode,
            e.hard_link_count,
            e.is_hard_link as i32,
            e.hard_link_group,
            e.volume_root,
            e.kind,
        ])?;
        if inserted == 0 {
            duplicates += 1;
        }
    }
    Ok(duplicates)
}

/// `PRAGMA quick_check` on any connection.
pub fn quick_check(conn: &Connection) -> Result<(), IndexStoreError> {
    let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if result == "ok" {
        Ok(())
    } else {
        Err(IndexStoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            Some(result),
        )))
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Create an IndexStore backed by a temporary file.
    fn open_temp_store() -> (IndexStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db_path = dir.path().join("test-volume.db");
        let store = IndexStore::open(&db_path).expect("failed to open store");
        (store, dir)
    }

    pub(crate) fn dir_entry(volume_id: &str, root: &str, path: &str) -> ScannedEntry {
        make_entry(volume_id, root, path, true, None)
    }

    pub(crate) fn file_entry(volume_id: &str, root: &str, path: &str, size: u64) -> ScannedEntry {
        make_entry(volume_id, root, path, false, Some(size))
    }

    fn make_entry(volume_id: &str, root: &str, path: &str, is_directory: bool, size: Option<u64>) -> ScannedEntry {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        ScannedEntry {
            volume_id: volume_id.into(),
            kind: crate::indexing::paths::kind_tag(&name, is_directory),
            name,
            path: path.into(),
            parent_path: crate::indexing::paths::parent_path(path, root),
            is_directory,
            size,
            created_at: Some(1_700_000_000),
            modified_at: Some(1_700_000_000),
            depth: crate::indexing::paths::depth_from_root(path, root),
            inode: None,
            hard_link_count: 1,
            is_hard_link: false,
            hard_link_group: None,
            volume_root: root.into(),
        }
    }

    fn sample_tree() -> Vec<ScannedEntry> {
        vec![
            dir_entry("v1", "A", "A"),
            file_entry("v1", "A", "A/b.txt", 10),
            dir_entry("v1", "A", "A/docs"),
            file_entry("v1", "A", "A/docs/Quarterly Report.pdf", 2048),
        ]
    }

    #[test]
    fn schema_creation_and_version() {
        let (store, _dir) = open_temp_store();
        let status = store.get_index_status().unwrap();
        assert_eq!(status.schema_version.as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn list_children_returns_file_with_size() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::insert_entries_batch(&conn, &sample_tree()[..2]).unwrap();

        let children = store.list_children("v1", "A", 100, 0).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].entry.name, "b.txt");
        assert_eq!(children[0].entry.size, Some(10));
    }

    #[test]
    fn list_children_orders_dirs_first_and_pages() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::insert_entries_batch(&conn, &sample_tree()).unwrap();

        let page = store.list_children("v1", "A", 1, 0).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].entry.name, "docs");
        let page = store.list_children("v1", "A", 1, 1).unwrap();
        assert_eq!(page[0].entry.name, "b.txt");
        assert!(store.list_children("v1", "A", 1, 2).unwrap().is_empty());
    }

    #[test]
    fn duplicate_paths_are_counted_not_inserted() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        let mut entries = sample_tree();
        entries.push(file_entry("v1", "A", "A/b.txt", 99));

        let duplicates = IndexStore::insert_entries_batch(&conn, &entries).unwrap();
        assert_eq!(duplicates, 1);
        let b = store.get_entry_by_path("v1", "A/b.txt").unwrap().unwrap();
        assert_eq!(b.entry.size, Some(10));
    }

    #[test]
    fn replace_entry_tree_swaps_everything() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::insert_entries_batch(&conn, &sample_tree()).unwrap();

        let new_tree = vec![dir_entry("v1", "A", "A"), file_entry("v1", "A", "A/new.txt", 5)];
        IndexStore::replace_entry_tree(&conn, "v1", &new_tree).unwrap();

        let children = store.list_children("v1", "A", 100, 0).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].entry.name, "new.txt");
        assert_eq!(store.entry_count().unwrap(), 2);
        let counts = IndexStore::name_index_counts(&conn).unwrap();
        assert_eq!(counts.drift(), 0);
    }

    #[test]
    fn readers_see_old_or_new_tree_never_a_mix() {
        let (store, _dir) = open_temp_store();
        let writer = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::insert_entries_batch(&writer, &sample_tree()).unwrap();

        // Pin a read snapshot before the replace
        let reader = IndexStore::open_write_connection(store.db_path()).unwrap();
        reader.execute_batch("BEGIN").unwrap();
        let before = IndexStore::get_entry_count(&reader).unwrap();

        let new_tree = vec![dir_entry("v1", "A", "A")];
        IndexStore::replace_entry_tree(&writer, "v1", &new_tree).unwrap();

        // Same snapshot: still the whole old tree
        assert_eq!(IndexStore::get_entry_count(&reader).unwrap(), before);
        reader.execute_batch("COMMIT").unwrap();

        // Fresh snapshot: the whole new tree
        assert_eq!(IndexStore::get_entry_count(&reader).unwrap(), 1);
    }

    #[test]
    fn name_index_follows_insert_rename_delete() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::insert_entries_batch(&conn, &sample_tree()).unwrap();

        let hits = store.search_names("quarterly", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.entry.name, "Quarterly Report.pdf");

        conn.execute("UPDATE entries SET name = 'annual.pdf' WHERE path = 'A/docs/Quarterly Report.pdf'", [])
            .unwrap();
        assert!(store.search_names("quarterly", 10).unwrap().is_empty());
        assert_eq!(store.search_names("annual", 10).unwrap().len(), 1);

        conn.execute("DELETE FROM entries WHERE name = 'annual.pdf'", []).unwrap();
        assert!(store.search_names("annual", 10).unwrap().is_empty());
        assert_eq!(IndexStore::name_index_counts(&conn).unwrap().drift(), 0);
    }

    #[test]
    fn rebuild_name_index_repairs_drift() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::insert_entries_batch(&conn, &sample_tree()).unwrap();
        conn.execute("DELETE FROM entry_names", []).unwrap();
        assert_eq!(IndexStore::name_index_counts(&conn).unwrap().drift(), 4);

        let rebuilt = IndexStore::rebuild_name_index(&conn).unwrap();
        assert_eq!(rebuilt, 4);
        assert_eq!(IndexStore::name_index_counts(&conn).unwrap().drift(), 0);
        assert_eq!(store.search_names("docs", 10).unwrap().len(), 1);
    }

    #[test]
    fn zero_size_is_persisted_explicitly() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::insert_entries_batch(&conn, &sample_tree()).unwrap();

        let docs = store.get_entry_by_path("v1", "A/docs").unwrap().unwrap();
        assert_eq!(docs.entry.size, None);
        IndexStore::update_entry_size(&conn, docs.id, 0).unwrap();
        let docs = store.get_entry_by_path("v1", "A/docs").unwrap().unwrap();
        assert_eq!(docs.entry.size, Some(0));

        assert!(matches!(
            IndexStore::update_entry_size(&conn, 9999, 1),
            Err(IndexStoreError::NotFound(_))
        ));
    }

    #[test]
    fn soft_deleted_entries_are_hidden() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::insert_entries_batch(&conn, &sample_tree()).unwrap();

        IndexStore::mark_entry_deleted(&conn, "v1", "A/b.txt", "missing on disk").unwrap();
        let children = store.list_children("v1", "A", 100, 0).unwrap();
        assert!(children.iter().all(|c| c.entry.name != "b.txt"));
        let b = store.get_entry_by_path("v1", "A/b.txt").unwrap().unwrap();
        assert!(b.is_deleted);
        assert_eq!(b.deleted_reason.as_deref(), Some("missing on disk"));
    }

    #[test]
    fn meta_roundtrip() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        IndexStore::update_meta(&conn, "volume_path", "/mnt/photos").unwrap();
        IndexStore::update_meta(&conn, "scan_duration_ms", "1234").unwrap();

        let status = store.get_index_status().unwrap();
        assert_eq!(status.volume_path.as_deref(), Some("/mnt/photos"));
        assert_eq!(status.scan_duration_ms.as_deref(), Some("1234"));
    }

    #[test]
    fn schema_mismatch_triggers_reset() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("mismatch.db");
        {
            let store = IndexStore::open(&db_path).unwrap();
            let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
            IndexStore::update_meta(&conn, "schema_version", "0").unwrap();
        }

        assert!(matches!(
            IndexStore::open_existing(&db_path),
            Err(IndexStoreError::SchemaMismatch { .. })
        ));
        let store = IndexStore::open(&db_path).unwrap();
        assert_eq!(store.get_index_status().unwrap().schema_version.as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn corruption_recovery_deletes_and_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("corrupt.db");
        std::fs::write(&db_path, b"this is not a sqlite database").unwrap();

        let store = IndexStore::open(&db_path).unwrap();
        assert_eq!(store.get_index_status().unwrap().schema_version.as_deref(), Some(SCHEMA_VERSION));
        store.quick_check().unwrap();
    }

    #[test]
    fn create_new_refuses_existing_file() {
        let (store, _dir) = open_temp_store();
        assert!(IndexStore::create_new(store.db_path()).is_err());
    }

    #[test]
    fn remove_db_files_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        remove_db_files(&dir.path().join("nothing.db")).unwrap();
    }

    #[test]
    fn empty_batch_is_noop() {
        let (store, _dir) = open_temp_store();
        let conn = IndexStore::open_write_connection(store.db_path()).unwrap();
        assert_eq!(IndexStore::insert_entries_batch(&conn, &[]).unwrap(), 0);
    }
}
