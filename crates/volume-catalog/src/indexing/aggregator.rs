//! On-demand directory sizes.
//!
//! Scans leave directory sizes unknown. When a directory's size is asked for, it is summed
//! from the files below it (soft-deleted entries excluded, each hard-link group counted
//! once), persisted on the directory's row, and remembered in a bounded FIFO cache.
//!
//! The cache is keyed by `(volume id, normalized path)`. Concurrent computations of the
//! same directory are harmless: both produce the same value and the last write wins.

use std::collections::{HashMap, VecDeque};

use rusqlite::{Connection, params};

use crate::indexing::paths;
use crate::indexing::store::{IndexStore, IndexStoreError};

// ── Size computation ─────────────────────────────────────────────────

/// Sum of file sizes strictly below `dir` in one volume.
///
/// Files without a known size count as zero. Hard-link groups contribute one member.
pub fn compute_directory_size(conn: &Connection, volume_id: &str, dir: &str) -> Result<u64, IndexStoreError> {
    let (lower, upper) = paths::descendants_range(dir);
    let mut stmt = conn.prepare_cached(
        "SELECT COALESCE(SUM(size), 0) FROM (
             SELECT size FROM entries
             WHERE volume_id = ?1 AND path >= ?2 AND path < ?3
               AND is_directory = 0 AND is_deleted = 0 AND hard_link_group IS NULL
             UNION ALL
             SELECT MAX(size) FROM entries
             WHERE volume_id = ?1 AND path >= ?2 AND path < ?3
               AND is_directory = 0 AND is_deleted = 0 AND hard_link_group IS NOT NULL
             GROUP BY hard_link_group
         )",
    )?;
    let total: i64 = stmt.query_row(params![volume_id, lower, upper], |row| row.get(0))?;
    Ok(total.max(0) as u64)
}

/// Compute a directory's size and store it on its row. Zero is stored as zero.
///
/// Returns `NotFound` if no live directory entry exists at `dir`.
pub fn compute_and_persist(conn: &Connection, volume_id: &str, dir: &str) -> Result<u64, IndexStoreError> {
    let entry = IndexStore::entry_by_path(conn, volume_id, dir)?
        .filter(|e| e.entry.is_directory && !e.is_deleted)
        .ok_or_else(|| IndexStoreError::NotFound(dir.to_string()))?;
    let size = compute_directory_size(conn, volume_id, dir)?;
    IndexStore::update_entry_size(conn, entry.id, size)?;
    Ok(size)
}

// ── Size cache ───────────────────────────────────────────────────────

/// Bounded map of computed directory sizes, evicting the oldest insertion first.
#[derive(Debug)]
pub struct DirSizeCache {
    capacity: usize,
    sizes: HashMap<(String, String), u64>,
    order: VecDeque<(String, String)>,
}

impl DirSizeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sizes: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, volume_id: &str, path: &str) -> Option<u64> {
        self.sizes
            .get(&(volume_id.to_string(), paths::normalize_path(path)))
            .copied()
    }

    /// Insert or overwrite. Overwriting keeps the entry's original eviction slot.
    pub fn insert(&mut self, volume_id: &str, path: &str, size: u64) {
        let key = (volume_id.to_string(), paths::normalize_path(path));
        if let Some(existing) = self.sizes.get_mut(&key) {
            *existing = size;
            return;
        }
        while self.sizes.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.sizes.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.sizes.insert(key, size);
    }

    /// Drop every cached size of one volume (after its tree was replaced).
    pub fn invalidate_volume(&mut self, volume_id: &str) {
        self.sizes.retain(|(v, _), _| v != volume_id);
        self.order.retain(|(v, _)| v != volume_id);
    }

    /// Drop a directory and all its ancestors in one volume (after a size change below them).
    pub fn invalidate_path(&mut self, volume_id: &str, path: &str) {
        let path = paths::normalize_path(path);
        self.sizes
            .retain(|(v, p), _| v != volume_id || !paths::is_same_or_child(&path, p));
        self.order
            .retain(|(v, p)| v != volume_id || !paths::is_same_or_child(&path, p));
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::store::tests::{dir_entry, file_entry};

    fn setup() -> (IndexStore, Connection, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("agg.db");
        let store = IndexStore::open(&db_path).unwrap();
        let conn = IndexStore::open_write_connection(&db_path).unwrap();
        let mut linked_a = file_entry("v1", "/r", "/r/a/linked", 500);
        linked_a.hard_link_group = Some("hl-1-2".into());
        linked_a.is_hard_link = true;
        let mut linked_b = file_entry("v1", "/r", "/r/b/linked", 500);
        linked_b.hard_link_group = Some("hl-1-2".into());
        linked_b.is_hard_link = true;
        let entries = vec![
            dir_entry("v1", "/r", "/r"),
            dir_entry("v1", "/r", "/r/a"),
            file_entry("v1", "/r", "/r/a/one", 10),
            file_entry("v1", "/r", "/r/a/two", 20),
            linked_a,
            dir_entry("v1", "/r", "/r/b"),
            linked_b,
            dir_entry("v1", "/r", "/r/empty"),
            dir_entry("v1", "/r", "/r/a_b"),
            file_entry("v1", "/r", "/r/a_b/other", 1000),
        ];
        IndexStore::insert_entries_batch(&conn, &entries).unwrap();
        (store, conn, dir)
    }

    #[test]
    fn sums_descendants_and_counts_hard_links_once() {
        let (_store, conn, _dir) = setup();
        assert_eq!(compute_directory_size(&conn, "v1", "/r/a").unwrap(), 530);
        assert_eq!(compute_directory_size(&conn, "v1", "/r/b").unwrap(), 500);
        // Both links live under /r, so the group counts once
        assert_eq!(compute_directory_size(&conn, "v1", "/r").unwrap(), 1530);
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_a_descendant() {
        let (_store, conn, _dir) = setup();
        assert_eq!(compute_directory_size(&conn, "v1", "/r/a_b").unwrap(), 1000);
        assert_eq!(compute_directory_size(&conn, "v1", "/r/a").unwrap(), 530);
    }

    #[test]
    fn soft_deleted_files_do_not_count() {
        let (_store, conn, _dir) = setup();
        IndexStore::mark_entry_deleted(&conn, "v1", "/r/a/two", "gone").unwrap();
        assert_eq!(compute_directory_size(&conn, "v1", "/r/a").unwrap(), 510);
    }

    #[test]
    fn empty_directory_persists_zero() {
        let (store, conn, _dir) = setup();
        assert_eq!(compute_and_persist(&conn, "v1", "/r/empty").unwrap(), 0);
        let empty = store.get_entry_by_path("v1", "/r/empty").unwrap().unwrap();
        assert_eq!(empty.entry.size, Some(0));

        assert!(matches!(
            compute_and_persist(&conn, "v1", "/r/a/one"),
            Err(IndexStoreError::NotFound(_))
        ));
    }

    #[test]
    fn cache_evicts_oldest_first() {
        let mut cache = DirSizeCache::new(2);
        cache.insert("v1", "/a", 1);
        cache.insert("v1", "/b", 2);
        cache.insert("v1", "/a/", 10);
        assert_eq!(cache.get("v1", "/a"), Some(10));
        cache.insert("v1", "/c", 3);
        assert_eq!(cache.get("v1", "/a"), None);
        assert_eq!(cache.get("v1", "/b"), Some(2));
        assert_eq!(cache.get("v1", "/c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cache_is_scoped_per_volume() {
        let mut cache = DirSizeCache::new(10);
        cache.insert("v1", "/mnt/x", 1);
        cache.insert("v2", "/mnt/x", 2);
        cache.insert("v1", "/mnt/x/sub", 3);
        cache.insert("v1", "/mnt/y", 4);

        cache.invalidate_path("v1", "/mnt/x/sub/file");
        assert_eq!(cache.get("v1", "/mnt/x"), None);
        assert_eq!(cache.get("v1", "/mnt/x/sub"), None);
        assert_eq!(cache.get("v1", "/mnt/y"), Some(4));
        assert_eq!(cache.get("v2", "/mnt/x"), Some(2));

        cache.invalidate_volume("v2");
        assert_eq!(cache.get("v2", "/mnt/x"), None);
        assert_eq!(cache.len(), 1);
    }
}
