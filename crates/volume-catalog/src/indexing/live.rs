//! Handles to the live store of each volume.
//!
//! Readers never hold a store path, only an `Arc<LiveStore>` looked up by volume id.
//! Promotion installs a new handle for the volume and retires the old one; a retired
//! handle refuses further reads, so nothing keeps reading a file that is about to be
//! deleted. Recovery suspends a volume while it puts files back, so no handle gets
//! opened on a half-restored store.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::ignore_poison::IgnorePoison;
use crate::indexing::search;
use crate::indexing::store::{IndexStore, IndexStoreError};
use crate::indexing::volumes::Volume;

// ── LiveStore ────────────────────────────────────────────────────────

pub struct LiveStore {
    volume_id: String,
    db_path: PathBuf,
    /// `None` once retired.
    store: Mutex<Option<IndexStore>>,
}

impl LiveStore {
    fn open(volume_id: &str, db_path: &Path) -> Result<Self, IndexStoreError> {
        let store = IndexStore::open(db_path)?;
        Ok(Self {
            volume_id: volume_id.to_string(),
            db_path: db_path.to_path_buf(),
            store: Mutex::new(Some(store)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` against the store. Fails with `NotFound` after the handle was retired.
    pub fn with_store<T>(&self, f: impl FnOnce(&IndexStore) -> Result<T, IndexStoreError>) -> Result<T, IndexStoreError> {
        let guard = self.store.lock_ignore_poison();
        match guard.as_ref() {
            Some(store) => f(store),
            None => Err(IndexStoreError::NotFound(format!("live store of volume {}", self.volume_id))),
        }
    }

    /// Close the connection for good.
    fn retire(&self) {
        self.store.lock_ignore_poison().take();
    }
}

// ── StoreRegistry ────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    stores: HashMap<String, Arc<LiveStore>>,
    suspended: HashSet<String>,
}

/// Live-store handles keyed by volume id, opened lazily.
pub struct StoreRegistry {
    volumes_dir: PathBuf,
    drift_tolerance: u64,
    state: Mutex<RegistryState>,
}

impl StoreRegistry {
    pub fn new(volumes_dir: &Path, drift_tolerance: u64) -> Self {
        Self {
            volumes_dir: volumes_dir.to_path_buf(),
            drift_tolerance,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn volumes_dir(&self) -> &Path {
        &self.volumes_dir
    }

    pub fn store_path(&self, db_file: &str) -> PathBuf {
        self.volumes_dir.join(db_file)
    }

    /// The handle for `volume`'s store, opening it on first use.
    ///
    /// An existing handle wins over `volume.db_file`: handles only change through
    /// [`install`](Self::install) and [`retire`](Self::retire), so a volume record read
    /// just before a promotion can't reopen the file the promotion deleted.
    pub fn get(&self, volume: &Volume) -> Result<Arc<LiveStore>, IndexStoreError> {
        let mut state = self.state.lock_ignore_poison();
        if state.suspended.contains(&volume.id) {
            return Err(IndexStoreError::NotFound(format!("volume {} is being restored", volume.id)));
        }
        if let Some(existing) = state.stores.get(&volume.id) {
            return Ok(Arc::clone(existing));
        }
        let live = Arc::new(LiveStore::open(&volume.id, &self.store_path(&volume.db_file))?);
        self.check_name_index(&live);
        state.stores.insert(volume.id.clone(), Arc::clone(&live));
        Ok(live)
    }

    /// Point `volume_id` at a freshly promoted file. The previous handle is retired.
    pub fn install(&self, volume_id: &str, db_file: &str) -> Result<Arc<LiveStore>, IndexStoreError> {
        let live = Arc::new(LiveStore::open(volume_id, &self.store_path(db_file))?);
        let previous = self
            .state
            .lock_ignore_poison()
            .stores
            .insert(volume_id.to_string(), Arc::clone(&live));
        if let Some(previous) = previous {
            previous.retire();
        }
        Ok(live)
    }

    /// Close and forget the handle of `volume_id`, if any.
    pub fn retire(&self, volume_id: &str) {
        if let Some(live) = self.state.lock_ignore_poison().stores.remove(volume_id) {
            live.retire();
        }
    }

    /// Retire the handle and refuse to open a new one until [`resume`](Self::resume).
    pub fn suspend(&self, volume_id: &str) {
        let mut state = self.state.lock_ignore_poison();
        state.suspended.insert(volume_id.to_string());
        if let Some(live) = state.stores.remove(volume_id) {
            live.retire();
        }
    }

    pub fn resume(&self, volume_id: &str) {
        self.state.lock_ignore_poison().suspended.remove(volume_id);
    }

    fn check_name_index(&self, live: &LiveStore) {
        let health = live.with_store(|store| search::check_name_index(store, self.drift_tolerance));
        match health {
            Ok(health) if health.needs_rebuild => {
                log::info!(
                    "Search index of {} drifted ({} indexed vs {} live), rebuilding",
                    live.volume_id,
                    health.indexed_rows,
                    health.live_rows
                );
                if let Err(e) = search::spawn_rebuild(&live.db_path, &live.volume_id) {
                    log::warn!("Could not start search index rebuild: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Search index check for {} failed: {e}", live.volume_id),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn volume(db_file: &str) -> Volume {
        Volume {
            id: "v1".into(),
            name: "One".into(),
            root_path: "/r".into(),
            total_capacity: None,
            used_space: None,
            free_space: None,
            format: None,
            added_at: Utc::now(),
            last_synced_at: None,
            is_deleted: false,
            deleted_at: None,
            db_file: db_file.into(),
        }
    }

    #[test]
    fn handles_are_shared_and_outlive_stale_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new(dir.path(), 10);

        let first = registry.get(&volume("vol-v1.db")).unwrap();
        let again = registry.get(&volume("vol-v1.db")).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let stale = registry.get(&volume("vol-v1-other.db")).unwrap();
        assert!(Arc::ptr_eq(&first, &stale));
        assert!(!dir.path().join("vol-v1-other.db").exists());

        registry.retire("v1");
        assert!(matches!(first.with_store(|s| s.entry_count()), Err(IndexStoreError::NotFound(_))));
        let reopened = registry.get(&volume("vol-v1.db")).unwrap();
        assert_eq!(reopened.with_store(|s| s.entry_count()).unwrap(), 0);
    }

    #[test]
    fn install_retires_the_previous_handle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new(dir.path(), 10);
        let old = registry.get(&volume("vol-v1.db")).unwrap();

        let new = registry.install("v1", "vol-v1-shadow.db").unwrap();
        assert_eq!(new.db_path(), dir.path().join("vol-v1-shadow.db"));
        assert!(old.with_store(|s| s.entry_count()).is_err());

        registry.retire("v1");
        assert!(new.with_store(|s| s.entry_count()).is_err());
    }

    #[test]
    fn suspended_volume_cannot_be_opened() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new(dir.path(), 10);
        let live = registry.get(&volume("vol-v1.db")).unwrap();

        registry.suspend("v1");
        assert!(live.with_store(|s| s.entry_count()).is_err());
        assert!(registry.get(&volume("vol-v1.db")).is_err());

        registry.resume("v1");
        assert!(registry.get(&volume("vol-v1.db")).is_ok());
    }
}
