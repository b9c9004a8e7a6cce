//! Post-scan consistency checks.
//!
//! Findings are warnings: they are logged and attached to the scan result, and never
//! stop a scan from completing.

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::indexing::aggregator;
use crate::indexing::store::IndexStoreError;

/// How many offending paths are kept per finding.
const SAMPLE_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ValidationWarning {
    /// Paths the walk produced more than once; only the first copy was stored.
    DuplicatePaths { count: u64 },
    /// Entries whose parent path has no entry.
    OrphanedEntries { count: u64, samples: Vec<String> },
    /// A directory whose stored size disagrees with its recomputed size.
    SizeMismatch { path: String, recorded: u64, computed: u64 },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::DuplicatePaths { count } => write!(f, "{count} duplicate paths skipped"),
            ValidationWarning::OrphanedEntries { count, samples } => {
                write!(f, "{count} entries without a parent (e.g. {})", samples.join(", "))
            }
            ValidationWarning::SizeMismatch {
                path,
                recorded,
                computed,
            } => write!(f, "size of {path} is {recorded}, recomputed {computed}"),
        }
    }
}

/// Inputs the scan already knows.
pub struct ValidationInput<'a> {
    pub volume_id: &'a str,
    pub root_path: &'a str,
    pub duplicates: u64,
    /// The scanner's own byte total for the root (hard links counted once).
    pub scanned_bytes: Option<u64>,
}

/// Run every check against the store the scan wrote into.
pub fn validate(conn: &Connection, input: &ValidationInput<'_>) -> Result<Vec<ValidationWarning>, IndexStoreError> {
    let mut warnings = Vec::new();

    if input.duplicates > 0 {
        warnings.push(ValidationWarning::DuplicatePaths {
            count: input.duplicates,
        });
    }

    let (orphans, samples) = find_orphans(conn, input.volume_id)?;
    if orphans > 0 {
        warnings.push(ValidationWarning::OrphanedEntries { count: orphans, samples });
    }

    if let Some(scanned) = input.scanned_bytes {
        let computed = aggregator::compute_directory_size(conn, input.volume_id, input.root_path)?;
        if computed != scanned {
            warnings.push(ValidationWarning::SizeMismatch {
                path: input.root_path.to_string(),
                recorded: scanned,
                computed,
            });
        }
    }
    warnings.extend(find_stale_directory_sizes(conn, input.volume_id)?);

    for warning in &warnings {
        log::warn!("Validation [{}]: {warning}", input.volume_id);
    }
    Ok(warnings)
}

fn find_orphans(conn: &Connection, volume_id: &str) -> Result<(u64, Vec<String>), IndexStoreError> {
    const ORPHAN_FILTER: &str = "FROM entries e
         WHERE e.volume_id = ?1 AND e.parent_path IS NOT NULL
           AND NOT EXISTS (SELECT 1 FROM entries p WHERE p.volume_id = e.volume_id AND p.path = e.parent_path)";

    let count: u64 = conn.query_row(&format!("SELECT COUNT(*) {ORPHAN_FILTER}"), params![volume_id], |row| {
        row.get(0)
    })?;
    if count == 0 {
        return Ok((0, Vec::new()));
    }
    let mut stmt = conn.prepare(&format!("SELECT e.path {ORPHAN_FILTER} ORDER BY e.path LIMIT ?2"))?;
    let samples = stmt
        .query_map(params![volume_id, SAMPLE_LIMIT], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((count, samples))
}

/// Directories with a stored size that no longer matches their contents.
fn find_stale_directory_sizes(conn: &Connection, volume_id: &str) -> Result<Vec<ValidationWarning>, IndexStoreError> {
    let mut stmt = conn.prepare(
        "SELECT path, size FROM entries
         WHERE volume_id = ?1 AND is_directory = 1 AND is_deleted = 0 AND size IS NOT NULL
         LIMIT ?2",
    )?;
    let sized: Vec<(String, u64)> = stmt
        .query_map(params![volume_id, SAMPLE_LIMIT], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    let mut warnings = Vec::new();
    for (path, recorded) in sized {
        let computed = aggregator::compute_directory_size(conn, volume_id, &path)?;
        if computed != recorded {
            warnings.push(ValidationWarning::SizeMismatch {
                path,
                recorded,
                computed,
            });
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::store::IndexStore;
    use crate::indexing::store::tests::{dir_entry, file_entry};

    fn setup(entries: &[crate::indexing::store::ScannedEntry]) -> (Connection, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("validate.db");
        IndexStore::open(&db_path).unwrap();
        let conn = IndexStore::open_write_connection(&db_path).unwrap();
        IndexStore::insert_entries_batch(&conn, entries).unwrap();
        (conn, dir)
    }

    fn input(duplicates: u64, scanned_bytes: Option<u64>) -> ValidationInput<'static> {
        ValidationInput {
            volume_id: "v1",
            root_path: "/r",
            duplicates,
            scanned_bytes,
        }
    }

    #[test]
    fn clean_tree_has_no_warnings() {
        let (conn, _dir) = setup(&[dir_entry("v1", "/r", "/r"), file_entry("v1", "/r", "/r/f", 5)]);
        assert!(validate(&conn, &input(0, Some(5))).unwrap().is_empty());
    }

    #[test]
    fn reports_duplicates_orphans_and_size_mismatch() {
        let (conn, _dir) = setup(&[
            dir_entry("v1", "/r", "/r"),
            file_entry("v1", "/r", "/r/f", 5),
            file_entry("v1", "/r", "/r/missing/child", 7),
        ]);
        let warnings = validate(&conn, &input(2, Some(5))).unwrap();

        assert!(warnings.contains(&ValidationWarning::DuplicatePaths { count: 2 }));
        assert!(warnings.contains(&ValidationWarning::OrphanedEntries {
            count: 1,
            samples: vec!["/r/missing/child".into()],
        }));
        assert!(warnings.contains(&ValidationWarning::SizeMismatch {
            path: "/r".into(),
            recorded: 5,
            computed: 12,
        }));
    }

    #[test]
    fn stale_stored_directory_size_is_reported() {
        let (conn, _dir) = setup(&[dir_entry("v1", "/r", "/r"), file_entry("v1", "/r", "/r/f", 5)]);
        conn.execute("UPDATE entries SET size = 99 WHERE path = '/r'", []).unwrap();
        let warnings = validate(&conn, &input(0, None)).unwrap();
        assert_eq!(
            warnings,
            vec![ValidationWarning::SizeMismatch {
                path: "/r".into(),
                recorded: 99,
                computed: 5,
            }]
        );
    }
}
