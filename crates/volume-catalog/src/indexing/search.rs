//! Name search across volumes, and search-index health.
//!
//! User queries are turned into FTS5 syntax here. Plain words become prefix terms that
//! must all match. Anything containing characters FTS5 treats specially (quotes,
//! parentheses, `-`, `*`, `.`, `:` and friends) is searched as one literal phrase.

use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::indexing::store::{IndexStore, IndexStoreError, IndexedEntry, NameIndexCounts};

const FTS_KEYWORDS: &[&str] = &["AND", "OR", "NOT", "NEAR"];

// ── Query building ───────────────────────────────────────────────────

/// Convert a user query to an FTS5 match expression. `None` for blank queries.
pub fn build_fts_query(query: &str) -> Option<String> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }
    let needs_phrase = query
        .chars()
        .any(|c| !(c.is_alphanumeric() || c == '_' || c.is_whitespace() || !c.is_ascii()));
    if needs_phrase {
        return Some(format!("\"{}\"", query.replace('"', "\"\"")));
    }

    let terms: Vec<String> = query
        .split_whitespace()
        .map(|word| {
            if FTS_KEYWORDS.contains(&word) {
                format!("\"{word}\"*")
            } else {
                format!("{word}*")
            }
        })
        .collect();
    Some(terms.join(" "))
}

// ── Results ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub volume_id: String,
    pub volume_name: String,
    pub entry: IndexedEntry,
    /// bm25 score; lower is a better match.
    pub rank: f64,
}

/// Merge per-volume result lists into one list ordered by rank.
pub fn merge_ranked(per_volume: Vec<Vec<SearchHit>>, limit: usize) -> Vec<SearchHit> {
    let mut all: Vec<SearchHit> = per_volume.into_iter().flatten().collect();
    all.sort_by(|a, b| {
        a.rank
            .total_cmp(&b.rank)
            .then_with(|| a.entry.entry.path.cmp(&b.entry.entry.path))
    });
    all.truncate(limit);
    all
}

// ── Index health ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexHealth {
    pub live_rows: u64,
    pub indexed_rows: u64,
    pub needs_rebuild: bool,
}

impl IndexHealth {
    fn from_counts(counts: NameIndexCounts, tolerance: u64) -> Self {
        Self {
            live_rows: counts.live_rows,
            indexed_rows: counts.indexed_rows,
            needs_rebuild: counts.drift() > tolerance,
        }
    }
}

pub fn check_name_index(store: &IndexStore, tolerance: u64) -> Result<IndexHealth, IndexStoreError> {
    let counts = IndexStore::name_index_counts(store.connection())?;
    Ok(IndexHealth::from_counts(counts, tolerance))
}

/// Rebuild a store's name index on a background thread with its own connection.
pub fn spawn_rebuild(db_path: &Path, volume_id: &str) -> Result<thread::JoinHandle<()>, IndexStoreError> {
    let db_path: PathBuf = db_path.to_path_buf();
    let volume_id = volume_id.to_string();
    thread::Builder::new()
        .name("index-rebuild".into())
        .spawn(move || {
            let result = IndexStore::open_write_connection(&db_path).and_then(|conn| IndexStore::rebuild_name_index(&conn));
            match result {
                Ok(rows) => log::info!("Search index for {volume_id} rebuilt ({rows} rows)"),
                Err(e) => log::warn!("Search index rebuild for {volume_id} failed: {e}"),
            }
        })
        .map_err(IndexStoreError::Io)
}

// ── Tests ────────────────────────────────────────────────────────────
