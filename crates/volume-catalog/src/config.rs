//! Catalog configuration.
//!
//! Read from `catalog-config.json` in the data directory. Every field has a
//! default, so a partial (or missing) file is fine. Keys are accepted in both
//! snake_case and camelCase.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// File name of the config file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "catalog-config.json";

/// Directory names (and absolute prefixes) whose errors are expected noise on
/// real volumes: OS bookkeeping folders we usually can't read anyway.
const DEFAULT_NOISE_DIRS: &[&str] = &[
    ".Spotlight-V100",
    ".fseventsd",
    ".Trashes",
    ".TemporaryItems",
    ".DocumentRevisions-V100",
    "System Volume Information",
    "$RECYCLE.BIN",
    "lost+found",
    "/proc",
    "/dev",
    "/sys",
];

/// Tunables for scanning, streaming, scheduling, and the stores.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Children listed per chunk when reading a directory.
    #[serde(alias = "scanBatchSize")]
    pub scan_batch_size: usize,
    /// Hard recursion ceiling (depth from the volume root).
    #[serde(alias = "maxDepth")]
    pub max_depth: usize,
    /// Entries per batch handed to the writer.
    #[serde(alias = "streamChunkSize")]
    pub stream_chunk_size: usize,
    /// Resident memory above which the streaming processor applies back-pressure.
    #[serde(alias = "memoryThresholdBytes")]
    pub memory_threshold_bytes: u64,
    /// Emit a rate-aware progress event every N files.
    #[serde(alias = "progressIntervalFiles")]
    pub progress_interval_files: u64,
    /// Wall-clock ceiling for a whole scan.
    #[serde(alias = "scanTimeoutSecs")]
    pub scan_timeout_secs: u64,
    /// How long a finished scan's state stays readable.
    #[serde(alias = "stateRetentionMs")]
    pub state_retention_ms: u64,
    /// Max directories kept in the in-memory size cache.
    #[serde(alias = "sizeCacheCapacity")]
    pub size_cache_capacity: usize,
    /// Allowed difference between search-index rows and live rows before a rebuild.
    #[serde(alias = "indexDriftTolerance")]
    pub index_drift_tolerance: u64,
    /// Run a fast parallel pre-count so progress events carry a total.
    #[serde(alias = "estimateTotals")]
    pub estimate_totals: bool,
    /// Max error samples kept per scan (the count is always exact).
    #[serde(alias = "errorSampleLimit")]
    pub error_sample_limit: usize,
    /// System-noise directories. Errors inside these are ignored, not counted.
    #[serde(alias = "noiseDirs")]
    pub noise_dirs: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: 3000,
            max_depth: 100,
            stream_chunk_size: 1000,
            memory_threshold_bytes: 800 * 1024 * 1024,
            progress_interval_files: 1000,
            scan_timeout_secs: 30 * 60,
            state_retention_ms: 5000,
            size_cache_capacity: 10_000,
            index_drift_tolerance: 10,
            estimate_totals: true,
            error_sample_limit: 500,
            noise_dirs: DEFAULT_NOISE_DIRS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl CatalogConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn state_retention(&self) -> Duration {
        Duration::from_millis(self.state_retention_ms)
    }
}

/// Loads the config from `path`.
/// Returns defaults if the file doesn't exist or can't be parsed.
pub fn load_config(path: &Path) -> CatalogConfig {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Could not read config at {}: {e}, using defaults", path.display());
            }
            return CatalogConfig::default();
        }
    };

    match serde_json::from_str::<CatalogConfig>(&contents) {
        Ok(config) => config.sanitized(),
        Err(e) => {
            log::warn!("Invalid config at {}: {e}, using defaults", path.display());
            CatalogConfig::default()
        }
    }
}

impl CatalogConfig {
    /// Clamp zero sizes that would stall the pipeline.
    fn sanitized(mut self) -> Self {
        let defaults = CatalogConfig::default();
        if self.scan_batch_size == 0 {
            self.scan_batch_size = defaults.scan_batch_size;
        }
        if self.stream_chunk_size == 0 {
            self.stream_chunk_size = defaults.stream_chunk_size;
        }
        if self.progress_interval_files == 0 {
            self.progress_interval_files = defaults.progress_interval_files;
        }
        if self.size_cache_capacity == 0 {
            self.size_cache_capacity = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join(CONFIG_FILE_NAME));
        assert_eq!(config.scan_batch_size, 3000);
        assert_eq!(config.max_depth, 100);
        assert_eq!(config.scan_timeout(), Duration::from_secs(1800));
        assert!(config.noise_dirs.iter().any(|d| d == ".Spotlight-V100"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{"streamChunkSize": 50, "max_depth": 8}"#).unwrap();

        let config = load_config(&path);
        assert_eq!(config.stream_chunk_size, 50);
        assert_eq!(config.max_depth, 8);
        assert_eq!(config.memory_threshold_bytes, 800 * 1024 * 1024);
    }

    #[test]
    fn garbage_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "not json").unwrap();

        let config = load_config(&path);
        assert_eq!(config.stream_chunk_size, 1000);
    }

    #[test]
    fn zero_chunk_sizes_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{"scanBatchSize": 0, "streamChunkSize": 0}"#).unwrap();

        let config = load_config(&path);
        assert_eq!(config.scan_batch_size, 3000);
        assert_eq!(config.stream_chunk_size, 1000);
    }
}
