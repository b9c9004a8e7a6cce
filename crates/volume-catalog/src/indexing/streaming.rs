//! Memory-bounded buffer between the scanner and a store's writer thread.
//!
//! Entries collect in a chunk. A full chunk is announced to the listener, handed to the
//! writer, and dropped. If resident memory is above the threshold after a flush, the
//! processor waits for the writer to catch up and asks SQLite to release its cache
//! before taking more entries.
//!
//! Once cancellation is observed both [`StreamingProcessor::process_file`] and
//! [`StreamingProcessor::finalize`] return immediately without writing anything more.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::config::CatalogConfig;
use crate::indexing::cancel::CancellationToken;
use crate::indexing::paths::normalize_path;
use crate::indexing::progress::{ProgressEvent, ProgressKind, ProgressListener};
use crate::indexing::scanner::{EntrySink, ScanError, ScanOptions, ScanProgress, ScanSummary, estimate_total, scan_tree};
use crate::indexing::store::{IndexStoreError, ScannedEntry};
use crate::indexing::writer::{FlushReport, IndexWriter, WriteMessage};

// ── Memory probe ─────────────────────────────────────────────────────

/// Resident memory of the current process.
pub struct MemoryProbe {
    system: System,
    pid: Option<Pid>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::debug!("Memory probe unavailable: {e}");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    pub fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|p| p.memory())
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

// ── Processor ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamingOptions {
    pub chunk_size: usize,
    pub memory_threshold_bytes: u64,
    pub progress_interval_files: u64,
}

impl StreamingOptions {
    pub fn from_config(config: &CatalogConfig) -> Self {
        Self {
            chunk_size: config.stream_chunk_size.max(1),
            memory_threshold_bytes: config.memory_threshold_bytes,
            progress_interval_files: config.progress_interval_files.max(1),
        }
    }
}

/// What `finalize` hands back.
#[derive(Debug, Default)]
pub struct StreamingOutcome {
    pub written: FlushReport,
    pub batches: u64,
    /// Flushes that hit the memory threshold.
    pub pressure_flushes: u64,
    /// `true` if cancellation was seen, in which case nothing else is meaningful.
    pub cancelled: bool,
}

pub struct StreamingProcessor {
    volume_id: String,
    options: StreamingOptions,
    writer: IndexWriter,
    listener: Arc<dyn ProgressListener>,
    cancel: CancellationToken,
    scan_progress: Arc<ScanProgress>,
    memory: MemoryProbe,
    chunk: Vec<ScannedEntry>,
    processed: u64,
    batches: u64,
    pressure_flushes: u64,
    started: Instant,
}

impl StreamingProcessor {
    pub fn new(
        volume_id: &str,
        options: StreamingOptions,
        writer: IndexWriter,
        listener: Arc<dyn ProgressListener>,
        cancel: CancellationToken,
        scan_progress: Arc<ScanProgress>,
    ) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            chunk: Vec::with_capacity(options.chunk_size),
            options,
            writer,
            listener,
            cancel,
            scan_progress,
            memory: MemoryProbe::new(),
            processed: 0,
            batches: 0,
            pressure_flushes: 0,
            started: Instant::now(),
        }
    }

    /// Buffer one entry, flushing when the chunk is full.
    pub fn process_file(&mut self, entry: ScannedEntry) -> Result<(), IndexStoreError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.chunk.push(entry);
        self.processed += 1;

        if self.processed % self.options.progress_interval_files == 0 {
            self.report_rate();
        }
        if self.chunk.len() >= self.options.chunk_size {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.flush_chunk()?;
        }
        Ok(())
    }

    /// Flush what is left and wait for the writer to persist everything.
    pub fn finalize(mut self) -> Result<StreamingOutcome, IndexStoreError> {
        if self.cancel.is_cancelled() {
            return Ok(StreamingOutcome {
                cancelled: true,
                ..StreamingOutcome::default()
            });
        }
        self.flush_chunk()?;
        let written = self.writer.flush()?;
        log::debug!(
            "Streaming: {} entries in {} batches for {} ({} duplicates)",
            self.processed,
            self.batches,
            self.volume_id,
            written.duplicates
        );
        Ok(StreamingOutcome {
            written,
            batches: self.batches,
            pressure_flushes: self.pressure_flushes,
            cancelled: false,
        })
    }

    fn flush_chunk(&mut self) -> Result<(), IndexStoreError> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.chunk, Vec::with_capacity(self.options.chunk_size));
        self.batches += 1;

        let snap = self.scan_progress.snapshot();
        self.listener.on_event(
            ProgressEvent::new(
                ProgressKind::Batch,
                &self.volume_id,
                format!("Writing batch {} ({} entries)", self.batches, batch.len()),
            )
            .counts(self.processed, snap.total, snap.errors),
        );

        self.writer.send(WriteMessage::InsertEntries(batch))?;
        self.relieve_memory_pressure()
    }

    fn relieve_memory_pressure(&mut self) -> Result<(), IndexStoreError> {
        let Some(resident) = self.memory.resident_bytes() else {
            return Ok(());
        };
        if resident <= self.options.memory_threshold_bytes {
            return Ok(());
        }
        self.pressure_flushes += 1;
        log::debug!(
            "Streaming: resident memory {resident} above {}, waiting for writer",
            self.options.memory_threshold_bytes
        );
        self.writer.flush()?;
        self.writer.send(WriteMessage::ReleaseMemory)?;
        Ok(())
    }

    fn report_rate(&self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { self.processed as f64 / elapsed } else { 0.0 };
        let snap = self.scan_progress.snapshot();
        let mut event = ProgressEvent::new(
            ProgressKind::StreamingProgress,
            &self.volume_id,
            format!("{rate:.0} files/s in {}", snap.current_dir),
        )
        .counts(self.processed, snap.total, snap.errors);
        event.rate = Some(rate);
        self.listener.on_event(event);
    }
}

impl EntrySink for StreamingProcessor {
    fn accept(&mut self, entry: ScannedEntry) -> Result<(), ScanError> {
        self.process_file(entry).map_err(ScanError::Store)
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// A finished scanner -> processor -> writer run.
#[derive(Debug)]
pub struct PipelineRun {
    pub summary: ScanSummary,
    pub outcome: StreamingOutcome,
}

/// Walk `root` and stream every entry into the store at `db_path`.
///
/// The store's meta is stamped with the volume id and root before the first batch, so a
/// store left behind by a cancelled scan still says what it belongs to.
///
/// Spawns a writer thread for the store and shuts it down before returning, so the
/// caller can open its own connection right away. On error or cancellation, batches
/// already handed to the writer are still persisted; whether to keep them is up to the
/// caller.
pub fn stream_scan(
    root: &Path,
    volume_id: &str,
    db_path: &Path,
    config: &CatalogConfig,
    listener: Arc<dyn ProgressListener>,
    cancel: &CancellationToken,
    progress: &Arc<ScanProgress>,
) -> Result<PipelineRun, ScanError> {
    let writer = IndexWriter::spawn(db_path)?;
    let stamp = [
        ("volume_id", volume_id.to_string()),
        ("volume_path", normalize_path(&root.to_string_lossy())),
    ];
    for (key, value) in stamp {
        if let Err(e) = writer.send(WriteMessage::UpdateMeta { key: key.to_string(), value }) {
            writer.shutdown();
            return Err(e.into());
        }
    }
    if config.estimate_totals {
        spawn_estimate(root, config.max_depth, cancel, progress);
    }

    let mut processor = StreamingProcessor::new(
        volume_id,
        StreamingOptions::from_config(config),
        writer.clone(),
        listener,
        cancel.clone(),
        Arc::clone(progress),
    );
    let result = scan_tree(root, volume_id, &ScanOptions::from_config(config), cancel, progress, &mut processor)
        .and_then(|summary| {
            let outcome = processor.finalize()?;
            if outcome.cancelled {
                return Err(ScanError::Cancelled);
            }
            Ok(PipelineRun { summary, outcome })
        });
    writer.shutdown();
    result
}

/// Fill in the progress total from a parallel pre-count, without holding up the scan.
fn spawn_estimate(root: &Path, max_depth: usize, cancel: &CancellationToken, progress: &Arc<ScanProgress>) {
    let root = root.to_path_buf();
    let cancel = cancel.clone();
    let progress = Arc::clone(progress);
    let spawned = thread::Builder::new().name("scan-estimate".into()).spawn(move || {
        if let Some(total) = estimate_total(&root, max_depth, &cancel) {
            progress.set_total(total);
        }
    });
    if let Err(e) = spawned {
        log::warn!("Could not start the pre-count thread: {e}");
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::indexing::store::IndexStore;
    use crate::indexing::store::tests::file_entry;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressListener for Recorder {
        fn on_event(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db_path: std::path::PathBuf,
        writer: IndexWriter,
        recorder: Arc<Recorder>,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("stream.db");
        IndexStore::open(&db_path).unwrap();
        let writer = IndexWriter::spawn(&db_path).unwrap();
        Fixture {
            _dir: dir,
            db_path,
            writer,
            recorder: Arc::new(Recorder::default()),
            cancel: CancellationToken::new(),
        }
    }

    fn processor(f: &Fixture, options: StreamingOptions) -> StreamingProcessor {
        StreamingProcessor::new(
            "v1",
            options,
            f.writer.clone(),
            f.recorder.clone(),
            f.cancel.clone(),
            Arc::new(ScanProgress::new()),
        )
    }

    fn options(chunk_size: usize) -> StreamingOptions {
        StreamingOptions {
            chunk_size,
            memory_threshold_bytes: u64::MAX,
            progress_interval_files: 1000,
        }
    }

    fn entries(n: u64) -> Vec<ScannedEntry> {
        (0..n).map(|i| file_entry("v1", "/r", &format!("/r/f{i}"), i)).collect()
    }

    #[test]
    fn flushes_full_chunks_and_the_remainder() {
        let f = fixture();
        let mut p = processor(&f, options(4));
        for e in entries(10) {
            p.process_file(e).unwrap();
        }
        let outcome = p.finalize().unwrap();
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.written.inserted, 10);

        let batches = f.recorder.0.lock().unwrap().iter().filter(|e| e.kind == ProgressKind::Batch).count();
        assert_eq!(batches, 3);

        let store = IndexStore::open(&f.db_path).unwrap();
        assert_eq!(store.entry_count().unwrap(), 10);
        assert!(store.get_entry_by_path("v1", "/r/f9").unwrap().is_some());
        f.writer.shutdown();
    }

    #[test]
    fn cancelled_processor_stops_writing() {
        let f = fixture();
        let mut p = processor(&f, options(2));
        for e in entries(4) {
            p.process_file(e).unwrap();
        }
        f.cancel.cancel();
        for e in entries(8).into_iter().skip(4) {
            p.process_file(e).unwrap();
        }
        let outcome = p.finalize().unwrap();
        assert!(outcome.cancelled);

        f.writer.flush().unwrap();
        let store = IndexStore::open(&f.db_path).unwrap();
        assert_eq!(store.entry_count().unwrap(), 4);
        f.writer.shutdown();
    }

    #[test]
    fn memory_pressure_waits_for_the_writer() {
        let f = fixture();
        let mut opts = options(2);
        opts.memory_threshold_bytes = 0;
        let mut p = processor(&f, opts);
        for e in entries(6) {
            p.process_file(e).unwrap();
        }
        let outcome = p.finalize().unwrap();
        assert_eq!(outcome.written.inserted, 6);
        // The probe may be unavailable on exotic platforms; when it works every flush is over 0 bytes
        if MemoryProbe::new().resident_bytes().is_some() {
            assert_eq!(outcome.pressure_flushes, 3);
        }
        f.writer.shutdown();
    }

    #[test]
    fn rate_events_are_periodic_not_per_item() {
        let f = fixture();
        let mut opts = options(100);
        opts.progress_interval_files = 5;
        let mut p = processor(&f, opts);
        for e in entries(12) {
            p.process_file(e).unwrap();
        }
        p.finalize().unwrap();

        let events = f.recorder.0.lock().unwrap();
        let rate_events: Vec<_> = events.iter().filter(|e| e.kind == ProgressKind::StreamingProgress).collect();
        assert_eq!(rate_events.len(), 2);
        assert_eq!(rate_events[1].processed, 10);
        assert!(rate_events[0].rate.is_some());
        f.writer.shutdown();
    }

    #[test]
    fn pipeline_streams_a_real_tree_into_the_store() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::create_dir(tree.path().join("A")).unwrap();
        std::fs::write(tree.path().join("A/b.txt"), b"0123456789").unwrap();
        std::fs::write(tree.path().join("top.txt"), b"x").unwrap();

        let f = fixture();
        f.writer.shutdown();
        let config = CatalogConfig {
            stream_chunk_size: 2,
            estimate_totals: false,
            ..CatalogConfig::default()
        };
        let progress = Arc::new(ScanProgress::new());
        let run = stream_scan(tree.path(), "v1", &f.db_path, &config, f.recorder.clone(), &f.cancel, &progress).unwrap();

        assert_eq!(run.summary.total_entries, 4);
        assert_eq!(run.summary.total_bytes, 11);
        assert_eq!(run.outcome.written.inserted, 4);
        assert_eq!(run.outcome.batches, 2);
        let store = IndexStore::open(&f.db_path).unwrap();
        assert_eq!(store.entry_count().unwrap(), 4);
        let status = store.get_index_status().unwrap();
        assert_eq!(status.volume_id.as_deref(), Some("v1"));
        assert_eq!(
            status.volume_path,
            Some(normalize_path(&tree.path().to_string_lossy()))
        );
        assert_eq!(status.scan_completed_at, None);
    }

    #[test]
    fn pipeline_reports_cancellation() {
        let tree = tempfile::tempdir().unwrap();
        std::fs::write(tree.path().join("a.txt"), b"a").unwrap();

        let f = fixture();
        f.writer.shutdown();
        f.cancel.cancel();
        let progress = Arc::new(ScanProgress::new());
        let result = stream_scan(
            tree.path(),
            "v1",
            &f.db_path,
            &CatalogConfig::default(),
            f.recorder.clone(),
            &f.cancel,
            &progress,
        );
        assert!(matches!(result, Err(ScanError::Cancelled)));
    }
}
