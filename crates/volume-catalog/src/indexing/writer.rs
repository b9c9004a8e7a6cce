//! Single-writer thread for one volume store.
//!
//! Every bulk write to a store (live for a new volume, shadow during a sync) goes through
//! a dedicated `std::thread` that owns the write connection. Batches arrive in the order
//! the scanner produced them. The channel is bounded, so a slow disk slows the scan down
//! instead of piling batches up in memory. Reads happen on separate connections (WAL mode).

use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;

use crate::ignore_poison::IgnorePoison;
use crate::indexing::store::{IndexStore, IndexStoreError, ScannedEntry};

/// Batches that may queue up before `send` blocks.
const CHANNEL_CAPACITY: usize = 8;

// ── Messages ─────────────────────────────────────────────────────────

pub enum WriteMessage {
    /// Batch of scanned entries, persisted in one transaction.
    InsertEntries(Vec<ScannedEntry>),
    /// Update a meta key.
    UpdateMeta { key: String, value: String },
    /// Ask SQLite to give back cache memory.
    ReleaseMemory,
    /// Barrier: replies once every earlier message has been processed.
    Flush(oneshot::Sender<Result<FlushReport, IndexStoreError>>),
    /// Shut down the writer thread.
    Shutdown,
}

/// Cumulative write counters, returned by a flush barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Rows actually inserted.
    pub inserted: u64,
    /// Rows skipped because their path already existed.
    pub duplicates: u64,
}

// ── IndexWriter handle ───────────────────────────────────────────────

/// Sending side of one store's writer thread. Clones feed the same thread.
#[derive(Clone)]
pub struct IndexWriter {
    sender: mpsc::SyncSender<WriteMessage>,
    /// Taken by the first `shutdown` to join.
    thread_handle: Arc<std::sync::Mutex<Option<thread::JoinHandle<()>>>>,
}

impl IndexWriter {
    /// Spawn the writer thread with its own write connection to `db_path`.
    pub fn spawn(db_path: &Path) -> Result<Self, IndexStoreError> {
        let conn = IndexStore::open_write_connection(db_path)?;
        let (sender, receiver) = mpsc::sync_channel::<WriteMessage>(CHANNEL_CAPACITY);

        let handle = thread::Builder::new()
            .name("index-writer".into())
            .spawn(move || writer_loop(conn, receiver))
            .map_err(IndexStoreError::Io)?;

        Ok(Self {
            sender,
            thread_handle: Arc::new(std::sync::Mutex::new(Some(handle))),
        })
    }

    /// Send a message to the writer thread. Blocks while the channel is full.
    pub fn send(&self, msg: WriteMessage) -> Result<(), IndexStoreError> {
        self.sender.send(msg).map_err(|_| writer_gone())
    }

    /// Wait until everything sent so far is written.
    ///
    /// Returns the first write error since the previous flush, if any.
    pub fn flush(&self) -> Result<FlushReport, IndexStoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(WriteMessage::Flush(tx))?;
        rx.blocking_recv().map_err(|_| writer_gone())?
    }

    /// Stop the thread after it drained the queue, and wait for it. Later sends fail.
    pub fn shutdown(&self) {
        let _ = self.sender.send(WriteMessage::Shutdown);
        let handle = self.thread_handle.lock_ignore_poison().take();
        if let Some(handle) = handle
            && let Err(e) = handle.join()
        {
            log::warn!("Index writer thread panicked on shutdown: {e:?}");
        }
    }
}

fn writer_gone() -> IndexStoreError {
    IndexStoreError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "Writer thread has shut down",
    ))
}

// ── Writer thread loop ───────────────────────────────────────────────

#[derive(Default)]
struct WriterState {
    report: FlushReport,
    /// First failure since the last flush. Later failures are only logged.
    first_error: Option<IndexStoreError>,
}

fn writer_loop(conn: rusqlite::Connection, receiver: mpsc::Receiver<WriteMessage>) {
    let mut state = WriterState::default();
    while let Ok(msg) = receiver.recv() {
        if process_message(&conn, &mut state, msg) {
            return;
        }
    }
}

/// Process a single message. Returns `true` if the thread should exit.
fn process_message(conn: &rusqlite::Connection, state: &mut WriterState, msg: WriteMessage) -> bool {
    match msg {
        WriteMessage::InsertEntries(entries) => match IndexStore::insert_entries_batch(conn, &entries) {
            Ok(duplicates) => {
                state.report.duplicates += duplicates;
                state.report.inserted += entries.len() as u64 - duplicates;
                if duplicates > 0 {
                    log::debug!("Index writer: skipped {duplicates} duplicate paths");
                }
            }
            Err(e) => {
                log::warn!("Index writer: insert_entries_batch failed: {e}");
                state.first_error.get_or_insert(e);
            }
        },
        WriteMessage::UpdateMeta { key, value } => {
            if let Err(e) = IndexStore::update_meta(conn, &key, &value) {
                log::warn!("Index writer: update_meta({key}) failed: {e}");
                state.first_error.get_or_insert(e);
            }
        }
        WriteMessage::ReleaseMemory => {
            if let Err(e) = IndexStore::release_memory(conn) {
                log::debug!("Index writer: shrink_memory failed: {e}");
            }
        }
        WriteMessage::Flush(reply) => {
            let result = match state.first_error.take() {
                Some(e) => Err(e),
                None => Ok(state.report),
            };
            let _ = reply.send(result);
        }
        WriteMessage::Shutdown => return true,
    }
    false
}

// ── Tests ────────────────────────────────────────────────────────────
