//! Single-slot scan scheduler.
//!
//! At most one scan or sync runs in the whole process. A request is granted only when the
//! slot is free and the target volume is not locked; otherwise it is rejected on the spot
//! with the list of conflicts. Nothing is queued.
//!
//! Cancelling marks the scan's state cancelled and releases the volume lock immediately,
//! but the slot itself stays reserved (`CleanupPending`) until the worker reports that its
//! cleanup is done, so no new scan can race a shadow store being torn down.
//!
//! Terminal states stay readable for `retention`, then are pruned on the next access.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ignore_poison::IgnorePoison;
use crate::indexing::cancel::CancellationToken;
use crate::indexing::scanner::ScanProgress;

// ── Types ────────────────────────────────────────────────────────────

/// Who asked for the scan. Recorded for observers; it never reorders anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPriority {
    Background = 0,
    UserRequested = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanState {
    pub volume_id: String,
    pub volume_path: String,
    pub status: ScanStatus,
    pub priority: ScanPriority,
    pub started_at: DateTime<Utc>,
    pub processed: u64,
    pub errors: u64,
    pub message: String,
    pub total: Option<u64>,
    pub current_dir: String,
    pub cancelable: bool,
}

/// Why a scan cannot start right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ScanConflict {
    /// Another scan holds the global slot.
    ScanRunning { volume_id: String },
    /// The target volume is locked by a scan.
    VolumeLocked { volume_id: String },
    /// A cancelled scan is still cleaning up.
    CleanupPending { volume_id: String },
    /// An interrupted sync must be resolved first.
    RecoveryRequired { volume_id: String },
}

impl std::fmt::Display for ScanConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanConflict::ScanRunning { volume_id } => write!(f, "a scan of volume {volume_id} is running"),
            ScanConflict::VolumeLocked { volume_id } => write!(f, "volume {volume_id} is locked"),
            ScanConflict::CleanupPending { volume_id } => {
                write!(f, "the cancelled scan of volume {volume_id} is still cleaning up")
            }
            ScanConflict::RecoveryRequired { volume_id } => {
                write!(f, "an interrupted sync of volume {volume_id} needs recovery")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRejection {
    pub volume_id: String,
    pub conflicts: Vec<ScanConflict>,
}

impl std::fmt::Display for ScanRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reasons: Vec<String> = self.conflicts.iter().map(ToString::to_string).collect();
        write!(f, "scan of volume {} rejected: {}", self.volume_id, reasons.join("; "))
    }
}

/// Handed to the worker that won the slot.
#[derive(Debug, Clone)]
pub struct ScanGrant {
    pub volume_id: String,
    pub cancel: CancellationToken,
    pub progress: Arc<ScanProgress>,
}

// ── Inner state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotPhase {
    Active,
    CleanupPending,
}

struct Slot {
    volume_id: String,
    cancel: CancellationToken,
    progress: Arc<ScanProgress>,
    phase: SlotPhase,
}

struct TrackedState {
    state: ScanState,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct SchedulerInner {
    locks: HashSet<String>,
    slot: Option<Slot>,
    states: HashMap<String, TrackedState>,
    recovery_required: Option<String>,
}

impl SchedulerInner {
    fn prune(&mut self, retention: Duration) {
        self.states
            .retain(|_, tracked| tracked.finished_at.is_none_or(|at| at.elapsed() < retention));
    }

    fn conflicts_for(&self, volume_id: &str) -> Vec<ScanConflict> {
        let mut conflicts = Vec::new();
        if let Some(pending) = &self.recovery_required {
            conflicts.push(ScanConflict::RecoveryRequired {
                volume_id: pending.clone(),
            });
        }
        if let Some(slot) = &self.slot {
            conflicts.push(match slot.phase {
                SlotPhase::Active => ScanConflict::ScanRunning {
                    volume_id: slot.volume_id.clone(),
                },
                SlotPhase::CleanupPending => ScanConflict::CleanupPending {
                    volume_id: slot.volume_id.clone(),
                },
            });
        }
        if self.locks.contains(volume_id) {
            conflicts.push(ScanConflict::VolumeLocked {
                volume_id: volume_id.to_string(),
            });
        }
        conflicts
    }
}

// ── ScanScheduler ────────────────────────────────────────────────────

/// Process-wide scan slot, volume locks, and scan states.
pub struct ScanScheduler {
    inner: Mutex<SchedulerInner>,
    retention: Duration,
}

impl ScanScheduler {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(SchedulerInner::default()),
            retention,
        }
    }

    /// Grant the slot to `volume_id`, or reject right away.
    pub fn start_scan(
        &self,
        volume_id: &str,
        volume_path: &str,
        priority: ScanPriority,
    ) -> Result<ScanGrant, ScanRejection> {
        let mut inner = self.inner.lock_ignore_poison();
        inner.prune(self.retention);

        let conflicts = inner.conflicts_for(volume_id);
        if !conflicts.is_empty() {
            log::info!("Scheduler: rejecting scan of {volume_id}: {conflicts:?}");
            return Err(ScanRejection {
                volume_id: volume_id.to_string(),
                conflicts,
            });
        }

        let grant = ScanGrant {
            volume_id: volume_id.to_string(),
            cancel: CancellationToken::new(),
            progress: Arc::new(ScanProgress::new()),
        };
        inner.locks.insert(volume_id.to_string());
        inner.slot = Some(Slot {
            volume_id: volume_id.to_string(),
            cancel: grant.cancel.clone(),
            progress: Arc::clone(&grant.progress),
            phase: SlotPhase::Active,
        });
        inner.states.insert(
            volume_id.to_string(),
            TrackedState {
                state: ScanState {
                    volume_id: volume_id.to_string(),
                    volume_path: volume_path.to_string(),
                    status: ScanStatus::Pending,
                    priority,
                    started_at: Utc::now(),
                    processed: 0,
                    errors: 0,
                    message: "Waiting to start".to_string(),
                    total: None,
                    current_dir: String::new(),
                    cancelable: true,
                },
                finished_at: None,
            },
        );
        log::info!("Scheduler: granted scan slot to {volume_id}");
        Ok(grant)
    }

    /// Conflicts a scan of `volume_id` would hit right now.
    pub fn check_conflicts(&self, volume_id: &str) -> Vec<ScanConflict> {
        let mut inner = self.inner.lock_ignore_poison();
        inner.prune(self.retention);
        inner.conflicts_for(volume_id)
    }

    /// Cancel the running scan. Returns `false` if nothing cancelable is running.
    pub fn cancel_scan(&self) -> bool {
        let mut inner = self.inner.lock_ignore_poison();
        let inner = &mut *inner;
        let Some(slot) = inner.slot.as_mut() else {
            return false;
        };
        if slot.phase != SlotPhase::Active {
            return false;
        }
        if inner
            .states
            .get(&slot.volume_id)
            .is_some_and(|tracked| !tracked.state.cancelable)
        {
            log::info!("Scheduler: scan of {} is finalizing, not cancelable", slot.volume_id);
            return false;
        }
        slot.cancel.cancel();
        slot.phase = SlotPhase::CleanupPending;
        let volume_id = slot.volume_id.clone();
        let snap = slot.progress.snapshot();

        inner.locks.remove(&volume_id);
        if let Some(tracked) = inner.states.get_mut(&volume_id) {
            tracked.state.status = ScanStatus::Cancelled;
            tracked.state.message = "Cancelled".to_string();
            tracked.state.cancelable = false;
            tracked.state.processed = snap.processed;
            tracked.state.errors = snap.errors;
            tracked.finished_at = Some(Instant::now());
        }
        log::info!("Scheduler: cancelled scan of {volume_id}");
        true
    }

    /// Move a granted scan from pending to running.
    pub fn mark_running(&self, volume_id: &str, message: &str) {
        self.update(volume_id, |state| {
            if state.status == ScanStatus::Pending {
                state.status = ScanStatus::Running;
            }
            state.message = message.to_string();
        });
    }

    pub fn set_message(&self, volume_id: &str, message: &str) {
        self.update(volume_id, |state| state.message = message.to_string());
    }

    /// Stop offering cancellation (finalization must not be interrupted).
    pub fn set_cancelable(&self, volume_id: &str, cancelable: bool) {
        self.update(volume_id, |state| state.cancelable = cancelable);
    }

    /// Release the slot and the lock, and record the terminal status.
    ///
    /// A state already marked cancelled keeps that status.
    pub fn finish(&self, volume_id: &str, status: ScanStatus, message: &str) {
        let mut inner = self.inner.lock_ignore_poison();
        let inner = &mut *inner;
        let mut snap = None;
        if inner.slot.as_ref().is_some_and(|s| s.volume_id == volume_id) {
            snap = inner.slot.take().map(|s| s.progress.snapshot());
        }
        inner.locks.remove(volume_id);

        if let Some(tracked) = inner.states.get_mut(volume_id) {
            if let Some(snap) = snap {
                tracked.state.processed = snap.processed;
                tracked.state.errors = snap.errors;
                tracked.state.total = snap.total;
            }
            if tracked.state.status != ScanStatus::Cancelled {
                tracked.state.status = status;
                tracked.state.message = message.to_string();
                tracked.finished_at = Some(Instant::now());
            }
            tracked.state.cancelable = false;
        }
        log::info!("Scheduler: released scan slot of {volume_id} ({status:?})");
    }

    /// States of the running scan and of recently finished ones, or of one volume.
    pub fn scan_status(&self, volume_id: Option<&str>) -> Vec<ScanState> {
        let mut inner = self.inner.lock_ignore_poison();
        inner.prune(self.retention);

        let live = inner
            .slot
            .as_ref()
            .filter(|s| s.phase == SlotPhase::Active)
            .map(|s| (s.volume_id.clone(), s.progress.snapshot()));

        let mut states: Vec<ScanState> = inner
            .states
            .values()
            .filter(|t| volume_id.is_none_or(|id| t.state.volume_id == id))
            .map(|t| {
                let mut state = t.state.clone();
                if let Some((id, snap)) = &live
                    && *id == state.volume_id
                {
                    state.processed = snap.processed;
                    state.errors = snap.errors;
                    state.total = snap.total;
                    state.current_dir = snap.current_dir.clone();
                }
                state
            })
            .collect();
        states.sort_by_key(|s| s.started_at);
        states
    }

    /// Block (or unblock, with `None`) new scans until an interrupted sync is resolved.
    pub fn set_recovery_required(&self, volume_id: Option<String>) {
        self.inner.lock_ignore_poison().recovery_required = volume_id;
    }

    fn update(&self, volume_id: &str, apply: impl FnOnce(&mut ScanState)) {
        let mut inner = self.inner.lock_ignore_poison();
        if let Some(tracked) = inner.states.get_mut(volume_id)
            && !tracked.state.status.is_terminal()
        {
            apply(&mut tracked.state);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
