//! Progress notifications pushed to the host.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

// ── Event payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressKind {
    Start,
    Batch,
    Progress,
    Complete,
    StreamingProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub volume_id: String,
    pub processed: u64,
    pub total: Option<u64>,
    pub errors: u64,
    pub message: String,
    /// Files per second, on streaming-progress events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rate: Option<f64>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, volume_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            volume_id: volume_id.to_string(),
            processed: 0,
            total: None,
            errors: 0,
            message: message.into(),
            rate: None,
        }
    }

    pub fn counts(mut self, processed: u64, total: Option<u64>, errors: u64) -> Self {
        self.processed = processed;
        self.total = total;
        self.errors = errors;
        self
    }
}

// ── Listeners ────────────────────────────────────────────────────────

/// Receives progress events. Called from scan threads, so it must not block for long.
pub trait ProgressListener: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards events into a tokio channel (for async hosts).
pub struct ChannelListener {
    sender: UnboundedSender<ProgressEvent>,
}

impl ChannelListener {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressListener for ChannelListener {
    fn on_event(&self, event: ProgressEvent) {
        // A closed receiver just means nobody is watching anymore
        let _ = self.sender.send(event);
    }
}

/// Writes events to the log. The default when no host is attached.
pub struct LogListener;

impl ProgressListener for LogListener {
    fn on_event(&self, event: ProgressEvent) {
        match event.kind {
            ProgressKind::Start | ProgressKind::Complete => log::info!(
                "[{}] {:?}: {} ({} processed, {} errors)",
                event.volume_id,
                event.kind,
                event.message,
                event.processed,
                event.errors
            ),
            _ => log::debug!(
                "[{}] {:?}: {} processed of {:?}, {} errors",
                event.volume_id,
                event.kind,
                event.processed,
                event.total,
                event.errors
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = ProgressEvent::new(ProgressKind::StreamingProgress, "v1", "scanning").counts(10, Some(20), 1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "streaming-progress");
        assert_eq!(json["volumeId"], "v1");
        assert_eq!(json["processed"], 10);
        assert_eq!(json["total"], 20);
        assert_eq!(json["errors"], 1);
        assert!(json.get("rate").is_none());
    }

    #[test]
    fn channel_listener_forwards_and_tolerates_closed_receiver() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let listener = ChannelListener::new(tx);
        listener.on_event(ProgressEvent::new(ProgressKind::Start, "v1", "go"));
        assert_eq!(rx.try_recv().unwrap().kind, ProgressKind::Start);

        drop(rx);
        listener.on_event(ProgressEvent::new(ProgressKind::Complete, "v1", "done"));
    }
}
