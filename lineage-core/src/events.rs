//! Operation lifecycle events.
//!
//! Operations emit a start event when they begin and an end event once their
//! results are known. Payloads are flat JSON objects keyed by the constants in
//! [`keys`].

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const BACKUP_START: &str = "backup:start";
pub const BACKUP_END: &str = "backup:end";
pub const RESTORE_START: &str = "restore:start";
pub const RESTORE_END: &str = "restore:end";

pub mod keys {
    pub const BACKUP_ID: &str = "backupId";
    pub const RESTORE_ID: &str = "restoreId";
    pub const SERVICE: &str = "service";
    pub const STATUS: &str = "status";
    pub const START_TIME: &str = "startTime";
    pub const DURATION_MS: &str = "durationMs";
    pub const ITEMS_READ: &str = "itemsRead";
    pub const ITEMS_WRITTEN: &str = "itemsWritten";
    pub const BYTES_READ: &str = "bytesRead";
    pub const BYTES_UPLOADED: &str = "bytesUploaded";
    pub const RESOURCE_OWNERS: &str = "resourceOwners";
    pub const ERROR: &str = "error";
}

pub type Properties = Map<String, Value>;

/// Sink for lifecycle events. Emitting never fails and never blocks.
pub trait EventBus: Send + Sync {
    fn event(&self, event_type: &str, props: Properties);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopBus;

impl EventBus for NoopBus {
    fn event(&self, _event_type: &str, _props: Properties) {}
}

const BROADCAST_CAPACITY: usize = 256;
const MAX_QUEUE_PER_OPERATION: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub event_type: String,
    pub props: Properties,
    pub timestamp: i64,
}

/// Fans events out to subscribers and keeps a bounded per-operation replay
/// queue for late subscribers.
pub struct BroadcastBus {
    tx: broadcast::Sender<String>,
    queue: Arc<DashMap<String, VecDeque<QueuedEvent>>>,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Events recorded for an operation after `since` (unix millis).
    pub fn queued_events(&self, operation_id: &str, since: i64) -> Vec<QueuedEvent> {
        self.queue
            .get(operation_id)
            .map(|q| q.iter().filter(|e| e.timestamp > since).cloned().collect())
            .unwrap_or_default()
    }
}

impl EventBus for BroadcastBus {
    fn event(&self, event_type: &str, props: Properties) {
        let msg = serde_json::json!({
            "type": event_type,
            "payload": props,
        });

        let op_id = [keys::RESTORE_ID, keys::BACKUP_ID]
            .iter()
            .find_map(|k| props.get(*k).and_then(Value::as_str));

        if let Some(op_id) = op_id {
            let mut entry = self.queue.entry(op_id.to_string()).or_default();
            entry.push_back(QueuedEvent {
                event_type: event_type.to_string(),
                props: props.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
            if entry.len() > MAX_QUEUE_PER_OPERATION {
                entry.pop_front();
            }
        }

        // No subscribers is fine.
        let _ = self.tx.send(msg.to_string());
    }
}

/// Records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingBus {
    called_with: DashMap<String, Vec<Properties>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn times_called(&self, event_type: &str) -> usize {
        self.called_with.get(event_type).map_or(0, |v| v.len())
    }

    pub fn called_with(&self, event_type: &str) -> Vec<Properties> {
        self.called_with
            .get(event_type)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }
}

impl EventBus for RecordingBus {
    fn event(&self, event_type: &str, props: Properties) {
        self.called_with
            .entry(event_type.to_string())
            .or_default()
            .push(props);
    }
}
