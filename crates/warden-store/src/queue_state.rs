//! On-disk format for the message queue's persisted state.
//!
//! Mirrors the data model verbatim: a flat list of messages, the
//! set of processed message ids (for idempotent acknowledgment across
//! restarts), and a metrics snapshot. `schema_version` guards future format
//! changes; `1` is the only version this runtime currently understands.

use std::path::Path;
use uuid::Uuid;

use serde::{Deserialize, Serialize};

use crate::atomic::{self, StoreError};
use crate::models::Message;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub total_enqueued: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_expired: u64,
    /// Exponential moving average of delivery latency, in milliseconds.
    pub avg_delivery_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStateFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub messages: Vec<Message>,
    pub processed_ids: Vec<Uuid>,
    pub metrics: QueueMetricsSnapshot,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for QueueStateFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            messages: Vec::new(),
            processed_ids: Vec::new(),
            metrics: QueueMetricsSnapshot::default(),
        }
    }
}

/// Persist the queue state to `path`, atomically.
pub fn save(path: &Path, state: &QueueStateFile) -> Result<(), StoreError> {
    atomic::write_json_atomic(path, state)
}

/// Load the queue state from `path`. Returns the default (empty) state if
/// the file does not yet exist.
pub fn load(path: &Path) -> Result<QueueStateFile, StoreError> {
    Ok(atomic::read_json(path)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AgentId, DeliveryOptions, MessageContent, MessageMetadata, MessageStatus, MessageType,
        Priority,
    };

    fn sample_message() -> Message {
        Message {
            id: Uuid::new_v4(),
            message_type: MessageType::Heartbeat,
            priority: Priority::Normal,
            status: MessageStatus::Pending,
            sender: AgentId::orchestrator(),
            receiver: AgentId::orchestrator(),
            content: MessageContent::Heartbeat,
            metadata: MessageMetadata::new(chrono::Utc::now()),
            delivery_options: DeliveryOptions::default(),
            plan_id: None,
            task_id: None,
            subtask_id: None,
            depth: 0,
        }
    }

    #[test]
    fn load_missing_file_is_empty_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(&dir.path().join("queue.json")).unwrap();
        assert!(state.messages.is_empty());
        assert_eq!(state.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let mut state = QueueStateFile::default();
        state.messages.push(sample_message());
        state.metrics.total_enqueued = 1;

        save(&path, &state).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].id, state.messages[0].id);
        assert_eq!(loaded.metrics.total_enqueued, 1);
    }
}
