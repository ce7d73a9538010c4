//! The worker session's conversation log: append-only except that the
//! "current" assistant entry may be updated in place while streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub is_approval_request: bool,
    #[serde(default)]
    pub is_pending: bool,
}

impl LogEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            parts: None,
            tool_name: None,
            tool_call_id: None,
            is_approval_request: false,
            is_pending: false,
        }
    }
}

/// Append-only conversation log with one exception: the current streaming
/// assistant entry can be updated in place until `start_new_message` or a
/// flush boundary closes it.
#[derive(Debug, Default)]
pub struct ConversationLog {
    entries: Vec<LogEntry>,
    current_assistant_id: Option<Uuid>,
    closed: bool,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the log permanently: subsequent writes are rejected. Called
    /// when the owning session reaches a terminal state.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<(), LogClosedError> {
        if self.closed {
            return Err(LogClosedError);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Append or extend the current streaming assistant message. The first
    /// call for a turn creates a fresh entry; subsequent calls append to its
    /// content until [`Self::start_new_message`] resets the cursor.
    pub fn append_assistant_chunk(&mut self, chunk: &str) -> Result<Uuid, LogClosedError> {
        if self.closed {
            return Err(LogClosedError);
        }
        if let Some(id) = self.current_assistant_id {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
                entry.content.push_str(chunk);
                return Ok(id);
            }
        }
        let mut entry = LogEntry::new(Role::Assistant, chunk);
        entry.is_pending = true;
        let id = entry.id;
        self.entries.push(entry);
        self.current_assistant_id = Some(id);
        Ok(id)
    }

    /// Flush and reset the current-message cursor: the next assistant chunk
    /// starts a brand-new entry.
    pub fn start_new_message(&mut self) {
        if let Some(id) = self.current_assistant_id.take() {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
                entry.is_pending = false;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("conversation log is closed")]
pub struct LogClosedError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_chunks_coalesce_into_one_entry() {
        let mut log = ConversationLog::new();
        log.append_assistant_chunk("Hel").unwrap();
        log.append_assistant_chunk("lo").unwrap();
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].content, "Hello");
    }

    #[test]
    fn start_new_message_begins_a_fresh_entry() {
        let mut log = ConversationLog::new();
        log.append_assistant_chunk("first").unwrap();
        log.start_new_message();
        log.append_assistant_chunk("second").unwrap();
        assert_eq!(log.entries().len(), 2);
    }

    #[test]
    fn closed_log_rejects_writes() {
        let mut log = ConversationLog::new();
        log.close();
        assert!(log.append(LogEntry::user("hi")).is_err());
        assert!(log.append_assistant_chunk("x").is_err());
    }
}
