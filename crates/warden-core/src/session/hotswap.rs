//! Agent/model hot-swap and the context-handover digest.

use super::log::{ConversationLog, LogEntry, Role};

const CONTEXT_DIGEST_MESSAGE_LIMIT: usize = 10;
const CONTEXT_DIGEST_TRUNCATE_CHARS: usize = 200;

/// Overwrite the agent identity. `instructions` is appended as a system
/// marker; when `preserve_context` is false the log is truncated to only
/// its first entry (the task's initial instruction) before the marker.
pub fn hot_swap_agent(
    log: &mut ConversationLog,
    new_agent_id: &str,
    instructions: &[String],
    preserve_context: bool,
) {
    if !preserve_context {
        let first = log.entries().first().cloned();
        *log = ConversationLog::new();
        if let Some(first) = first {
            let _ = log.append(first);
        }
    }

    let marker = if preserve_context {
        format!(
            "Agent identity switched to {new_agent_id} (context preserved). Instructions: {}",
            instructions.join(" ")
        )
    } else {
        format!(
            "Agent identity switched to {new_agent_id} (context reset). Instructions: {}",
            instructions.join(" ")
        )
    };
    let _ = log.append(LogEntry::system(marker));
}

pub fn hot_swap_model(log: &mut ConversationLog, new_model_id: &str) {
    let _ = log.append(LogEntry::system(format!("Model switched to {new_model_id}")));
}

/// Build the handover digest a newly hot-swapped agent receives: task text,
/// previous agent id, the last `CONTEXT_DIGEST_MESSAGE_LIMIT` "key" messages
/// (user messages, non-bracketed assistant messages, and system messages
/// containing "Error"), pending approval descriptions, and the last error.
pub fn context_digest(
    log: &ConversationLog,
    task: &str,
    previous_agent_id: &str,
    pending_approvals: &[String],
    last_error: Option<&str>,
) -> String {
    let key_messages: Vec<&LogEntry> = log
        .entries()
        .iter()
        .filter(|e| match e.role {
            Role::User => true,
            Role::Assistant => !e.content.trim_start().starts_with('['),
            Role::System => e.content.contains("Error"),
            Role::Tool => false,
        })
        .collect();

    let tail = key_messages
        .iter()
        .rev()
        .take(CONTEXT_DIGEST_MESSAGE_LIMIT)
        .rev()
        .map(|e| format!("[{:?}] {}", e.role, truncate(&e.content)))
        .collect::<Vec<_>>()
        .join("\n");

    let mut digest = format!("Task: {task}\nPrevious agent: {previous_agent_id}\n\n{tail}");
    if !pending_approvals.is_empty() {
        digest.push_str(&format!("\n\nPending approvals: {}", pending_approvals.join(", ")));
    }
    if let Some(err) = last_error {
        digest.push_str(&format!("\n\nLast error: {}", truncate(err)));
    }
    digest
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= CONTEXT_DIGEST_TRUNCATE_CHARS {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(CONTEXT_DIGEST_TRUNCATE_CHARS).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserving_context_appends_exactly_one_marker_and_keeps_history() {
        let mut log = ConversationLog::new();
        log.append(LogEntry::user("Hello")).unwrap();
        log.append_assistant_chunk("Hi").unwrap();
        let before = log.entries().len();

        hot_swap_agent(&mut log, "@reviewer", &["Review these".to_string()], true);

        assert_eq!(log.entries().len(), before + 1);
        let last = log.entries().last().unwrap();
        assert!(last.content.contains("@reviewer"));
        assert!(last.content.contains("context preserved"));
    }

    #[test]
    fn resetting_context_keeps_only_first_entry_plus_marker() {
        let mut log = ConversationLog::new();
        log.append(LogEntry::user("Hello")).unwrap();
        log.append_assistant_chunk("Hi").unwrap();
        log.append(LogEntry::user("More context")).unwrap();

        hot_swap_agent(&mut log, "@reviewer", &[], false);

        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.entries()[0].content, "Hello");
    }

    #[test]
    fn context_digest_includes_task_and_previous_agent() {
        let mut log = ConversationLog::new();
        log.append(LogEntry::user("Implement the thing")).unwrap();
        let digest = context_digest(&log, "Implement the thing", "@coder", &[], None);
        assert!(digest.contains("Implement the thing"));
        assert!(digest.contains("@coder"));
    }
}
