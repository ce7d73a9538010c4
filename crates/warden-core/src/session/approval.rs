//! Tool-invocation approval protocol.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub tool_name: String,
    pub tool_call_id: String,
    pub description: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub clarification: Option<String>,
}

/// Tracks pending approvals for a single worker session. Resolving the last
/// pending approval is the caller's cue to drive the session back to
/// `running` (see `state::dispatch::last_approval_resolved`).
#[derive(Default)]
pub struct ApprovalTable {
    pending: HashMap<Uuid, (ApprovalRequest, oneshot::Sender<ApprovalDecision>)>,
}

impl ApprovalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Insert a new pending approval and return a receiver that resolves
    /// when [`Self::resolve`] is called with the same id.
    pub fn request(
        &mut self,
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        description: impl Into<String>,
        params: Value,
    ) -> (Uuid, oneshot::Receiver<ApprovalDecision>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            (
                ApprovalRequest {
                    id,
                    tool_name: tool_name.into(),
                    tool_call_id: tool_call_id.into(),
                    description: description.into(),
                    params,
                },
                tx,
            ),
        );
        (id, rx)
    }

    /// Resolve a pending approval. Returns `true` if the table is now empty
    /// (i.e. the caller should transition the session back to `running`).
    pub fn resolve(
        &mut self,
        id: Uuid,
        approved: bool,
        clarification: Option<String>,
    ) -> Result<bool, UnknownApprovalError> {
        let (_, sender) = self.pending.remove(&id).ok_or(UnknownApprovalError(id))?;
        let _ = sender.send(ApprovalDecision {
            approved,
            clarification,
        });
        Ok(self.pending.is_empty())
    }

    pub fn list(&self) -> Vec<ApprovalRequest> {
        self.pending.values().map(|(req, _)| req.clone()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no pending approval with id {0}")]
pub struct UnknownApprovalError(pub Uuid);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolving_the_only_pending_approval_reports_empty() {
        let mut table = ApprovalTable::new();
        let (id, rx) = table.request("run_tests", "call-1", "run the test suite", Value::Null);
        assert_eq!(table.len(), 1);

        let now_empty = table.resolve(id, true, None).unwrap();
        assert!(now_empty);

        let decision = rx.await.unwrap();
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn resolving_one_of_two_reports_not_empty() {
        let mut table = ApprovalTable::new();
        let (id1, _rx1) = table.request("a", "c1", "d", Value::Null);
        let (_id2, _rx2) = table.request("b", "c2", "d", Value::Null);

        let now_empty = table.resolve(id1, true, None).unwrap();
        assert!(!now_empty);
    }

    #[test]
    fn resolving_unknown_id_errors() {
        let mut table = ApprovalTable::new();
        assert!(table.resolve(Uuid::new_v4(), true, None).is_err());
    }
}
