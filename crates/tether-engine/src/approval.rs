//! Approval policy and pending approval decisions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::warn;

use tether_core::ids::RequestId;
use tether_core::tools::{ToolCall, ToolCategory};

use crate::error::EngineError;

/// Static per-category approval policy.
#[derive(Clone, Copy, Debug)]
pub struct ApprovalGate {
    pub shell_requires_approval: bool,
}

impl ApprovalGate {
    /// Auto-approve covers file mutations only. Shell follows configuration and
    /// unknown tools always ask.
    pub fn requires_approval(&self, tool: &str, auto_approve: bool) -> bool {
        match tether_core::tools::category(tool) {
            ToolCategory::ReadOnly | ToolCategory::Directory => false,
            ToolCategory::Mutating => !auto_approve,
            ToolCategory::Shell => self.shell_requires_approval,
            ToolCategory::Unknown => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub request_id: RequestId,
    pub approved: bool,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn new(request_id: RequestId, approved: bool) -> Self {
        Self {
            request_id,
            approved,
            decided_at: Utc::now(),
        }
    }
}

/// A tool call held back until someone approves it.
#[derive(Clone, Debug)]
pub struct PendingApproval {
    pub request_id: RequestId,
    pub call: ToolCall,
    pub phase: usize,
    pub milestone: usize,
    pub deadline: Instant,
}

/// What a decision did to its pending entry.
#[derive(Debug)]
pub enum Verdict {
    Approved(PendingApproval),
    Denied(PendingApproval),
    Lapsed(PendingApproval),
}

#[derive(Debug, Default)]
pub struct PendingApprovals {
    entries: HashMap<RequestId, PendingApproval>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        request_id: RequestId,
        call: ToolCall,
        phase: usize,
        milestone: usize,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        if self.entries.contains_key(&request_id) {
            return Err(EngineError::DuplicateRequest(request_id));
        }
        self.entries.insert(
            request_id.clone(),
            PendingApproval {
                request_id,
                call,
                phase,
                milestone,
                deadline: Instant::now() + timeout,
            },
        );
        Ok(())
    }

    /// Consume the pending entry for a decision. Late or duplicate decisions are ignored.
    ///
    /// A decision at or past the deadline lapses even if the expiry sweep has
    /// not reached the entry yet.
    pub fn decide(&mut self, decision: &ApprovalDecision, now: Instant) -> Option<Verdict> {
        let Some(entry) = self.entries.remove(&decision.request_id) else {
            warn!(
                request_id = %decision.request_id,
                code = "UNKNOWN_CORRELATION",
                "approval for a request that is not pending"
            );
            return None;
        };
        Some(if now >= entry.deadline {
            Verdict::Lapsed(entry)
        } else if decision.approved {
            Verdict::Approved(entry)
        } else {
            Verdict::Denied(entry)
        })
    }

    /// Remove without a decision, used when the deadline passes.
    pub fn take(&mut self, request_id: &RequestId) -> Option<PendingApproval> {
        self.entries.remove(request_id)
    }

    pub fn expired(&self, now: Instant) -> Vec<RequestId> {
        let mut due: Vec<&PendingApproval> =
            self.entries.values().filter(|e| e.deadline <= now).collect();
        due.sort_by_key(|e| e.deadline);
        due.into_iter().map(|e| e.request_id.clone()).collect()
    }

    pub fn release_all(&mut self) -> Vec<RequestId> {
        self.entries.drain().map(|(id, _)| id).collect()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GATE: ApprovalGate = ApprovalGate {
        shell_requires_approval: true,
    };

    #[test]
    fn read_only_and_directory_never_ask() {
        for tool in ["list_files", "read_file", "search_files", "get_file_info", "create_directory"] {
            assert!(!GATE.requires_approval(tool, false), "{tool}");
        }
    }

    #[test]
    fn mutating_tools_ask_unless_auto_approved() {
        for tool in ["write_file", "edit_file", "delete_file"] {
            assert!(GATE.requires_approval(tool, false));
            assert!(!GATE.requires_approval(tool, true));
        }
    }

    #[test]
    fn shell_follows_configuration() {
        assert!(GATE.requires_approval("shell", true));
        let relaxed = ApprovalGate {
            shell_requires_approval: false,
        };
        assert!(!relaxed.requires_approval("shell", false));
    }

    #[test]
    fn unknown_tools_fail_closed() {
        assert!(GATE.requires_approval("format_disk", true));
    }

    #[tokio::test(start_paused = true)]
    async fn decide_consumes_once() {
        let mut pending = PendingApprovals::new();
        let id = RequestId::new();
        pending
            .open(
                id.clone(),
                ToolCall::new("write_file", json!({"file_path": "a"})),
                0,
                0,
                Duration::from_secs(300),
            )
            .unwrap();

        let decision = ApprovalDecision::new(id.clone(), true);
        assert!(matches!(pending.decide(&decision, Instant::now()), Some(Verdict::Approved(_))));
        assert!(pending.decide(&decision, Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn decision_after_deadline_lapses() {
        let mut pending = PendingApprovals::new();
        let id = RequestId::new();
        pending
            .open(id.clone(), ToolCall::new("write_file", json!({})), 0, 0, Duration::from_secs(300))
            .unwrap();

        tokio::time::advance(Duration::from_secs(300)).await;
        let decision = ApprovalDecision::new(id, true);
        assert!(matches!(pending.decide(&decision, Instant::now()), Some(Verdict::Lapsed(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_after_deadline() {
        let mut pending = PendingApprovals::new();
        let id = RequestId::new();
        pending
            .open(id.clone(), ToolCall::new("shell", json!({})), 0, 0, Duration::from_secs(300))
            .unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(pending.expired(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pending.expired(Instant::now()), vec![id.clone()]);
        assert!(pending.take(&id).is_some());
        assert!(pending.is_empty());
    }
}
