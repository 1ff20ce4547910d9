//! Inputs that drive a job loop.

use serde_json::Value;

use crate::errors::ErrorKind;
use crate::ids::{RequestId, SessionId};

#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure { kind: ErrorKind, message: String },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// Build the outline and begin work.
    Start,
    /// A paused job was re-bound to `session_id`.
    ResumeRequested { session_id: SessionId },
    ToolResolved {
        request_id: RequestId,
        outcome: ToolOutcome,
    },
    ApprovalReceived {
        request_id: RequestId,
        approved: bool,
    },
    /// A tool or approval deadline passed.
    DeadlineExpired { request_id: RequestId },
    Disconnected { session_id: SessionId },
    Cancel,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ResumeRequested { .. } => "resume_requested",
            Self::ToolResolved { .. } => "tool_resolved",
            Self::ApprovalReceived { .. } => "approval_received",
            Self::DeadlineExpired { .. } => "deadline_expired",
            Self::Disconnected { .. } => "disconnected",
            Self::Cancel => "cancel",
        }
    }
}
