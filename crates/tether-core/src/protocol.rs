//! Wire protocol between the controller and remote executors.
//!
//! Every frame is one JSON object with a `type` discriminator. Ids are
//! opaque strings; the client never invents a `request_id`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorKind;
use crate::ids::{JobId, RequestId, SessionId};
use crate::job::{JobSummary, StepStatus};

/// Client → server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Execute {
        instruction: String,
        cwd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default)]
        auto_approve: bool,
    },
    Resume {
        job_id: JobId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
    },
    Status {
        job_id: JobId,
    },
    ToolResult {
        request_id: RequestId,
        result: Value,
    },
    ToolError {
        request_id: RequestId,
        error: String,
    },
    Approval {
        request_id: RequestId,
        approved: bool,
    },
    /// Cancel the named job, or the job bound to this session.
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
    },
    Heartbeat,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::Resume { .. } => "resume",
            Self::Status { .. } => "status",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolError { .. } => "tool_error",
            Self::Approval { .. } => "approval",
            Self::Cancel { .. } => "cancel",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Server → client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: SessionId,
    },
    JobStarted {
        job_id: JobId,
    },
    ToolRequest {
        request_id: RequestId,
        tool: String,
        args: Value,
    },
    ApprovalRequest {
        request_id: RequestId,
        tool: String,
        args: Value,
        description: String,
    },
    PhaseStart {
        /// One-based.
        phase: usize,
        total_phases: usize,
        name: String,
        milestones: Vec<String>,
    },
    MilestoneUpdate {
        phase: usize,
        milestone: String,
        status: StepStatus,
    },
    Progress {
        phase: usize,
        total_phases: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        milestone: Option<String>,
        percent: u8,
        message: String,
    },
    Complete {
        summary: String,
        files_changed: Vec<String>,
        phases_completed: usize,
        milestones_completed: usize,
    },
    Error {
        message: String,
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        milestone: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorKind>,
    },
    Paused {
        job_id: JobId,
        resume_token: String,
        phase: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        milestone: Option<String>,
    },
    Resumed {
        job_id: JobId,
        phase: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        milestone: Option<String>,
    },
    JobStatus(JobSummary),
    Cancelled {
        job_id: JobId,
    },
}

impl ServerMessage {
    /// Error frame carrying a taxonomy code. Recoverability follows the kind.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            recoverable: kind.is_recoverable(),
            phase: None,
            milestone: None,
            code: Some(kind),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::JobStarted { .. } => "job_started",
            Self::ToolRequest { .. } => "tool_request",
            Self::ApprovalRequest { .. } => "approval_request",
            Self::PhaseStart { .. } => "phase_start",
            Self::MilestoneUpdate { .. } => "milestone_update",
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::JobStatus(_) => "job_status",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Messages after which the client has nothing left to wait for.
    pub fn ends_job(&self) -> bool {
        match self {
            Self::Complete { .. } | Self::Cancelled { .. } | Self::Paused { .. } => true,
            Self::Error { recoverable, .. } => !recoverable,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedMessage
    }
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

pub fn decode_client(text: &str) -> Result<ClientMessage, CodecError> {
    decode(text)
}

pub fn decode_server(text: &str) -> Result<ServerMessage, CodecError> {
    decode(text)
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::Malformed(e.to_string()))
}
