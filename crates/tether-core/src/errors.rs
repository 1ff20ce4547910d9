use std::fmt;

use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every layer and carried on the wire in `error.code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Undecodable frame. Connection-local, never fails a job.
    MalformedMessage,
    /// Late or duplicate response for a request that is no longer open.
    UnknownCorrelation,
    /// The remote executor reported a failure for one request.
    ToolError,
    /// Synthetic failure produced by deadline expiry.
    Timeout,
    ApprovalDenied,
    ApprovalTimeout,
    /// Session loss. Pauses the job.
    Disconnect,
    /// Resume attempted on a job that is not paused.
    ResumeConflict,
    /// Resume attempted after the retention window.
    ResumeExpired,
    NotFound,
    Unauthorized,
    Cancelled,
    /// Job state can no longer be trusted (e.g. persistence failed).
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::UnknownCorrelation => "UNKNOWN_CORRELATION",
            Self::ToolError => "TOOL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ApprovalDenied => "APPROVAL_DENIED",
            Self::ApprovalTimeout => "APPROVAL_TIMEOUT",
            Self::Disconnect => "DISCONNECT",
            Self::ResumeConflict => "RESUME_CONFLICT",
            Self::ResumeExpired => "RESUME_EXPIRED",
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Cancelled => "CANCELLED",
            Self::Fatal => "FATAL",
        }
    }

    /// Whether the job survives an error of this kind.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Fatal | Self::ResumeExpired | Self::Cancelled)
    }

    /// Failures that belong to a single tool step rather than to the job.
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            Self::ToolError | Self::Timeout | Self::ApprovalDenied | Self::ApprovalTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_display() {
        for kind in [
            ErrorKind::MalformedMessage,
            ErrorKind::UnknownCorrelation,
            ErrorKind::ToolError,
            ErrorKind::Timeout,
            ErrorKind::ApprovalDenied,
            ErrorKind::ApprovalTimeout,
            ErrorKind::Disconnect,
            ErrorKind::ResumeConflict,
            ErrorKind::ResumeExpired,
            ErrorKind::NotFound,
            ErrorKind::Unauthorized,
            ErrorKind::Cancelled,
            ErrorKind::Fatal,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn only_fatal_kinds_are_unrecoverable() {
        assert!(ErrorKind::ToolError.is_recoverable());
        assert!(ErrorKind::Timeout.is_recoverable());
        assert!(ErrorKind::ApprovalTimeout.is_recoverable());
        assert!(ErrorKind::Disconnect.is_recoverable());
        assert!(ErrorKind::ResumeConflict.is_recoverable());
        assert!(!ErrorKind::Fatal.is_recoverable());
        assert!(!ErrorKind::ResumeExpired.is_recoverable());
    }

    #[test]
    fn step_failures() {
        assert!(ErrorKind::Timeout.is_step_failure());
        assert!(ErrorKind::ApprovalDenied.is_step_failure());
        assert!(!ErrorKind::Disconnect.is_step_failure());
        assert!(!ErrorKind::Fatal.is_step_failure());
    }
}
