use tether_core::errors::ErrorKind;
use tether_core::ids::JobId;
use tether_core::job::{JobError, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("job {job_id} is {status}, only paused jobs can resume")]
    ResumeConflict { job_id: JobId, status: JobStatus },

    #[error("job {job_id} was paused too long ago to resume")]
    ResumeExpired { job_id: JobId },

    #[error("resume token does not match job {0}")]
    TokenMismatch(JobId),

    #[error("job {0} belongs to another principal")]
    Forbidden(JobId),

    #[error(transparent)]
    Transition(#[from] JobError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ResumeConflict { .. } => ErrorKind::ResumeConflict,
            Self::ResumeExpired { .. } => ErrorKind::ResumeExpired,
            Self::TokenMismatch(_) | Self::Forbidden(_) => ErrorKind::Unauthorized,
            Self::Conflict(_) | Self::Transition(_) => ErrorKind::ResumeConflict,
            Self::Database(_) | Self::Serialization(_) | Self::Io(_) | Self::CorruptRow { .. } => {
                ErrorKind::Fatal
            }
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let id = JobId::from_raw("job_1");
        assert_eq!(
            StoreError::ResumeConflict {
                job_id: id.clone(),
                status: JobStatus::Running
            }
            .kind(),
            ErrorKind::ResumeConflict
        );
        assert_eq!(StoreError::ResumeExpired { job_id: id.clone() }.kind(), ErrorKind::ResumeExpired);
        assert_eq!(StoreError::Forbidden(id).kind(), ErrorKind::Unauthorized);
        assert_eq!(StoreError::Database("locked".into()).kind(), ErrorKind::Fatal);
        assert_eq!(StoreError::NotFound("job".into()).kind(), ErrorKind::NotFound);
    }
}
