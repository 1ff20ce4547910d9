use tether_core::errors::ErrorKind;
use tether_core::ids::{JobId, RequestId};
use tether_store::StoreError;

use crate::planner::PlannerError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("request {0} is already open")]
    DuplicateRequest(RequestId),

    #[error("no running loop for job {0}")]
    NoActiveLoop(JobId),

    #[error("job {0} belongs to another principal")]
    Forbidden(JobId),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Planner(_) | Self::DuplicateRequest(_) => ErrorKind::Fatal,
            Self::NoActiveLoop(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Unauthorized,
        }
    }
}
