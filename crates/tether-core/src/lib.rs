pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod protocol;
pub mod tools;

pub use errors::ErrorKind;
pub use ids::{JobId, Principal, RequestId, SessionId};
pub use job::{Job, JobError, JobMutation, JobStatus, JobSummary, PhaseOutline, StepStatus};
pub use protocol::{ClientMessage, ServerMessage};
