//! Local side of the tool channel: runs requested tools on this machine and
//! answers approval prompts.

pub mod adapter;
pub mod client;
pub mod error;
pub mod local;
pub mod prompt;

pub use adapter::ExecutorAdapter;
pub use client::{Command, ExecutorClient, Outcome};
pub use error::ExecutorError;
pub use local::LocalToolExecutor;
pub use prompt::{ApprovalPrompt, AutoApprove, DenyAll, StdinPrompt};
