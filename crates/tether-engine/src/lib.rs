//! Job orchestration: correlation, approval gating and the per-job dispatch loop.

pub mod approval;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod error;
pub mod job_loop;
pub mod planner;

pub use config::ControllerConfig;
pub use controller::{Controller, StartRequest};
pub use error::EngineError;
pub use job_loop::Outbound;
pub use planner::{Action, Planner, PlannerError, ScriptedPlanner, StepOutcome};
