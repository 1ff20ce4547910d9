//! The reasoning side of a job: what to request next.
//!
//! The controller decides how a request travels, is gated and is tracked.
//! A [`Planner`] only decides what comes next.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::events::ToolOutcome;
use tether_core::ids::{JobId, RequestId};
use tether_core::job::{Job, PhaseOutline};
use tether_core::tools::ToolCall;

/// Result of one tool request, handed back to the planner.
#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    pub request_id: RequestId,
    pub call: ToolCall,
    pub outcome: ToolOutcome,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Dispatch(ToolCall),
    CompleteMilestone { summary: Option<String> },
    FailMilestone { reason: String },
    /// Give up on the whole job.
    Abandon { reason: String },
    UpdateContext(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("planner unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Phase outline for a new job. An empty outline fails the job.
    async fn outline(&self, job: &Job) -> Result<Vec<PhaseOutline>, PlannerError>;

    /// Next actions for the job's current milestone.
    ///
    /// `last` is the outcome that triggered this call. `None` means the
    /// milestone is starting, or restarting after a resume.
    async fn plan(&self, job: &Job, last: Option<&StepOutcome>) -> Result<Vec<Action>, PlannerError>;

    /// Drop any per-job state.
    fn release(&self, _job_id: &JobId) {}
}

/// What to do when a scripted step fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
    Abandon,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptMilestone {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptPhase {
    pub name: String,
    pub milestones: Vec<ScriptMilestone>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub phases: Vec<ScriptPhase>,
}

/// Replays a fixed plan of tool steps for every job.
///
/// Steps within a milestone run one at a time. Restarting a milestone (after
/// a resume) replays it from its first step.
pub struct ScriptedPlanner {
    script: Script,
    /// Next step per (job, phase, milestone).
    cursors: Mutex<HashMap<(JobId, usize, usize), usize>>,
}

impl ScriptedPlanner {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, PlannerError> {
        let script: Script =
            serde_json::from_str(json).map_err(|e| PlannerError::InvalidPlan(e.to_string()))?;
        Ok(Self::new(script))
    }

    pub fn from_file(path: &Path) -> Result<Self, PlannerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PlannerError::InvalidPlan(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    fn milestone(&self, phase: usize, milestone: usize) -> Result<&ScriptMilestone, PlannerError> {
        self.script
            .phases
            .get(phase)
            .and_then(|p| p.milestones.get(milestone))
            .ok_or_else(|| {
                PlannerError::InvalidPlan(format!("no milestone {milestone} in phase {phase}"))
            })
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn outline(&self, _job: &Job) -> Result<Vec<PhaseOutline>, PlannerError> {
        Ok(self
            .script
            .phases
            .iter()
            .map(|p| PhaseOutline {
                name: p.name.clone(),
                milestones: p.milestones.iter().map(|m| m.name.clone()).collect(),
            })
            .collect())
    }

    async fn plan(&self, job: &Job, last: Option<&StepOutcome>) -> Result<Vec<Action>, PlannerError> {
        let Some((phase, index)) = job.cursor() else {
            return Ok(Vec::new());
        };
        let milestone = self.milestone(phase, index)?;
        let key = (job.id.clone(), phase, index);
        let mut cursors = self.cursors.lock();

        let next = match last {
            None => 0,
            Some(step) => {
                let done = cursors.get(&key).copied().unwrap_or(0);
                if let ToolOutcome::Failure { message, .. } = &step.outcome {
                    let policy = done
                        .checked_sub(1)
                        .and_then(|i| milestone.steps.get(i))
                        .map(|s| s.on_error)
                        .unwrap_or_default();
                    let reason = format!("{} failed: {message}", step.call.tool);
                    match policy {
                        OnError::Fail => {
                            cursors.remove(&key);
                            return Ok(vec![Action::FailMilestone { reason }]);
                        }
                        OnError::Abandon => {
                            cursors.remove(&key);
                            return Ok(vec![Action::Abandon { reason }]);
                        }
                        OnError::Continue => {}
                    }
                }
                done
            }
        };

        match milestone.steps.get(next) {
            Some(step) => {
                cursors.insert(key, next + 1);
                Ok(vec![Action::Dispatch(ToolCall::new(step.tool.clone(), step.args.clone()))])
            }
            None => {
                cursors.remove(&key);
                let mut actions = Vec::new();
                if let Some(summary) = &milestone.summary {
                    actions.push(Action::UpdateContext(summary.clone()));
                }
                actions.push(Action::CompleteMilestone {
                    summary: milestone.summary.clone(),
                });
                Ok(actions)
            }
        }
    }

    fn release(&self, job_id: &JobId) {
        self.cursors.lock().retain(|(id, _, _), _| id != job_id);
    }
}
