//! Job / Phase / Milestone model.
//!
//! [`Job::apply`] is the only way a job changes. It validates the lifecycle
//! transition, moves the milestone cursor, recomputes progress and reports
//! what moved through [`Applied`] so callers can emit wire updates without
//! diffing state themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::ids::{JobId, Principal, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Failed)
                | (Created, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Status shared by phases and milestones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub status: StepStatus,
    pub milestones: Vec<Milestone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Phase {
    fn from_outline(outline: PhaseOutline) -> Self {
        Self {
            name: outline.name,
            status: StepStatus::Pending,
            milestones: outline
                .milestones
                .into_iter()
                .map(|name| Milestone {
                    name,
                    status: StepStatus::Pending,
                    error: None,
                })
                .collect(),
            summary: None,
        }
    }

    pub fn milestone_names(&self) -> Vec<String> {
        self.milestones.iter().map(|m| m.name.clone()).collect()
    }
}

/// Phase plan produced by the reasoning collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutline {
    pub name: String,
    pub milestones: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: Principal,
    pub instruction: String,
    pub cwd: String,
    pub status: JobStatus,
    pub phases: Vec<Phase>,
    /// Zero-based index into `phases`.
    pub current_phase: usize,
    pub current_milestone: Option<String>,
    pub progress_percent: u8,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub context_summary: String,
    pub session_id: Option<SessionId>,
    pub resume_token: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
}

/// Every way a job can change.
#[derive(Clone, Debug, PartialEq)]
pub enum JobMutation {
    Start {
        phases: Vec<PhaseOutline>,
        session_id: SessionId,
    },
    StartMilestone,
    CompleteMilestone {
        summary: Option<String>,
    },
    FailMilestone {
        kind: ErrorKind,
        message: String,
    },
    RecordFiles {
        created: Vec<String>,
        modified: Vec<String>,
    },
    UpdateContext {
        summary: String,
    },
    Pause {
        resume_token: String,
    },
    Resume {
        session_id: SessionId,
    },
    Fail {
        kind: ErrorKind,
        message: String,
    },
    Cancel,
}

impl JobMutation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::StartMilestone => "start_milestone",
            Self::CompleteMilestone { .. } => "complete_milestone",
            Self::FailMilestone { .. } => "fail_milestone",
            Self::RecordFiles { .. } => "record_files",
            Self::UpdateContext { .. } => "update_context",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Fail { .. } => "fail",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MilestoneChange {
    pub phase: usize,
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
}

/// What a mutation moved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub from: JobStatus,
    pub to: JobStatus,
    pub milestone: Option<MilestoneChange>,
    /// Index of a phase that became active.
    pub phase_started: Option<usize>,
}

impl Applied {
    pub fn status_changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job is {0} and can no longer change")]
    Terminal(JobStatus),

    #[error("cannot move job from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("{operation} requires a running job, job is {status}")]
    NotRunning {
        operation: &'static str,
        status: JobStatus,
    },

    #[error("phase outline is empty")]
    EmptyOutline,

    #[error("no milestone is active")]
    NoActiveMilestone,
}

/// Read-only view returned by the status surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub status: JobStatus,
    pub instruction: String,
    pub cwd: String,
    /// One-based; zero before the outline exists.
    pub phase: usize,
    pub total_phases: usize,
    pub current_milestone: Option<String>,
    pub progress_percent: u8,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        instruction: impl Into<String>,
        cwd: impl Into<String>,
        owner: Principal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            owner,
            instruction: instruction.into(),
            cwd: cwd.into(),
            status: JobStatus::Created,
            phases: Vec::new(),
            current_phase: 0,
            current_milestone: None,
            progress_percent: 0,
            files_created: Vec::new(),
            files_modified: Vec::new(),
            context_summary: String::new(),
            session_id: None,
            resume_token: None,
            error_message: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            paused_at: None,
        }
    }

    /// Phase and milestone index of the first unsettled milestone in the current phase.
    pub fn cursor(&self) -> Option<(usize, usize)> {
        let phase = self.phases.get(self.current_phase)?;
        phase
            .milestones
            .iter()
            .position(|m| !m.status.is_terminal())
            .map(|m| (self.current_phase, m))
    }

    pub fn milestone(&self, phase: usize, index: usize) -> Option<&Milestone> {
        self.phases.get(phase)?.milestones.get(index)
    }

    pub fn total_milestones(&self) -> usize {
        self.phases.iter().map(|p| p.milestones.len()).sum()
    }

    pub fn completed_milestones(&self) -> usize {
        self.count_milestones(|m| m.status == StepStatus::Completed)
    }

    pub fn phases_completed(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == StepStatus::Completed)
            .count()
    }

    /// Created and modified paths, without duplicates, in first-seen order.
    pub fn files_changed(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for f in self.files_created.iter().chain(&self.files_modified) {
            if !out.contains(f) {
                out.push(f.clone());
            }
        }
        out
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id.clone(),
            status: self.status,
            instruction: self.instruction.clone(),
            cwd: self.cwd.clone(),
            phase: if self.phases.is_empty() {
                0
            } else {
                self.current_phase + 1
            },
            total_phases: self.phases.len(),
            current_milestone: self.current_milestone.clone(),
            progress_percent: self.progress_percent,
            files_created: self.files_created.clone(),
            files_modified: self.files_modified.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Apply a mutation. On error the job is left untouched.
    pub fn apply(&mut self, mutation: JobMutation, now: DateTime<Utc>) -> Result<Applied, JobError> {
        if self.status.is_terminal() {
            return Err(JobError::Terminal(self.status));
        }

        let mut next = self.clone();
        let applied = next.apply_inner(mutation, now)?;
        *self = next;
        Ok(applied)
    }

    fn apply_inner(&mut self, mutation: JobMutation, now: DateTime<Utc>) -> Result<Applied, JobError> {
        let mut applied = Applied {
            from: self.status,
            to: self.status,
            milestone: None,
            phase_started: None,
        };

        match mutation {
            JobMutation::Start { phases, session_id } => {
                self.require_transition(JobStatus::Running)?;
                if self.status != JobStatus::Created {
                    return Err(JobError::InvalidTransition {
                        from: self.status,
                        to: JobStatus::Running,
                    });
                }
                if phases.is_empty() || phases.iter().any(|p| p.milestones.is_empty()) {
                    return Err(JobError::EmptyOutline);
                }
                self.phases = phases.into_iter().map(Phase::from_outline).collect();
                self.current_phase = 0;
                self.phases[0].status = StepStatus::InProgress;
                self.session_id = Some(session_id);
                self.status = JobStatus::Running;
                self.started_at = Some(now);
                applied.phase_started = Some(0);
            }
            JobMutation::StartMilestone => {
                self.require_running("start_milestone")?;
                let (p, m) = self.cursor().ok_or(JobError::NoActiveMilestone)?;
                self.phases[p].status = StepStatus::InProgress;
                let milestone = &mut self.phases[p].milestones[m];
                if milestone.status == StepStatus::Pending {
                    milestone.status = StepStatus::InProgress;
                    applied.milestone = Some(MilestoneChange {
                        phase: p,
                        index: m,
                        name: milestone.name.clone(),
                        status: StepStatus::InProgress,
                    });
                }
            }
            JobMutation::CompleteMilestone { summary } => {
                self.require_running("complete_milestone")?;
                let (p, m) = self.cursor().ok_or(JobError::NoActiveMilestone)?;
                if summary.is_some() {
                    self.phases[p].summary = summary;
                }
                self.settle(p, m, StepStatus::Completed, None, now, &mut applied);
            }
            JobMutation::FailMilestone { kind, message } => {
                self.require_running("fail_milestone")?;
                let (p, m) = self.cursor().ok_or(JobError::NoActiveMilestone)?;
                let failure = StepFailure { kind, message };
                self.settle(p, m, StepStatus::Failed, Some(failure), now, &mut applied);
            }
            JobMutation::RecordFiles { created, modified } => {
                self.require_running("record_files")?;
                push_unique(&mut self.files_created, created);
                push_unique(&mut self.files_modified, modified);
            }
            JobMutation::UpdateContext { summary } => {
                self.context_summary = summary;
            }
            JobMutation::Pause { resume_token } => {
                self.require_transition(JobStatus::Paused)?;
                self.status = JobStatus::Paused;
                self.paused_at = Some(now);
                self.resume_token = Some(resume_token);
            }
            JobMutation::Resume { session_id } => {
                if self.status != JobStatus::Paused {
                    return Err(JobError::InvalidTransition {
                        from: self.status,
                        to: JobStatus::Running,
                    });
                }
                self.status = JobStatus::Running;
                self.session_id = Some(session_id);
                self.resume_token = None;
                self.paused_at = None;
            }
            JobMutation::Fail { message, .. } => {
                self.require_transition(JobStatus::Failed)?;
                self.status = JobStatus::Failed;
                self.error_message = Some(message);
                self.completed_at = Some(now);
            }
            JobMutation::Cancel => {
                self.require_transition(JobStatus::Cancelled)?;
                self.status = JobStatus::Cancelled;
                self.completed_at = Some(now);
            }
        }

        if let Some((p, m)) = self.cursor() {
            self.current_milestone = Some(self.phases[p].milestones[m].name.clone());
        }
        self.updated_at = now;
        applied.to = self.status;
        Ok(applied)
    }

    /// Mark a milestone terminal and move the cursor on. The final milestone
    /// of the final phase decides the job outcome.
    fn settle(
        &mut self,
        p: usize,
        m: usize,
        status: StepStatus,
        failure: Option<StepFailure>,
        now: DateTime<Utc>,
        applied: &mut Applied,
    ) {
        let failure_message = failure.as_ref().map(|f| f.message.clone());
        let milestone = &mut self.phases[p].milestones[m];
        milestone.status = status;
        milestone.error = failure;
        applied.milestone = Some(MilestoneChange {
            phase: p,
            index: m,
            name: milestone.name.clone(),
            status,
        });
        self.refresh_progress();

        let phase = &mut self.phases[p];
        if !phase.milestones.iter().all(|m| m.status.is_terminal()) {
            return;
        }
        phase.status = status;

        if p + 1 < self.phases.len() {
            self.current_phase = p + 1;
            self.phases[p + 1].status = StepStatus::InProgress;
            applied.phase_started = Some(p + 1);
            return;
        }

        self.completed_at = Some(now);
        if status == StepStatus::Completed {
            self.status = JobStatus::Completed;
        } else {
            self.status = JobStatus::Failed;
            self.error_message = failure_message;
        }
    }

    fn refresh_progress(&mut self) {
        let total = self.total_milestones();
        if total == 0 {
            return;
        }
        let settled = self.count_milestones(|m| m.status.is_terminal());
        let percent = (settled * 100 / total) as u8;
        self.progress_percent = self.progress_percent.max(percent);
    }

    fn count_milestones(&self, f: impl Fn(&Milestone) -> bool) -> usize {
        self.phases
            .iter()
            .flat_map(|p| p.milestones.iter())
            .filter(|m| f(m))
            .count()
    }

    fn require_transition(&self, to: JobStatus) -> Result<(), JobError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    fn require_running(&self, operation: &'static str) -> Result<(), JobError> {
        if self.status == JobStatus::Running {
            Ok(())
        } else {
            Err(JobError::NotRunning {
                operation,
                status: self.status,
            })
        }
    }
}

fn push_unique(into: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !into.contains(&item) {
            into.push(item);
        }
    }
}
