//! One dispatch loop per running job.
//!
//! [`JobLoop::handle`] is the whole transition logic. [`JobLoop::run`] only
//! adds the event channel, the expiry tick and shutdown.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_core::errors::ErrorKind;
use tether_core::events::{JobEvent, ToolOutcome};
use tether_core::ids::{new_resume_token, JobId, RequestId, SessionId};
use tether_core::job::{Applied, Job, JobMutation, JobStatus, StepStatus};
use tether_core::protocol::ServerMessage;
use tether_core::tools::ToolCall;
use tether_store::{JobStore, StoreError};
use tether_telemetry::{names, MetricsRecorder};

use crate::approval::{ApprovalDecision, PendingApproval, PendingApprovals, Verdict};
use crate::config::ControllerConfig;
use crate::correlation::CorrelationTable;
use crate::planner::{Action, Planner, StepOutcome};

/// A message for the sessions attached to a job.
#[derive(Clone, Debug)]
pub struct Outbound {
    pub job_id: JobId,
    /// Session the loop is bound to; the bridge falls back to job bindings.
    pub session_id: Option<SessionId>,
    pub message: ServerMessage,
}

/// Shared collaborators handed to every loop.
#[derive(Clone)]
pub struct LoopContext {
    pub store: Arc<JobStore>,
    pub planner: Arc<dyn Planner>,
    pub config: Arc<ControllerConfig>,
    pub outbound: broadcast::Sender<Outbound>,
    pub metrics: Arc<MetricsRecorder>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Continue,
    Exit,
}

pub struct JobLoop {
    job_id: JobId,
    session_id: SessionId,
    auto_approve: bool,
    ctx: LoopContext,
    requests: CorrelationTable,
    approvals: PendingApprovals,
}

impl JobLoop {
    pub fn new(job_id: JobId, session_id: SessionId, auto_approve: bool, ctx: LoopContext) -> Self {
        Self {
            job_id,
            session_id,
            auto_approve,
            ctx,
            requests: CorrelationTable::new(),
            approvals: PendingApprovals::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.requests.len() + self.approvals.len()
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<JobEvent>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.ctx.config.expiry_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let state = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(job_id = %self.job_id, "shutdown, pausing job");
                    self.pause()
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => self.pause(),
                },
                _ = tick.tick() => self.expire(Instant::now()).await,
            };
            if state == LoopState::Exit {
                break;
            }
        }

        // Senders that raced the exit still land here; a cancel is applied to
        // the stopped job, anything else is stale.
        events.close();
        while let Ok(event) = events.try_recv() {
            match event {
                JobEvent::Cancel => {
                    self.cancel();
                }
                other => debug!(job_id = %self.job_id, event = other.name(), "dropped event after exit"),
            }
        }

        debug!(job_id = %self.job_id, "job loop finished");
    }

    pub async fn handle(&mut self, event: JobEvent) -> LoopState {
        debug!(job_id = %self.job_id, event = event.name(), "job event");
        match event {
            JobEvent::Start => self.start().await,
            JobEvent::ResumeRequested { session_id } => {
                self.session_id = session_id;
                self.resumed().await
            }
            JobEvent::ToolResolved { request_id, outcome } => self.tool_resolved(request_id, outcome).await,
            JobEvent::ApprovalReceived { request_id, approved } => {
                self.approval_received(ApprovalDecision::new(request_id, approved))
                    .await
            }
            JobEvent::DeadlineExpired { request_id } => self.deadline_expired(request_id).await,
            JobEvent::Disconnected { session_id } => {
                if session_id != self.session_id {
                    debug!(job_id = %self.job_id, session_id = %session_id, "disconnect of unbound session ignored");
                    return LoopState::Continue;
                }
                info!(job_id = %self.job_id, session_id = %session_id, "bound session lost, pausing job");
                self.pause()
            }
            JobEvent::Cancel => self.cancel(),
        }
    }

    /// Turn every passed deadline into a `DeadlineExpired` event.
    pub async fn expire(&mut self, now: Instant) -> LoopState {
        let mut due = self.approvals.expired(now);
        due.extend(self.requests.expired(now));
        for request_id in due {
            if self.handle(JobEvent::DeadlineExpired { request_id }).await == LoopState::Exit {
                return LoopState::Exit;
            }
        }
        LoopState::Continue
    }

    async fn start(&mut self) -> LoopState {
        let job = match self.ctx.store.get(&self.job_id) {
            Ok(job) => job,
            Err(e) => return self.fatal(&format!("job record unavailable: {e}")),
        };
        let outline = match self.ctx.planner.outline(&job).await {
            Ok(outline) => outline,
            Err(e) => return self.fail_job(ErrorKind::Fatal, format!("no phase outline: {e}")),
        };

        let start = JobMutation::Start {
            phases: outline,
            session_id: self.session_id.clone(),
        };
        match self.ctx.store.apply(&self.job_id, start) {
            Ok((job, applied)) => {
                info!(job_id = %self.job_id, phases = job.phases.len(), "job running");
                self.emit_applied(&job, &applied);
                self.drive(None).await
            }
            Err(StoreError::Transition(e)) => {
                self.fail_job(ErrorKind::Fatal, format!("cannot start job: {e}"))
            }
            Err(e) => self.fatal(&e.to_string()),
        }
    }

    async fn resumed(&mut self) -> LoopState {
        let job = match self.ctx.store.get(&self.job_id) {
            Ok(job) => job,
            Err(e) => return self.fatal(&format!("job record unavailable: {e}")),
        };
        self.send(ServerMessage::Resumed {
            job_id: self.job_id.clone(),
            phase: job.current_phase + 1,
            milestone: job.current_milestone.clone(),
        });
        if let Some(phase) = job.phases.get(job.current_phase) {
            self.send(ServerMessage::PhaseStart {
                phase: job.current_phase + 1,
                total_phases: job.phases.len(),
                name: phase.name.clone(),
                milestones: phase.milestone_names(),
            });
        }
        self.drive(None).await
    }

    async fn tool_resolved(&mut self, request_id: RequestId, outcome: ToolOutcome) -> LoopState {
        let Some(pending) = self.requests.resolve(&request_id) else {
            self.ctx.metrics.counter_inc(names::UNKNOWN_CORRELATIONS, &[], 1);
            return LoopState::Continue;
        };
        let tool = pending.call.tool.as_str();
        self.ctx.metrics.histogram_observe(
            names::TOOL_LATENCY_MS,
            &[("tool", tool)],
            pending.opened_at.elapsed().as_millis() as f64,
        );

        match &outcome {
            ToolOutcome::Success(result) => {
                if let Some((created, modified)) = touched_files(&pending.call, result) {
                    if self.mutate(JobMutation::RecordFiles { created, modified }).is_none() {
                        return LoopState::Exit;
                    }
                }
            }
            ToolOutcome::Failure { kind, message } => {
                self.ctx
                    .metrics
                    .counter_inc(names::TOOL_FAILURES, &[("tool", tool), ("kind", kind.as_str())], 1);
                warn!(job_id = %self.job_id, request_id = %request_id, tool, %message, "tool request failed");
            }
        }

        let step = StepOutcome {
            request_id,
            call: pending.call.clone(),
            outcome,
        };
        if !self.attributed_to_cursor(pending.phase, pending.milestone) {
            debug!(job_id = %self.job_id, request_id = %step.request_id, "outcome for a settled milestone");
            return LoopState::Continue;
        }
        self.drive(Some(step)).await
    }

    async fn approval_received(&mut self, decision: ApprovalDecision) -> LoopState {
        let pending = match self.approvals.decide(&decision, Instant::now()) {
            None => {
                self.ctx.metrics.counter_inc(names::UNKNOWN_CORRELATIONS, &[], 1);
                return LoopState::Continue;
            }
            Some(Verdict::Lapsed(pending)) => return self.approval_lapsed(&decision.request_id, pending).await,
            Some(Verdict::Denied(pending)) => pending,
            Some(Verdict::Approved(pending)) => {
                self.ctx.metrics.counter_inc(names::APPROVALS, &[("outcome", "approved")], 1);
                info!(job_id = %self.job_id, request_id = %decision.request_id, tool = %pending.call.tool, "approved");
                // The approved effect travels under a fresh id.
                if let Err(e) = self.send_request(RequestId::new(), pending.call, pending.phase, pending.milestone) {
                    return self.fatal(&e.to_string());
                }
                return LoopState::Continue;
            }
        };

        self.ctx.metrics.counter_inc(names::APPROVALS, &[("outcome", "denied")], 1);
        let message = format!("approval denied: {}", pending.call.describe());
        self.fail_attributed(pending.phase, pending.milestone, ErrorKind::ApprovalDenied, message)
            .await
    }

    async fn approval_lapsed(&mut self, request_id: &RequestId, pending: PendingApproval) -> LoopState {
        self.ctx.metrics.counter_inc(names::APPROVALS, &[("outcome", "timed_out")], 1);
        warn!(job_id = %self.job_id, request_id = %request_id, tool = %pending.call.tool, "approval deadline elapsed");
        let message = format!("approval timed out: {}", pending.call.describe());
        self.fail_attributed(pending.phase, pending.milestone, ErrorKind::ApprovalTimeout, message)
            .await
    }

    async fn deadline_expired(&mut self, request_id: RequestId) -> LoopState {
        self.ctx.metrics.counter_inc(names::DEADLINES_EXPIRED, &[], 1);
        if let Some(pending) = self.approvals.take(&request_id) {
            return self.approval_lapsed(&request_id, pending).await;
        }
        if self.requests.is_open(&request_id) {
            warn!(job_id = %self.job_id, request_id = %request_id, "tool request deadline elapsed");
            let outcome = ToolOutcome::failure(ErrorKind::Timeout, "no response before deadline");
            return self.tool_resolved(request_id, outcome).await;
        }
        LoopState::Continue
    }

    /// Ask the planner for work until something is in flight or the job ends.
    async fn drive(&mut self, mut last: Option<StepOutcome>) -> LoopState {
        loop {
            let mut job = match self.ctx.store.get(&self.job_id) {
                Ok(job) => job,
                Err(e) => return self.fatal(&format!("job record unavailable: {e}")),
            };
            if job.status != JobStatus::Running {
                return self.exit_if_settled(&job);
            }
            let Some((p, m)) = job.cursor() else {
                return self.fatal("running job has no active milestone");
            };

            if job.phases[p].milestones[m].status == StepStatus::Pending {
                match self.mutate(JobMutation::StartMilestone) {
                    Some(started) => job = started,
                    None => return LoopState::Exit,
                }
                last = None;
            }

            let actions = match self.ctx.planner.plan(&job, last.take().as_ref()).await {
                Ok(actions) => actions,
                Err(e) => return self.fail_job(ErrorKind::Fatal, format!("planner failed: {e}")),
            };

            let mut settled = false;
            let mut dispatched = false;
            for action in actions {
                match action {
                    Action::Dispatch(call) => {
                        if let Err(e) = self.dispatch(call, p, m) {
                            return self.fatal(&e.to_string());
                        }
                        dispatched = true;
                    }
                    Action::UpdateContext(summary) => {
                        if self.mutate(JobMutation::UpdateContext { summary }).is_none() {
                            return LoopState::Exit;
                        }
                    }
                    Action::CompleteMilestone { summary } => {
                        if self.mutate(JobMutation::CompleteMilestone { summary }).is_none() {
                            return LoopState::Exit;
                        }
                        settled = true;
                        break;
                    }
                    Action::FailMilestone { reason } => {
                        let fail = JobMutation::FailMilestone {
                            kind: ErrorKind::ToolError,
                            message: reason,
                        };
                        if self.mutate(fail).is_none() {
                            return LoopState::Exit;
                        }
                        settled = true;
                        break;
                    }
                    Action::Abandon { reason } => {
                        return self.fail_job(ErrorKind::ToolError, reason);
                    }
                }
            }

            if settled {
                continue;
            }
            if dispatched || self.in_flight() > 0 {
                return LoopState::Continue;
            }
            // Nothing in flight and nothing planned: the milestone would stall.
            let fail = JobMutation::FailMilestone {
                kind: ErrorKind::ToolError,
                message: "planner produced no action".into(),
            };
            if self.mutate(fail).is_none() {
                return LoopState::Exit;
            }
        }
    }

    fn dispatch(&mut self, call: ToolCall, phase: usize, milestone: usize) -> Result<(), crate::EngineError> {
        let request_id = RequestId::new();
        if !self.ctx.config.gate().requires_approval(&call.tool, self.auto_approve) {
            return self.send_request(request_id, call, phase, milestone);
        }

        let description = call.describe();
        self.approvals.open(
            request_id.clone(),
            call.clone(),
            phase,
            milestone,
            self.ctx.config.approval_timeout(),
        )?;
        self.ctx.metrics.counter_inc(names::APPROVALS, &[("outcome", "requested")], 1);
        info!(job_id = %self.job_id, request_id = %request_id, tool = %call.tool, "awaiting approval");
        self.send(ServerMessage::ApprovalRequest {
            request_id,
            tool: call.tool,
            args: call.args,
            description,
        });
        Ok(())
    }

    fn send_request(
        &mut self,
        request_id: RequestId,
        call: ToolCall,
        phase: usize,
        milestone: usize,
    ) -> Result<(), crate::EngineError> {
        let timeout = self.ctx.config.timeout_for(&call.tool);
        self.requests
            .open(request_id.clone(), call.clone(), phase, milestone, timeout)?;
        self.ctx
            .metrics
            .counter_inc(names::TOOL_REQUESTS, &[("tool", call.tool.as_str())], 1);
        debug!(job_id = %self.job_id, request_id = %request_id, tool = %call.tool, ?timeout, "tool request");
        self.send(ServerMessage::ToolRequest {
            request_id,
            tool: call.tool,
            args: call.args,
        });
        Ok(())
    }

    /// Fail the milestone a request belonged to, if it is still the active one.
    async fn fail_attributed(&mut self, phase: usize, milestone: usize, kind: ErrorKind, message: String) -> LoopState {
        if !self.attributed_to_cursor(phase, milestone) {
            return LoopState::Continue;
        }
        if self.mutate(JobMutation::FailMilestone { kind, message }).is_none() {
            return LoopState::Exit;
        }
        self.drive(None).await
    }

    fn attributed_to_cursor(&self, phase: usize, milestone: usize) -> bool {
        self.ctx
            .store
            .get(&self.job_id)
            .map(|job| job.cursor() == Some((phase, milestone)))
            .unwrap_or(false)
    }

    fn release_all(&mut self) -> usize {
        let released = self.requests.release_all().len() + self.approvals.release_all().len();
        if released > 0 {
            info!(job_id = %self.job_id, released, "released open requests");
        }
        released
    }

    fn pause(&mut self) -> LoopState {
        self.release_all();
        let token = new_resume_token();
        match self.ctx.store.apply(&self.job_id, JobMutation::Pause { resume_token: token.clone() }) {
            Ok((job, _)) => {
                info!(job_id = %self.job_id, phase = job.current_phase + 1, "job paused");
                self.finished("paused");
                self.send(ServerMessage::Paused {
                    job_id: self.job_id.clone(),
                    resume_token: token,
                    phase: job.current_phase + 1,
                    milestone: job.current_milestone.clone(),
                });
                LoopState::Exit
            }
            Err(StoreError::Transition(e)) => {
                debug!(job_id = %self.job_id, error = %e, "pause not applicable");
                LoopState::Exit
            }
            Err(e) => self.fatal(&e.to_string()),
        }
    }

    fn cancel(&mut self) -> LoopState {
        self.release_all();
        match self.ctx.store.apply(&self.job_id, JobMutation::Cancel) {
            Ok(_) => {
                info!(job_id = %self.job_id, "job cancelled");
                self.finished("cancelled");
                self.send(ServerMessage::Cancelled {
                    job_id: self.job_id.clone(),
                });
                LoopState::Exit
            }
            Err(StoreError::Transition(e)) => {
                warn!(job_id = %self.job_id, error = %e, "cancel rejected");
                LoopState::Exit
            }
            Err(e) => self.fatal(&e.to_string()),
        }
    }

    /// Fail the job with a reportable reason.
    fn fail_job(&mut self, kind: ErrorKind, message: String) -> LoopState {
        self.release_all();
        let fail = JobMutation::Fail {
            kind,
            message: message.clone(),
        };
        match self.ctx.store.apply(&self.job_id, fail) {
            Ok(_) => {
                warn!(job_id = %self.job_id, code = kind.as_str(), %message, "job failed");
                self.finished("failed");
                self.send(ServerMessage::Error {
                    message,
                    recoverable: false,
                    phase: None,
                    milestone: None,
                    code: Some(kind),
                });
                LoopState::Exit
            }
            Err(e) => self.fatal(&e.to_string()),
        }
    }

    /// State can no longer be trusted. Fail the job even if it cannot be persisted.
    fn fatal(&mut self, detail: &str) -> LoopState {
        self.release_all();
        error!(job_id = %self.job_id, detail, "fatal job error");
        self.ctx.store.force_fail(&self.job_id, detail);
        self.finished("failed");
        self.send(ServerMessage::error(ErrorKind::Fatal, detail));
        LoopState::Exit
    }

    /// Apply a mutation and report what moved. `None` means the job was failed.
    fn mutate(&mut self, mutation: JobMutation) -> Option<Job> {
        match self.ctx.store.apply(&self.job_id, mutation) {
            Ok((job, applied)) => {
                self.emit_applied(&job, &applied);
                if job.status.is_terminal() {
                    self.release_all();
                }
                Some(job)
            }
            Err(e) => {
                self.fatal(&e.to_string());
                None
            }
        }
    }

    fn emit_applied(&self, job: &Job, applied: &Applied) {
        let total_phases = job.phases.len();

        if let Some(change) = &applied.milestone {
            self.send(ServerMessage::MilestoneUpdate {
                phase: change.phase + 1,
                milestone: change.name.clone(),
                status: change.status,
            });
            if change.status.is_terminal() {
                self.send(ServerMessage::Progress {
                    phase: change.phase + 1,
                    total_phases,
                    milestone: Some(change.name.clone()),
                    percent: job.progress_percent,
                    message: format!("milestone '{}' {}", change.name, change.status),
                });
            }
            if change.status == StepStatus::Failed {
                let failure = job
                    .milestone(change.phase, change.index)
                    .and_then(|m| m.error.clone());
                self.send(ServerMessage::Error {
                    message: failure
                        .as_ref()
                        .map(|f| f.message.clone())
                        .unwrap_or_else(|| format!("milestone '{}' failed", change.name)),
                    recoverable: job.status == JobStatus::Running,
                    phase: Some(change.phase + 1),
                    milestone: Some(change.name.clone()),
                    code: failure.map(|f| f.kind),
                });
            }
        }

        if let Some(p) = applied.phase_started {
            let phase = &job.phases[p];
            info!(job_id = %self.job_id, phase = p + 1, name = %phase.name, "phase started");
            self.send(ServerMessage::PhaseStart {
                phase: p + 1,
                total_phases,
                name: phase.name.clone(),
                milestones: phase.milestone_names(),
            });
        }

        if applied.status_changed() {
            match applied.to {
                JobStatus::Completed => {
                    info!(job_id = %self.job_id, "job completed");
                    self.finished("completed");
                    self.send(ServerMessage::Complete {
                        summary: completion_summary(job),
                        files_changed: job.files_changed(),
                        phases_completed: job.phases_completed(),
                        milestones_completed: job.completed_milestones(),
                    });
                }
                JobStatus::Failed => {
                    warn!(job_id = %self.job_id, "job failed on its final milestone");
                    self.finished("failed");
                }
                _ => {}
            }
        }
    }

    fn finished(&self, outcome: &str) {
        self.ctx
            .metrics
            .counter_inc(names::JOBS_FINISHED, &[("outcome", outcome)], 1);
    }

    fn exit_if_settled(&self, job: &Job) -> LoopState {
        if job.status.is_terminal() || job.status == JobStatus::Paused {
            LoopState::Exit
        } else {
            LoopState::Continue
        }
    }

    fn send(&self, message: ServerMessage) {
        let outbound = Outbound {
            job_id: self.job_id.clone(),
            session_id: Some(self.session_id.clone()),
            message,
        };
        if self.ctx.outbound.send(outbound).is_err() {
            debug!(job_id = %self.job_id, "no outbound subscribers, message dropped");
        }
    }
}

fn completion_summary(job: &Job) -> String {
    if !job.context_summary.is_empty() {
        return job.context_summary.clone();
    }
    format!(
        "completed {} of {} milestones across {} phases",
        job.completed_milestones(),
        job.total_milestones(),
        job.phases.len()
    )
}

/// Paths a successful tool result created or modified.
fn touched_files(call: &ToolCall, result: &Value) -> Option<(Vec<String>, Vec<String>)> {
    let path = call.args.get("file_path").and_then(Value::as_str)?.to_string();
    match call.tool.as_str() {
        "write_file" => {
            let created = result.get("created").and_then(Value::as_bool).unwrap_or(false);
            if created {
                Some((vec![path], Vec::new()))
            } else {
                Some((Vec::new(), vec![path]))
            }
        }
        "edit_file" | "delete_file" => Some((Vec::new(), vec![path])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ScriptedPlanner;
    use serde_json::json;
    use tether_core::ids::Principal;
    use tether_store::{Database, SqliteJobRepo};

    const PLAN: &str = r#"{
        "phases": [
            {"name": "Explore", "milestones": [
                {"name": "scan", "steps": [{"tool": "list_files", "args": {"path": "."}}]}
            ]},
            {"name": "Implement", "milestones": [
                {"name": "write config", "steps": [
                    {"tool": "write_file", "args": {"file_path": "config.json", "content": "{}"}}
                ]},
                {"name": "verify", "steps": [{"tool": "read_file", "args": {"file_path": "config.json"}}]}
            ]}
        ]
    }"#;

    struct Harness {
        job_loop: JobLoop,
        store: Arc<JobStore>,
        rx: broadcast::Receiver<Outbound>,
        job_id: JobId,
    }

    fn harness(plan: &str, auto_approve: bool) -> Harness {
        let store = Arc::new(JobStore::new(Arc::new(SqliteJobRepo::new(
            Database::in_memory().unwrap(),
        ))));
        let (outbound, rx) = broadcast::channel(256);
        let ctx = LoopContext {
            store: store.clone(),
            planner: Arc::new(ScriptedPlanner::from_json(plan).unwrap()),
            config: Arc::new(ControllerConfig::default()),
            outbound,
            metrics: Arc::new(MetricsRecorder::new()),
        };
        let job = store
            .create("add dark mode toggle", "/repo", Principal::new("alice"))
            .unwrap();
        Harness {
            job_loop: JobLoop::new(job.id.clone(), SessionId::new(), auto_approve, ctx),
            store,
            rx,
            job_id: job.id,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(o) = rx.try_recv() {
            out.push(o.message);
        }
        out
    }

    fn last_tool_request(messages: &[ServerMessage]) -> RequestId {
        messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::ToolRequest { request_id, .. } => Some(request_id.clone()),
                _ => None,
            })
            .expect("no tool_request emitted")
    }

    fn approval_request(messages: &[ServerMessage]) -> RequestId {
        messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::ApprovalRequest { request_id, .. } => Some(request_id.clone()),
                _ => None,
            })
            .expect("no approval_request emitted")
    }

    async fn resolve_ok(h: &mut Harness, request_id: RequestId, result: Value) -> LoopState {
        h.job_loop
            .handle(JobEvent::ToolResolved {
                request_id,
                outcome: ToolOutcome::Success(result),
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn start_emits_phase_and_first_request() {
        let mut h = harness(PLAN, false);
        assert_eq!(h.job_loop.handle(JobEvent::Start).await, LoopState::Continue);

        let msgs = drain(&mut h.rx);
        assert!(matches!(&msgs[0], ServerMessage::PhaseStart { phase: 1, total_phases: 2, name, .. } if name == "Explore"));
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::ToolRequest { tool, .. } if tool == "list_files")));
        assert_eq!(h.store.get(&h.job_id).unwrap().status, JobStatus::Running);
        assert_eq!(h.job_loop.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_with_approval() {
        let mut h = harness(PLAN, false);
        h.job_loop.handle(JobEvent::Start).await;
        let list = last_tool_request(&drain(&mut h.rx));
        resolve_ok(&mut h, list, json!(["README.md"])).await;

        let msgs = drain(&mut h.rx);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::PhaseStart { phase: 2, .. })));
        let approval = approval_request(&msgs);
        assert!(
            !msgs.iter().any(|m| matches!(m, ServerMessage::ToolRequest { tool, .. } if tool == "write_file")),
            "mutating request must wait for approval"
        );

        h.job_loop
            .handle(JobEvent::ApprovalReceived {
                request_id: approval.clone(),
                approved: true,
            })
            .await;
        let msgs = drain(&mut h.rx);
        let write = last_tool_request(&msgs);
        assert_ne!(write, approval, "approved effect gets a fresh id");

        resolve_ok(&mut h, write, json!({"created": true})).await;
        let read = last_tool_request(&drain(&mut h.rx));
        assert_eq!(resolve_ok(&mut h, read, json!({"content": "{}"})).await, LoopState::Exit);

        let msgs = drain(&mut h.rx);
        match msgs.last().unwrap() {
            ServerMessage::Complete {
                files_changed,
                phases_completed,
                milestones_completed,
                ..
            } => {
                assert_eq!(files_changed, &vec!["config.json".to_string()]);
                assert_eq!(*phases_completed, 2);
                assert_eq!(*milestones_completed, 3);
            }
            other => panic!("expected complete, got {other:?}"),
        }
        let job = h.store.get(&h.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.files_created, vec!["config.json"]);
    }

    #[tokio::test(start_paused = true)]
    async fn approval_timeout_fails_milestone_not_job() {
        let mut h = harness(PLAN, false);
        h.job_loop.handle(JobEvent::Start).await;
        let list = last_tool_request(&drain(&mut h.rx));
        resolve_ok(&mut h, list, json!([])).await;
        drain(&mut h.rx);

        tokio::time::advance(h.job_loop.ctx.config.approval_timeout() + std::time::Duration::from_secs(1)).await;
        assert_eq!(h.job_loop.expire(Instant::now()).await, LoopState::Continue);

        let msgs = drain(&mut h.rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::Error { code: Some(ErrorKind::ApprovalTimeout), recoverable: true, .. }
        )));
        assert!(!msgs.iter().any(|m| matches!(m, ServerMessage::ToolRequest { tool, .. } if tool == "write_file")));

        let job = h.store.get(&h.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.phases[1].milestones[0].status, StepStatus::Failed);
        assert_eq!(job.current_milestone.as_deref(), Some("verify"));
    }

    #[tokio::test(start_paused = true)]
    async fn approval_after_deadline_is_not_honored() {
        let mut h = harness(PLAN, false);
        h.job_loop.handle(JobEvent::Start).await;
        let list = last_tool_request(&drain(&mut h.rx));
        resolve_ok(&mut h, list, json!([])).await;
        let approval = approval_request(&drain(&mut h.rx));

        // The expiry tick has not run yet when the approval lands.
        tokio::time::advance(h.job_loop.ctx.config.approval_timeout() + std::time::Duration::from_secs(1)).await;
        h.job_loop
            .handle(JobEvent::ApprovalReceived {
                request_id: approval,
                approved: true,
            })
            .await;

        let msgs = drain(&mut h.rx);
        let writes = msgs
            .iter()
            .filter(|m| matches!(m, ServerMessage::ToolRequest { tool, .. } if tool == "write_file"))
            .count();
        assert_eq!(writes, 0);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::Error { code: Some(ErrorKind::ApprovalTimeout), .. }
        )));
        let job = h.store.get(&h.job_id).unwrap();
        assert_eq!(job.phases[1].milestones[0].status, StepStatus::Failed);
        assert!(job.files_created.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn denied_approval_never_dispatches() {
        let mut h = harness(PLAN, false);
        h.job_loop.handle(JobEvent::Start).await;
        let list = last_tool_request(&drain(&mut h.rx));
        resolve_ok(&mut h, list, json!([])).await;
        let approval = approval_request(&drain(&mut h.rx));

        h.job_loop
            .handle(JobEvent::ApprovalReceived {
                request_id: approval,
                approved: false,
            })
            .await;
        let msgs = drain(&mut h.rx);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::Error { code: Some(ErrorKind::ApprovalDenied), .. })));
        assert!(!msgs.iter().any(|m| matches!(m, ServerMessage::ToolRequest { tool, .. } if tool == "write_file")));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_approve_skips_gate_for_writes() {
        let mut h = harness(PLAN, true);
        h.job_loop.handle(JobEvent::Start).await;
        let list = last_tool_request(&drain(&mut h.rx));
        resolve_ok(&mut h, list, json!([])).await;
        let msgs = drain(&mut h.rx);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::ToolRequest { tool, .. } if tool == "write_file")));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_reaches_planner_as_failure() {
        let mut h = harness(PLAN, false);
        h.job_loop.handle(JobEvent::Start).await;
        drain(&mut h.rx);

        tokio::time::advance(std::time::Duration::from_secs(31)).await;
        h.job_loop.expire(Instant::now()).await;

        let msgs = drain(&mut h.rx);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::MilestoneUpdate { milestone, status: StepStatus::Failed, .. } if milestone == "scan")));
        assert_eq!(h.job_loop.ctx.metrics.counter(names::TOOL_FAILURES, &[("kind", "TIMEOUT"), ("tool", "list_files")]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_and_duplicate_results_are_ignored() {
        let mut h = harness(PLAN, false);
        h.job_loop.handle(JobEvent::Start).await;
        let list = last_tool_request(&drain(&mut h.rx));
        resolve_ok(&mut h, list.clone(), json!([])).await;
        let before = h.store.get(&h.job_id).unwrap();
        drain(&mut h.rx);

        assert_eq!(resolve_ok(&mut h, list, json!([])).await, LoopState::Continue);
        assert_eq!(resolve_ok(&mut h, RequestId::new(), json!([])).await, LoopState::Continue);
        assert!(drain(&mut h.rx).is_empty());
        assert_eq!(h.store.get(&h.job_id).unwrap(), before);
        assert_eq!(h.job_loop.ctx.metrics.counter(names::UNKNOWN_CORRELATIONS, &[]), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_pauses_and_releases() {
        let mut h = harness(PLAN, false);
        h.job_loop.handle(JobEvent::Start).await;
        drain(&mut h.rx);

        let other = JobEvent::Disconnected {
            session_id: SessionId::new(),
        };
        assert_eq!(h.job_loop.handle(other).await, LoopState::Continue);

        let bound = JobEvent::Disconnected {
            session_id: h.job_loop.session_id.clone(),
        };
        assert_eq!(h.job_loop.handle(bound).await, LoopState::Exit);
        assert_eq!(h.job_loop.in_flight(), 0);

        let job = h.store.get(&h.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        match drain(&mut h.rx).last().unwrap() {
            ServerMessage::Paused { resume_token, phase, milestone, .. } => {
                assert_eq!(Some(resume_token), job.resume_token.as_ref());
                assert_eq!(*phase, 1);
                assert_eq!(milestone.as_deref(), Some("scan"));
            }
            other => panic!("expected paused, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queued_behind_exit_is_applied() {
        let h = harness(PLAN, false);
        let mut rx = h.rx;
        let (tx, events) = mpsc::channel(8);
        tx.send(JobEvent::Start).await.unwrap();
        tx.send(JobEvent::Disconnected {
            session_id: h.job_loop.session_id.clone(),
        })
        .await
        .unwrap();
        tx.send(JobEvent::Cancel).await.unwrap();

        h.job_loop.run(events, CancellationToken::new()).await;

        assert_eq!(h.store.get(&h.job_id).unwrap().status, JobStatus::Cancelled);
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::Paused { .. })));
        assert!(matches!(msgs.last(), Some(ServerMessage::Cancelled { .. })));
        assert!(tx.send(JobEvent::Cancel).await.is_err(), "queue is closed after exit");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_everything() {
        let mut h = harness(PLAN, false);
        h.job_loop.handle(JobEvent::Start).await;
        assert_eq!(h.job_loop.in_flight(), 1);
        assert_eq!(h.job_loop.handle(JobEvent::Cancel).await, LoopState::Exit);
        assert_eq!(h.job_loop.in_flight(), 0);
        assert_eq!(h.store.get(&h.job_id).unwrap().status, JobStatus::Cancelled);
        assert!(matches!(drain(&mut h.rx).last(), Some(ServerMessage::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_outline_fails_created_job() {
        let mut h = harness(r#"{"phases": []}"#, false);
        assert_eq!(h.job_loop.handle(JobEvent::Start).await, LoopState::Exit);
        let job = h.store.get(&h.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_at.is_none());
        assert!(matches!(
            drain(&mut h.rx).last(),
            Some(ServerMessage::Error { recoverable: false, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_fails_job() {
        let plan = r#"{"phases": [{"name": "Build", "milestones": [
            {"name": "compile", "steps": [{"tool": "list_files", "on_error": "abandon"}]},
            {"name": "never"}
        ]}]}"#;
        let mut h = harness(plan, false);
        h.job_loop.handle(JobEvent::Start).await;
        let id = last_tool_request(&drain(&mut h.rx));
        let state = h
            .job_loop
            .handle(JobEvent::ToolResolved {
                request_id: id,
                outcome: ToolOutcome::failure(ErrorKind::ToolError, "permission denied"),
            })
            .await;
        assert_eq!(state, LoopState::Exit);
        assert_eq!(h.store.get(&h.job_id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn touched_files_classification() {
        let write = ToolCall::new("write_file", json!({"file_path": "a.rs"}));
        assert_eq!(
            touched_files(&write, &json!({"created": true})),
            Some((vec!["a.rs".into()], vec![]))
        );
        assert_eq!(
            touched_files(&write, &json!({"created": false})),
            Some((vec![], vec!["a.rs".into()]))
        );
        let edit = ToolCall::new("edit_file", json!({"file_path": "b.rs"}));
        assert_eq!(touched_files(&edit, &json!({})), Some((vec![], vec!["b.rs".into()])));
        let read = ToolCall::new("read_file", json!({"file_path": "c.rs"}));
        assert_eq!(touched_files(&read, &json!({})), None);
    }
}
