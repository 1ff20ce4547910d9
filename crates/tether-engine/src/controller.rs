//! Orchestration controller: owns the per-job loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use tether_core::events::JobEvent;
use tether_core::ids::{JobId, Principal, SessionId};
use tether_core::job::{Job, JobMutation, JobSummary};
use tether_core::protocol::ServerMessage;
use tether_store::JobStore;
use tether_telemetry::{names, MetricsRecorder};

use crate::config::ControllerConfig;
use crate::error::EngineError;
use crate::job_loop::{JobLoop, LoopContext, Outbound};
use crate::planner::Planner;

#[derive(Clone, Debug)]
pub struct StartRequest {
    pub instruction: String,
    pub cwd: String,
    pub owner: Principal,
    pub session_id: SessionId,
    pub auto_approve: bool,
}

struct LoopHandle {
    tx: mpsc::Sender<JobEvent>,
    session_id: SessionId,
    /// Distinguishes a resumed loop from the one it replaced.
    generation: u64,
}

pub struct Controller {
    ctx: LoopContext,
    loops: Arc<DashMap<JobId, LoopHandle>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Controller {
    pub fn new(
        store: Arc<JobStore>,
        planner: Arc<dyn Planner>,
        config: ControllerConfig,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let (outbound, _) = broadcast::channel(config.outbound_queue.max(1));
        Self {
            ctx: LoopContext {
                store,
                planner,
                config: Arc::new(config),
                outbound,
                metrics,
            },
            loops: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.ctx.outbound.subscribe()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.ctx.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.ctx.metrics
    }

    pub fn active_jobs(&self) -> usize {
        self.loops.len()
    }

    /// Session a running job is bound to.
    pub fn bound_session(&self, job_id: &JobId) -> Option<SessionId> {
        self.loops.get(job_id).map(|h| h.session_id.clone())
    }

    /// Create a job and start driving it.
    #[instrument(skip_all, fields(owner = %req.owner, session_id = %req.session_id))]
    pub fn start(&self, req: StartRequest) -> Result<Job, EngineError> {
        let job = self.ctx.store.create(&req.instruction, &req.cwd, req.owner)?;
        info!(job_id = %job.id, cwd = %job.cwd, "job created");
        self.ctx.metrics.counter_inc(names::JOBS_STARTED, &[("via", "execute")], 1);
        self.emit(
            &job.id,
            Some(req.session_id.clone()),
            ServerMessage::JobStarted { job_id: job.id.clone() },
        );
        self.spawn_loop(job.id.clone(), req.session_id, req.auto_approve, JobEvent::Start)?;
        Ok(job)
    }

    /// Rebind a paused job to `session_id` and continue from its snapshot.
    #[instrument(skip_all, fields(job_id = %job_id, owner = %owner, session_id = %session_id))]
    pub fn resume(
        &self,
        job_id: &JobId,
        owner: &Principal,
        session_id: SessionId,
        auto_approve: bool,
        token: Option<&str>,
    ) -> Result<Job, EngineError> {
        let (job, _) = self.ctx.store.resume(
            job_id,
            owner,
            token,
            session_id.clone(),
            self.ctx.config.resume_retention(),
            Utc::now(),
        )?;
        self.ctx.metrics.counter_inc(names::JOBS_STARTED, &[("via", "resume")], 1);
        let resumed = JobEvent::ResumeRequested {
            session_id: session_id.clone(),
        };
        self.spawn_loop(job_id.clone(), session_id, auto_approve, resumed)?;
        Ok(job)
    }

    /// Hand an event to a running job.
    pub async fn deliver(&self, job_id: &JobId, event: JobEvent) -> Result<(), EngineError> {
        let tx = self
            .loops
            .get(job_id)
            .map(|h| h.tx.clone())
            .ok_or_else(|| EngineError::NoActiveLoop(job_id.clone()))?;
        tx.send(event)
            .await
            .map_err(|_| EngineError::NoActiveLoop(job_id.clone()))
    }

    /// The session is gone: every job bound to it pauses.
    pub async fn disconnected(&self, session_id: &SessionId) -> usize {
        let bound: Vec<(JobId, mpsc::Sender<JobEvent>)> = self
            .loops
            .iter()
            .filter(|h| h.session_id == *session_id)
            .map(|h| (h.key().clone(), h.tx.clone()))
            .collect();
        for (job_id, tx) in &bound {
            let event = JobEvent::Disconnected {
                session_id: session_id.clone(),
            };
            if tx.send(event).await.is_err() {
                debug!(job_id = %job_id, "loop already stopped");
            }
        }
        bound.len()
    }

    #[instrument(skip_all, fields(job_id = %job_id, owner = %owner))]
    pub async fn cancel(&self, job_id: &JobId, owner: &Principal) -> Result<(), EngineError> {
        self.authorize(job_id, owner)?;
        match self.deliver(job_id, JobEvent::Cancel).await {
            Ok(()) => return Ok(()),
            Err(EngineError::NoActiveLoop(_)) => {}
            Err(e) => return Err(e),
        }

        // No loop: a created or paused job is cancelled in place.
        self.ctx.store.apply(job_id, JobMutation::Cancel)?;
        info!("job cancelled");
        self.ctx
            .metrics
            .counter_inc(names::JOBS_FINISHED, &[("outcome", "cancelled")], 1);
        self.emit(
            job_id,
            None,
            ServerMessage::Cancelled {
                job_id: job_id.clone(),
            },
        );
        Ok(())
    }

    pub fn status(&self, job_id: &JobId, owner: &Principal) -> Result<JobSummary, EngineError> {
        Ok(self.authorize(job_id, owner)?.summary())
    }

    pub fn list(&self, owner: &Principal, limit: u32) -> Result<Vec<JobSummary>, EngineError> {
        Ok(self.ctx.store.list(owner, limit)?)
    }

    /// Pause jobs a previous process left running.
    pub fn recover(&self) -> Result<Vec<JobId>, EngineError> {
        Ok(self.ctx.store.pause_orphaned()?)
    }

    /// Periodically fail paused jobs past the resume window.
    pub fn spawn_maintenance(&self) {
        let store = self.ctx.store.clone();
        let retention = self.ctx.config.resume_retention();
        let period = self.ctx.config.maintenance_interval();
        let cancel = self.shutdown.child_token();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = store.expire_paused(retention, Utc::now()) {
                            warn!(error = %e, "paused job expiry failed");
                        }
                    }
                }
            }
        });
    }

    /// Pause every running job and wait for the loops to finish.
    pub async fn shutdown(&self) {
        info!(active = self.loops.len(), "controller shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn authorize(&self, job_id: &JobId, owner: &Principal) -> Result<Job, EngineError> {
        let job = self.ctx.store.get(job_id)?;
        if job.owner != *owner {
            return Err(EngineError::Forbidden(job_id.clone()));
        }
        Ok(job)
    }

    fn spawn_loop(
        &self,
        job_id: JobId,
        session_id: SessionId,
        auto_approve: bool,
        first: JobEvent,
    ) -> Result<(), EngineError> {
        let (tx, rx) = mpsc::channel(self.ctx.config.event_queue.max(1));
        tx.try_send(first)
            .map_err(|_| EngineError::NoActiveLoop(job_id.clone()))?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.loops.insert(
            job_id.clone(),
            LoopHandle {
                tx,
                session_id: session_id.clone(),
                generation,
            },
        );
        self.ctx.metrics.gauge_add(names::JOBS_ACTIVE, &[], 1.0);

        let job_loop = JobLoop::new(job_id.clone(), session_id, auto_approve, self.ctx.clone());
        let loops = self.loops.clone();
        let ctx = self.ctx.clone();
        let cancel = self.shutdown.child_token();
        self.tracker.spawn(async move {
            job_loop.run(rx, cancel).await;
            ctx.metrics.gauge_add(names::JOBS_ACTIVE, &[], -1.0);
            // A resumed loop may already own this job.
            if loops.remove_if(&job_id, |_, h| h.generation == generation).is_some() {
                ctx.planner.release(&job_id);
                ctx.store.evict(&job_id);
            }
        });
        Ok(())
    }

    fn emit(&self, job_id: &JobId, session_id: Option<SessionId>, message: ServerMessage) {
        let outbound = Outbound {
            job_id: job_id.clone(),
            session_id,
            message,
        };
        if self.ctx.outbound.send(outbound).is_err() {
            debug!(job_id = %job_id, "no outbound subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tether_core::errors::ErrorKind;
    use tether_core::events::ToolOutcome;
    use tether_core::ids::RequestId;
    use tether_core::job::{JobStatus, StepStatus};
    use tether_store::{Database, SqliteJobRepo, StoreError};

    use crate::planner::ScriptedPlanner;

    const DARK_MODE: &str = r#"{
        "phases": [
            {"name": "Explore", "milestones": [
                {"name": "survey", "steps": [{"tool": "list_files", "args": {"path": "src"}}]}
            ]},
            {"name": "Implement", "milestones": [
                {"name": "read theme", "steps": [{"tool": "read_file", "args": {"file_path": "theme.css"}}]},
                {"name": "add toggle", "steps": [
                    {"tool": "write_file", "args": {"file_path": "toggle.js", "content": "x"}}
                ]}
            ]}
        ]
    }"#;

    fn controller() -> Controller {
        let store = Arc::new(JobStore::new(Arc::new(SqliteJobRepo::new(
            Database::in_memory().unwrap(),
        ))));
        Controller::new(
            store,
            Arc::new(ScriptedPlanner::from_json(DARK_MODE).unwrap()),
            ControllerConfig::default(),
            Arc::new(MetricsRecorder::new()),
        )
    }

    fn request(owner: &str, session_id: SessionId) -> StartRequest {
        StartRequest {
            instruction: "add dark mode toggle".into(),
            cwd: "/repo".into(),
            owner: Principal::new(owner),
            session_id,
            auto_approve: true,
        }
    }

    async fn next_where(
        rx: &mut broadcast::Receiver<Outbound>,
        pred: impl Fn(&ServerMessage) -> bool,
    ) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let out = rx.recv().await.unwrap();
                if pred(&out.message) {
                    return out.message;
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    async fn next_request(rx: &mut broadcast::Receiver<Outbound>, tool: &str) -> RequestId {
        match next_where(rx, |m| matches!(m, ServerMessage::ToolRequest { tool: t, .. } if t == tool)).await {
            ServerMessage::ToolRequest { request_id, .. } => request_id,
            _ => unreachable!(),
        }
    }

    async fn reply(c: &Controller, job_id: &JobId, request_id: RequestId) {
        c.deliver(
            job_id,
            JobEvent::ToolResolved {
                request_id,
                outcome: ToolOutcome::Success(json!({"ok": true})),
            },
        )
        .await
        .unwrap();
    }

    async fn wait_for_loops(c: &Controller, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while c.active_jobs() != n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("loops did not settle");
    }

    #[tokio::test]
    async fn pause_and_resume_without_replaying_completed_phase() {
        let c = controller();
        let mut rx = c.subscribe();
        let first = SessionId::new();
        let job = c.start(request("alice", first.clone())).unwrap();

        let survey = next_request(&mut rx, "list_files").await;
        reply(&c, &job.id, survey).await;
        let phase = next_where(&mut rx, |m| matches!(m, ServerMessage::PhaseStart { .. })).await;
        assert!(matches!(phase, ServerMessage::PhaseStart { phase: 2, total_phases: 2, .. }));
        let theme = next_request(&mut rx, "read_file").await;
        reply(&c, &job.id, theme).await;
        next_request(&mut rx, "write_file").await;

        assert_eq!(c.disconnected(&first).await, 1);
        let paused = next_where(&mut rx, |m| matches!(m, ServerMessage::Paused { .. })).await;
        let token = match paused {
            ServerMessage::Paused {
                resume_token,
                phase,
                milestone,
                ..
            } => {
                assert_eq!(phase, 2);
                assert_eq!(milestone.as_deref(), Some("add toggle"));
                resume_token
            }
            _ => unreachable!(),
        };
        wait_for_loops(&c, 0).await;
        assert_eq!(c.status(&job.id, &Principal::new("alice")).unwrap().status, JobStatus::Paused);

        let second = SessionId::new();
        let resumed = c
            .resume(&job.id, &Principal::new("alice"), second.clone(), true, Some(&token))
            .unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
        assert_eq!(resumed.phases[0].status, StepStatus::Completed);

        let msg = next_where(&mut rx, |m| {
            matches!(m, ServerMessage::ToolRequest { .. } | ServerMessage::Resumed { .. })
        })
        .await;
        assert!(matches!(msg, ServerMessage::Resumed { phase: 2, .. }));
        let write = next_request(&mut rx, "write_file").await;
        assert_eq!(c.bound_session(&job.id), Some(second));
        reply(&c, &job.id, write).await;

        let done = next_where(&mut rx, |m| matches!(m, ServerMessage::Complete { .. })).await;
        assert!(matches!(done, ServerMessage::Complete { phases_completed: 2, milestones_completed: 3, .. }));
        wait_for_loops(&c, 0).await;
    }

    #[tokio::test]
    async fn resume_of_running_job_conflicts_and_leaves_it_alone() {
        let c = controller();
        let mut rx = c.subscribe();
        let job = c.start(request("alice", SessionId::new())).unwrap();
        next_request(&mut rx, "list_files").await;

        let err = c
            .resume(&job.id, &Principal::new("alice"), SessionId::new(), false, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::ResumeConflict { .. })));
        assert_eq!(err.kind(), ErrorKind::ResumeConflict);
        assert_eq!(c.active_jobs(), 1);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_releases_open_requests() {
        let c = controller();
        let mut rx = c.subscribe();
        let job = c.start(request("alice", SessionId::new())).unwrap();
        let open = next_request(&mut rx, "list_files").await;

        assert!(matches!(
            c.cancel(&job.id, &Principal::new("mallory")).await,
            Err(EngineError::Forbidden(_))
        ));
        c.cancel(&job.id, &Principal::new("alice")).await.unwrap();
        next_where(&mut rx, |m| matches!(m, ServerMessage::Cancelled { .. })).await;
        wait_for_loops(&c, 0).await;

        assert!(matches!(
            c.deliver(
                &job.id,
                JobEvent::ToolResolved {
                    request_id: open,
                    outcome: ToolOutcome::Success(json!([])),
                },
            )
            .await,
            Err(EngineError::NoActiveLoop(_))
        ));
        assert_eq!(c.status(&job.id, &Principal::new("alice")).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn paused_job_can_be_cancelled_without_a_loop() {
        let c = controller();
        let mut rx = c.subscribe();
        let session = SessionId::new();
        let job = c.start(request("alice", session.clone())).unwrap();
        next_request(&mut rx, "list_files").await;
        c.disconnected(&session).await;
        wait_for_loops(&c, 0).await;

        c.cancel(&job.id, &Principal::new("alice")).await.unwrap();
        next_where(&mut rx, |m| matches!(m, ServerMessage::Cancelled { .. })).await;
        assert_eq!(c.status(&job.id, &Principal::new("alice")).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn shutdown_pauses_running_jobs() {
        let c = controller();
        let mut rx = c.subscribe();
        let job = c.start(request("alice", SessionId::new())).unwrap();
        next_request(&mut rx, "list_files").await;

        c.shutdown().await;
        assert_eq!(c.active_jobs(), 0);
        let summary = c.status(&job.id, &Principal::new("alice")).unwrap();
        assert_eq!(summary.status, JobStatus::Paused);
        assert_eq!(c.metrics().gauge(names::JOBS_ACTIVE, &[]), 0.0);
    }

    #[tokio::test]
    async fn status_is_scoped_to_owner() {
        let c = controller();
        let job = c.start(request("alice", SessionId::new())).unwrap();
        assert!(matches!(
            c.status(&job.id, &Principal::new("bob")),
            Err(EngineError::Forbidden(_))
        ));
        assert_eq!(c.list(&Principal::new("alice"), 10).unwrap().len(), 1);
        assert!(c.list(&Principal::new("bob"), 10).unwrap().is_empty());
        c.shutdown().await;
    }
}
