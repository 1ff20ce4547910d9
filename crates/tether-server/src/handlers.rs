//! Inbound message handlers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tether_core::errors::ErrorKind;
use tether_core::events::{JobEvent, ToolOutcome};
use tether_core::ids::{JobId, Principal, RequestId, SessionId};
use tether_core::protocol::{self, ClientMessage, ServerMessage};
use tether_engine::{Controller, EngineError, StartRequest};
use tether_telemetry::{names, MetricsRecorder};

use crate::auth::Authenticator;
use crate::sessions::SessionRegistry;

/// Shared state for every connection.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub sessions: Arc<SessionRegistry>,
    pub auth: Arc<dyn Authenticator>,
    pub metrics: Arc<MetricsRecorder>,
    pub heartbeat_interval: Duration,
}

/// Who is talking, passed to every handler.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub principal: Principal,
}

/// Decode one text frame, dispatch it and queue any direct reply.
pub async fn handle_text(state: &AppState, ctx: &SessionContext, text: &str) {
    let reply = match protocol::decode_client(text) {
        Ok(msg) => dispatch(state, ctx, msg).await,
        Err(e) => {
            warn!(session_id = %ctx.session_id, code = "MALFORMED_MESSAGE", error = %e, "malformed frame");
            state.metrics.counter_inc(names::MALFORMED_MESSAGES, &[], 1);
            Some(ServerMessage::error(e.kind(), e.to_string()))
        }
    };
    if let Some(reply) = reply {
        send(state, &ctx.session_id, &reply);
    }
}

pub fn send(state: &AppState, session_id: &SessionId, message: &ServerMessage) -> bool {
    match protocol::encode(message) {
        Ok(text) => state.sessions.send_to(session_id, text),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "encode failed");
            false
        }
    }
}

/// Route a decoded message. Returns the direct reply, if any; job progress
/// reaches the session through the event bridge.
pub async fn dispatch(state: &AppState, ctx: &SessionContext, msg: ClientMessage) -> Option<ServerMessage> {
    debug!(session_id = %ctx.session_id, kind = msg.kind(), "inbound");
    match msg {
        ClientMessage::Execute {
            instruction,
            cwd,
            session_id,
            auto_approve,
        } => execute(state, ctx, instruction, cwd, session_id, auto_approve),
        ClientMessage::Resume { job_id, resume_token } => resume(state, ctx, job_id, resume_token),
        ClientMessage::Status { job_id } => Some(match state.controller.status(&job_id, &ctx.principal) {
            Ok(summary) => ServerMessage::JobStatus(summary),
            Err(e) => engine_error(e),
        }),
        ClientMessage::ToolResult { request_id, result } => {
            let outcome = ToolOutcome::Success(result);
            deliver(state, ctx, JobEvent::ToolResolved { request_id, outcome }).await
        }
        ClientMessage::ToolError { request_id, error } => {
            let outcome = ToolOutcome::failure(ErrorKind::ToolError, error);
            deliver(state, ctx, JobEvent::ToolResolved { request_id, outcome }).await
        }
        ClientMessage::Approval { request_id, approved } => {
            deliver(state, ctx, JobEvent::ApprovalReceived { request_id, approved }).await
        }
        ClientMessage::Cancel { job_id } => {
            let Some(job_id) = job_id.or_else(|| bound_job(state, &ctx.session_id)) else {
                return Some(ServerMessage::error(ErrorKind::NotFound, "no job to cancel"));
            };
            let driving = bound_job(state, &ctx.session_id).as_ref() == Some(&job_id);
            match state.controller.cancel(&job_id, &ctx.principal).await {
                // The driving session hears it from the job loop.
                Ok(()) if driving => None,
                Ok(()) => Some(ServerMessage::Cancelled { job_id }),
                Err(e) => Some(engine_error(e)),
            }
        }
        // The reader already refreshed the heartbeat.
        ClientMessage::Heartbeat => None,
    }
}

fn execute(
    state: &AppState,
    ctx: &SessionContext,
    instruction: String,
    cwd: String,
    client_session: Option<SessionId>,
    auto_approve: bool,
) -> Option<ServerMessage> {
    if let Some(conflict) = already_driving(state, ctx) {
        return Some(conflict);
    }
    if let Some(hint) = client_session {
        debug!(session_id = %ctx.session_id, client_session = %hint, "client session hint ignored");
    }

    state.sessions.set_auto_approve(&ctx.session_id, auto_approve);
    let req = StartRequest {
        instruction,
        cwd,
        owner: ctx.principal.clone(),
        session_id: ctx.session_id.clone(),
        auto_approve,
    };
    match state.controller.start(req) {
        Ok(job) => {
            state.sessions.bind(&ctx.session_id, job.id.clone());
            info!(session_id = %ctx.session_id, job_id = %job.id, auto_approve, "execute accepted");
            None
        }
        Err(e) => Some(engine_error(e)),
    }
}

fn resume(
    state: &AppState,
    ctx: &SessionContext,
    job_id: JobId,
    resume_token: Option<String>,
) -> Option<ServerMessage> {
    if let Some(conflict) = already_driving(state, ctx) {
        return Some(conflict);
    }
    let auto_approve = state
        .sessions
        .lookup(&ctx.session_id)
        .map(|s| s.auto_approve)
        .unwrap_or(false);
    match state.controller.resume(
        &job_id,
        &ctx.principal,
        ctx.session_id.clone(),
        auto_approve,
        resume_token.as_deref(),
    ) {
        Ok(_) => {
            state.sessions.bind(&ctx.session_id, job_id);
            None
        }
        Err(e) => Some(engine_error(e)),
    }
}

async fn deliver(state: &AppState, ctx: &SessionContext, event: JobEvent) -> Option<ServerMessage> {
    let request_id = correlation_id(&event).cloned();
    let Some(job_id) = bound_job(state, &ctx.session_id) else {
        unknown_correlation(state, ctx, request_id.as_ref());
        return None;
    };
    match state.controller.deliver(&job_id, event).await {
        Ok(()) => None,
        // The job stopped; this is a late response.
        Err(EngineError::NoActiveLoop(_)) => {
            unknown_correlation(state, ctx, request_id.as_ref());
            None
        }
        Err(e) => Some(engine_error(e)),
    }
}

fn correlation_id(event: &JobEvent) -> Option<&RequestId> {
    match event {
        JobEvent::ToolResolved { request_id, .. }
        | JobEvent::ApprovalReceived { request_id, .. }
        | JobEvent::DeadlineExpired { request_id } => Some(request_id),
        _ => None,
    }
}

fn unknown_correlation(state: &AppState, ctx: &SessionContext, request_id: Option<&RequestId>) {
    warn!(
        session_id = %ctx.session_id,
        request_id = ?request_id.map(RequestId::as_str),
        code = "UNKNOWN_CORRELATION",
        "response for no running job"
    );
    state.metrics.counter_inc(names::UNKNOWN_CORRELATIONS, &[], 1);
}

/// A session drives at most one live job.
fn already_driving(state: &AppState, ctx: &SessionContext) -> Option<ServerMessage> {
    let job_id = bound_job(state, &ctx.session_id)?;
    if state.controller.bound_session(&job_id).as_ref() != Some(&ctx.session_id) {
        return None;
    }
    Some(ServerMessage::error(
        ErrorKind::ResumeConflict,
        format!("session is already driving {job_id}"),
    ))
}

fn bound_job(state: &AppState, session_id: &SessionId) -> Option<JobId> {
    state.sessions.lookup(session_id).and_then(|s| s.job_id)
}

fn engine_error(e: EngineError) -> ServerMessage {
    ServerMessage::error(e.kind(), e.to_string())
}
