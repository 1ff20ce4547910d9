use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_core::ids::{JobId, Principal, SessionId};
use tether_telemetry::{names, MetricsRecorder};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    HeartbeatTimeout,
    /// The outbound queue filled up.
    SlowConsumer,
}

/// Emitted once when a session leaves the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disconnect {
    pub session_id: SessionId,
    pub principal: Principal,
    pub job_id: Option<JobId>,
    pub reason: DisconnectReason,
}

/// One live connection.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub principal: Principal,
    pub job_id: Option<JobId>,
    pub auto_approve: bool,
    pub last_heartbeat: Instant,
    tx: mpsc::Sender<String>,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    max_send_queue: usize,
    heartbeat_timeout: Duration,
    disconnects: mpsc::UnboundedSender<Disconnect>,
    metrics: Arc<MetricsRecorder>,
}

impl SessionRegistry {
    pub fn new(
        max_send_queue: usize,
        heartbeat_timeout: Duration,
        metrics: Arc<MetricsRecorder>,
    ) -> (Self, mpsc::UnboundedReceiver<Disconnect>) {
        let (disconnects, rx) = mpsc::unbounded_channel();
        let registry = Self {
            sessions: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            heartbeat_timeout,
            disconnects,
            metrics,
        };
        (registry, rx)
    }

    /// Register a connection. The receiver feeds the socket writer.
    pub fn register(&self, principal: Principal) -> (SessionId, mpsc::Receiver<String>) {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                principal,
                job_id: None,
                auto_approve: false,
                last_heartbeat: Instant::now(),
                tx,
            },
        );
        self.metrics
            .gauge_set(names::SESSIONS_ACTIVE, &[], self.sessions.len() as f64);
        (id, rx)
    }

    pub fn touch_heartbeat(&self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut s) => {
                s.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn bind(&self, id: &SessionId, job_id: JobId) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut s) => {
                debug!(session_id = %id, job_id = %job_id, "session bound");
                s.job_id = Some(job_id);
                true
            }
            None => false,
        }
    }

    pub fn set_auto_approve(&self, id: &SessionId, enabled: bool) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.auto_approve = enabled;
        }
    }

    pub fn lookup(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Queue a frame for the session.
    ///
    /// A full queue closes the session instead of dropping the frame, so the
    /// job pauses and can be resumed without a gap in its message stream.
    pub fn send_to(&self, id: &SessionId, text: String) -> bool {
        let Some(tx) = self.sessions.get(id).map(|s| s.tx.clone()) else {
            return false;
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(text)) => {
                warn!(session_id = %id, len = text.len(), "send queue full, closing session");
                self.unregister(id, DisconnectReason::SlowConsumer);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn sessions_for_job(&self, job_id: &JobId) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|s| s.job_id.as_ref() == Some(job_id))
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove a session. Only the call that actually removes it emits the
    /// disconnect, so repeated calls are harmless.
    pub fn unregister(&self, id: &SessionId, reason: DisconnectReason) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        info!(session_id = %id, principal = %session.principal, ?reason, "session closed");
        self.metrics
            .gauge_set(names::SESSIONS_ACTIVE, &[], self.sessions.len() as f64);
        let event = Disconnect {
            session_id: session.id,
            principal: session.principal,
            job_id: session.job_id,
            reason,
        };
        if self.disconnects.send(event).is_err() {
            debug!(session_id = %id, "no disconnect consumer");
        }
        true
    }

    /// Drop every session silent for longer than the heartbeat timeout.
    pub fn sweep(&self, now: Instant) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| now.saturating_duration_since(s.last_heartbeat) > self.heartbeat_timeout)
            .map(|s| s.id.clone())
            .collect();

        stale
            .into_iter()
            .filter(|id| {
                let removed = self.unregister(id, DisconnectReason::HeartbeatTimeout);
                if removed {
                    warn!(session_id = %id, code = "DISCONNECT", "heartbeat timeout");
                    self.metrics.counter_inc(names::SESSIONS_TIMED_OUT, &[], 1);
                }
                removed
            })
            .collect()
    }
}

pub fn start_sweep_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = registry.sweep(Instant::now());
                    if !dropped.is_empty() {
                        info!(dropped = dropped.len(), "heartbeat sweep");
                    }
                }
            }
        }
    })
}

/// Pump one WebSocket until either side stops, then unregister the session.
///
/// `on_text` sees every inbound text frame in order.
pub async fn handle_ws_connection<F, Fut>(
    socket: WebSocket,
    session_id: SessionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<SessionRegistry>,
    ping_interval: Duration,
    on_text: F,
) where
    F: Fn(String) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_sid = session_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped the session.
                    None => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    trace!(session_id = %writer_sid, "ping");
                }
            }
        }
    });

    let reader_sid = session_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    reader_registry.touch_heartbeat(&reader_sid);
                    on_text(text.to_string()).await;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {
                    reader_registry.touch_heartbeat(&reader_sid);
                }
                WsMessage::Close(_) => break,
                WsMessage::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    registry.unregister(&session_id, DisconnectReason::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(timeout_secs: u64) -> (SessionRegistry, mpsc::UnboundedReceiver<Disconnect>) {
        SessionRegistry::new(4, Duration::from_secs(timeout_secs), Arc::new(MetricsRecorder::new()))
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let (reg, mut disconnects) = registry(90);
        let (id, _rx) = reg.register(Principal::new("alice"));
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.lookup(&id).unwrap().principal, Principal::new("alice"));

        assert!(reg.unregister(&id, DisconnectReason::Closed));
        assert!(!reg.unregister(&id, DisconnectReason::Closed));
        assert_eq!(reg.count(), 0);

        assert_eq!(disconnects.recv().await.unwrap().reason, DisconnectReason::Closed);
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn bind_and_route_by_job() {
        let (reg, _d) = registry(90);
        let (a, _ra) = reg.register(Principal::new("alice"));
        let (_b, _rb) = reg.register(Principal::new("alice"));
        let job = JobId::new();
        assert!(reg.bind(&a, job.clone()));
        assert_eq!(reg.sessions_for_job(&job), vec![a.clone()]);
        assert!(!reg.bind(&SessionId::new(), job));
    }

    #[tokio::test]
    async fn full_queue_closes_the_session() {
        let (reg, mut disconnects) = registry(90);
        let (id, mut rx) = reg.register(Principal::new("alice"));
        let job = JobId::new();
        assert!(reg.bind(&id, job.clone()));
        for i in 0..4 {
            assert!(reg.send_to(&id, format!("m{i}")));
        }
        assert!(!reg.send_to(&id, "overflow".into()));
        assert!(reg.lookup(&id).is_none());

        let event = disconnects.recv().await.unwrap();
        assert_eq!(event.reason, DisconnectReason::SlowConsumer);
        assert_eq!(event.job_id, Some(job));

        // Queued frames still drain, then the writer sees the end.
        for i in 0..4 {
            assert_eq!(rx.recv().await.unwrap(), format!("m{i}"));
        }
        assert!(rx.recv().await.is_none());
        assert!(!reg.send_to(&id, "late".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_silence_disconnects_exactly_once() {
        let (reg, mut disconnects) = registry(90);
        let (quiet, _rq) = reg.register(Principal::new("alice"));
        let (chatty, _rc) = reg.register(Principal::new("bob"));
        let job = JobId::new();
        reg.bind(&quiet, job.clone());

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(30)).await;
            reg.touch_heartbeat(&chatty);
            reg.sweep(Instant::now());
        }
        // 120s of silence and more sweeps after the first removal.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(30)).await;
            reg.touch_heartbeat(&chatty);
            assert!(reg.sweep(Instant::now()).is_empty());
        }

        let event = disconnects.recv().await.unwrap();
        assert_eq!(event.session_id, quiet);
        assert_eq!(event.job_id, Some(job));
        assert_eq!(event.reason, DisconnectReason::HeartbeatTimeout);
        assert!(disconnects.try_recv().is_err());
        assert!(reg.lookup(&chatty).is_some());
        assert_eq!(reg.metrics.counter(names::SESSIONS_TIMED_OUT, &[]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_stops_on_cancel() {
        let (reg, _d) = registry(90);
        let cancel = CancellationToken::new();
        let handle = start_sweep_task(Arc::new(reg), Duration::from_secs(30), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
