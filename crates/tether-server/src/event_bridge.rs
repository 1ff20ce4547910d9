use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tether_core::protocol;
use tether_engine::Outbound;

use crate::sessions::SessionRegistry;

/// Forwards controller output to the sessions attached to each job.
///
/// A message goes to the session the job loop is bound to. If that session is
/// gone it falls back to any session bound to the job.
pub fn create_bridge(
    registry: Arc<SessionRegistry>,
    mut rx: broadcast::Receiver<Outbound>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(outbound) => {
                    route(&registry, &outbound);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event bridge lagged, dropped messages");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("event bridge channel closed");
                    break;
                }
            }
        }
    })
}

pub fn route(registry: &SessionRegistry, outbound: &Outbound) -> usize {
    let text = match protocol::encode(&outbound.message) {
        Ok(t) => t,
        Err(e) => {
            warn!(job_id = %outbound.job_id, error = %e, "encode failed");
            return 0;
        }
    };

    if let Some(session_id) = &outbound.session_id {
        if registry.send_to(session_id, text.clone()) {
            return 1;
        }
    }
    let mut delivered = 0;
    for session_id in registry.sessions_for_job(&outbound.job_id) {
        if Some(&session_id) != outbound.session_id.as_ref() && registry.send_to(&session_id, text.clone()) {
            delivered += 1;
        }
    }
    if delivered == 0 {
        debug!(job_id = %outbound.job_id, kind = outbound.message.kind(), "no session for job message");
    }
    delivered
}
