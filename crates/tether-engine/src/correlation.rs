use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use tether_core::ids::RequestId;
use tether_core::tools::ToolCall;

use crate::error::EngineError;

/// A dispatched tool request awaiting its result.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub call: ToolCall,
    /// Zero-based phase and milestone the request is attributed to.
    pub phase: usize,
    pub milestone: usize,
    pub opened_at: Instant,
    pub deadline: Instant,
}

/// Open tool requests of one job, keyed by request id.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<RequestId, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        request_id: RequestId,
        call: ToolCall,
        phase: usize,
        milestone: usize,
        timeout: Duration,
    ) -> Result<&PendingRequest, EngineError> {
        if self.entries.contains_key(&request_id) {
            return Err(EngineError::DuplicateRequest(request_id));
        }
        let now = Instant::now();
        let entry = PendingRequest {
            request_id: request_id.clone(),
            call,
            phase,
            milestone,
            opened_at: now,
            deadline: now + timeout,
        };
        Ok(self.entries.entry(request_id).or_insert(entry))
    }

    /// Remove and return the entry. Unknown ids are logged and ignored.
    pub fn resolve(&mut self, request_id: &RequestId) -> Option<PendingRequest> {
        let entry = self.entries.remove(request_id);
        if entry.is_none() {
            warn!(request_id = %request_id, code = "UNKNOWN_CORRELATION", "no open request for response");
        }
        entry
    }

    /// Ids whose deadline has passed, earliest first. Entries stay open until resolved.
    pub fn expired(&self, now: Instant) -> Vec<RequestId> {
        let mut due: Vec<&PendingRequest> = self
            .entries
            .values()
            .filter(|e| e.deadline <= now)
            .collect();
        due.sort_by_key(|e| e.deadline);
        due.into_iter().map(|e| e.request_id.clone()).collect()
    }

    pub fn release_all(&mut self) -> Vec<RequestId> {
        self.entries.drain().map(|(id, _)| id).collect()
    }

    pub fn is_open(&self, request_id: &RequestId) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
