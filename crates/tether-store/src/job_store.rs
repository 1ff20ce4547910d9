//! Authoritative job state.
//!
//! Live jobs sit in memory behind a per-job lock. Every mutation is applied
//! to a copy, persisted, and only then committed, so a job the store hands
//! out never runs ahead of its durable record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use tether_core::errors::ErrorKind;
use tether_core::ids::{new_resume_token, JobId, Principal, SessionId};
use tether_core::job::{Applied, Job, JobMutation, JobStatus, JobSummary};

use crate::error::StoreError;
use crate::jobs::JobRecordStore;

pub struct JobStore {
    records: Arc<dyn JobRecordStore>,
    live: DashMap<JobId, Arc<Mutex<Job>>>,
}

impl JobStore {
    pub fn new(records: Arc<dyn JobRecordStore>) -> Self {
        Self {
            records,
            live: DashMap::new(),
        }
    }

    #[instrument(skip(self, instruction), fields(owner = %owner))]
    pub fn create(&self, instruction: &str, cwd: &str, owner: Principal) -> Result<Job, StoreError> {
        let job = Job::new(instruction, cwd, owner, Utc::now());
        self.records.save(&job)?;
        self.live
            .insert(job.id.clone(), Arc::new(Mutex::new(job.clone())));
        info!(job_id = %job.id, "job created");
        Ok(job)
    }

    /// Snapshot of a job, from memory or from the record store.
    pub fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        Ok(self.handle(id)?.lock().clone())
    }

    /// Apply a mutation and persist it. On failure nothing changes.
    #[instrument(skip(self, mutation), fields(job_id = %id, mutation = mutation.name()))]
    pub fn apply(&self, id: &JobId, mutation: JobMutation) -> Result<(Job, Applied), StoreError> {
        let handle = self.handle(id)?;
        let mut guard = handle.lock();
        let mut next = guard.clone();
        let applied = next.apply(mutation, Utc::now())?;
        self.records.save(&next)?;
        *guard = next.clone();
        if applied.status_changed() {
            debug!(from = %applied.from, to = %applied.to, "job status changed");
        }
        Ok((next, applied))
    }

    /// Validate and perform a resume in one step.
    ///
    /// A job outside `Paused` is left exactly as it was. A job paused for
    /// longer than `retention` is failed and reported as expired.
    #[instrument(skip(self, token), fields(job_id = %id, owner = %owner))]
    pub fn resume(
        &self,
        id: &JobId,
        owner: &Principal,
        token: Option<&str>,
        session_id: SessionId,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<(Job, Applied), StoreError> {
        let handle = self.handle(id)?;
        let mut guard = handle.lock();

        if guard.owner != *owner {
            return Err(StoreError::Forbidden(id.clone()));
        }
        if guard.status != JobStatus::Paused {
            return Err(StoreError::ResumeConflict {
                job_id: id.clone(),
                status: guard.status,
            });
        }
        if let (Some(given), Some(expected)) = (token, guard.resume_token.as_deref()) {
            if given != expected {
                return Err(StoreError::TokenMismatch(id.clone()));
            }
        }

        let mut next = guard.clone();
        let paused_at = guard.paused_at.unwrap_or(guard.updated_at);
        let paused_for = (now - paused_at).to_std().unwrap_or_default();
        if paused_for > retention {
            next.apply(
                JobMutation::Fail {
                    kind: ErrorKind::ResumeExpired,
                    message: format!("paused for {}s, beyond resume window", paused_for.as_secs()),
                },
                now,
            )?;
            self.records.save(&next)?;
            *guard = next;
            warn!("resume window elapsed, job failed");
            return Err(StoreError::ResumeExpired { job_id: id.clone() });
        }

        let applied = next.apply(JobMutation::Resume { session_id }, now)?;
        self.records.save(&next)?;
        *guard = next.clone();
        info!("job resumed");
        Ok((next, applied))
    }

    pub fn list(&self, owner: &Principal, limit: u32) -> Result<Vec<JobSummary>, StoreError> {
        Ok(self
            .records
            .list_by_owner(owner, limit)?
            .iter()
            .map(Job::summary)
            .collect())
    }

    /// Fail a job even when its record cannot be written.
    ///
    /// Used when the job can no longer be trusted. If persistence fails the
    /// in-memory copy still becomes `Failed` and the write error is logged.
    pub fn force_fail(&self, id: &JobId, message: &str) -> Option<Job> {
        let handle = match self.handle(id) {
            Ok(h) => h,
            Err(e) => {
                error!(job_id = %id, error = %e, "cannot load job to fail it");
                return None;
            }
        };
        let mut guard = handle.lock();
        if guard.status.is_terminal() {
            return Some(guard.clone());
        }
        let fail = JobMutation::Fail {
            kind: ErrorKind::Fatal,
            message: message.to_string(),
        };
        if let Err(e) = guard.apply(fail, Utc::now()) {
            error!(job_id = %id, error = %e, "force fail rejected");
            return Some(guard.clone());
        }
        if let Err(e) = self.records.save(&guard) {
            error!(job_id = %id, error = %e, "failed job could not be persisted");
        }
        Some(guard.clone())
    }

    /// Fail paused jobs whose resume window has elapsed.
    pub fn expire_paused(&self, retention: Duration, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        let mut expired = Vec::new();
        for job in self.records.list_by_status(JobStatus::Paused)? {
            match self.expire_one(&job.id, retention, now) {
                Ok(true) => {
                    self.evict(&job.id);
                    expired.push(job.id);
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "could not expire paused job"),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired paused jobs");
        }
        Ok(expired)
    }

    /// Re-checked under the job lock so a concurrent resume wins.
    fn expire_one(&self, id: &JobId, retention: Duration, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let handle = self.handle(id)?;
        let mut guard = handle.lock();
        if guard.status != JobStatus::Paused {
            return Ok(false);
        }
        let paused_at = guard.paused_at.unwrap_or(guard.updated_at);
        if (now - paused_at).to_std().unwrap_or_default() <= retention {
            return Ok(false);
        }
        let mut next = guard.clone();
        next.apply(
            JobMutation::Fail {
                kind: ErrorKind::ResumeExpired,
                message: "resume window elapsed".into(),
            },
            now,
        )?;
        self.records.save(&next)?;
        *guard = next;
        Ok(true)
    }

    /// Pause jobs left `Running` by a previous process so they can be resumed.
    pub fn pause_orphaned(&self) -> Result<Vec<JobId>, StoreError> {
        let mut paused = Vec::new();
        for job in self.records.list_by_status(JobStatus::Running)? {
            if self.live.contains_key(&job.id) {
                continue;
            }
            let pause = JobMutation::Pause {
                resume_token: new_resume_token(),
            };
            match self.apply(&job.id, pause) {
                Ok(_) => {
                    self.evict(&job.id);
                    paused.push(job.id);
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "could not pause orphaned job"),
            }
        }
        if !paused.is_empty() {
            info!(count = paused.len(), "paused jobs interrupted by restart");
        }
        Ok(paused)
    }

    /// Drop the in-memory copy. The record stays authoritative.
    pub fn evict(&self, id: &JobId) {
        self.live.remove(id);
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn handle(&self, id: &JobId) -> Result<Arc<Mutex<Job>>, StoreError> {
        if let Some(h) = self.live.get(id) {
            return Ok(h.clone());
        }
        let job = self
            .records
            .load(id)?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        Ok(self
            .live
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(job)))
            .clone())
    }
}
