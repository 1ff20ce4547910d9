use tracing::instrument;

use tether_core::ids::{JobId, Principal, SessionId};
use tether_core::job::{Job, JobStatus, Phase};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable record storage for jobs.
pub trait JobRecordStore: Send + Sync {
    /// Insert or replace the full record.
    fn save(&self, job: &Job) -> Result<(), StoreError>;
    fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError>;
    /// Newest first.
    fn list_by_owner(&self, owner: &Principal, limit: u32) -> Result<Vec<Job>, StoreError>;
    /// Jobs in `status`, oldest first.
    fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;
}

const SELECT_COLUMNS: &str = "SELECT id, owner, instruction, cwd, status, phases, current_phase,
        current_milestone, progress_percent, files_created, files_modified, context_summary,
        session_id, resume_token, error_message, created_at, started_at, updated_at,
        completed_at, paused_at
 FROM jobs";

pub struct SqliteJobRepo {
    db: Database,
}

impl SqliteJobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::types::ToSql]) -> Result<Vec<Job>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_job(row)?);
            }
            Ok(out)
        })
    }
}

impl JobRecordStore for SqliteJobRepo {
    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status))]
    fn save(&self, job: &Job) -> Result<(), StoreError> {
        let phases = serde_json::to_string(&job.phases)?;
        let created = serde_json::to_string(&job.files_created)?;
        let modified = serde_json::to_string(&job.files_modified)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, owner, instruction, cwd, status, phases, current_phase,
                    current_milestone, progress_percent, files_created, files_modified,
                    context_summary, session_id, resume_token, error_message, created_at,
                    started_at, updated_at, completed_at, paused_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    phases = excluded.phases,
                    current_phase = excluded.current_phase,
                    current_milestone = excluded.current_milestone,
                    progress_percent = excluded.progress_percent,
                    files_created = excluded.files_created,
                    files_modified = excluded.files_modified,
                    context_summary = excluded.context_summary,
                    session_id = excluded.session_id,
                    resume_token = excluded.resume_token,
                    error_message = excluded.error_message,
                    started_at = excluded.started_at,
                    updated_at = excluded.updated_at,
                    completed_at = excluded.completed_at,
                    paused_at = excluded.paused_at",
                rusqlite::params![
                    job.id.as_str(),
                    job.owner.as_str(),
                    job.instruction,
                    job.cwd,
                    job.status.to_string(),
                    phases,
                    job.current_phase as i64,
                    job.current_milestone,
                    job.progress_percent,
                    created,
                    modified,
                    job.context_summary,
                    job.session_id.as_ref().map(|s| s.as_str()),
                    job.resume_token,
                    job.error_message,
                    job.created_at.to_rfc3339(),
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.updated_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.paused_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(job_id = %id))]
    fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        Ok(self.query(&sql, &[&id.as_str()])?.into_iter().next())
    }

    #[instrument(skip(self), fields(owner = %owner))]
    fn list_by_owner(&self, owner: &Principal, limit: u32) -> Result<Vec<Job>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE owner = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2");
        self.query(&sql, &[&owner.as_str(), &limit])
    }

    #[instrument(skip(self), fields(status = %status))]
    fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at ASC");
        self.query(&sql, &[&status.to_string()])
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<Job, StoreError> {
    const T: &str = "jobs";
    let status: String = row_helpers::get(row, 4, T, "status")?;
    let phases: String = row_helpers::get(row, 5, T, "phases")?;
    let current_phase: i64 = row_helpers::get(row, 6, T, "current_phase")?;
    let files_created: String = row_helpers::get(row, 9, T, "files_created")?;
    let files_modified: String = row_helpers::get(row, 10, T, "files_modified")?;
    let session_id: Option<String> = row_helpers::get_opt(row, 12, T, "session_id")?;
    let created_at: String = row_helpers::get(row, 15, T, "created_at")?;
    let updated_at: String = row_helpers::get(row, 17, T, "updated_at")?;

    Ok(Job {
        id: JobId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        owner: Principal::new(row_helpers::get::<String>(row, 1, T, "owner")?),
        instruction: row_helpers::get(row, 2, T, "instruction")?,
        cwd: row_helpers::get(row, 3, T, "cwd")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        phases: row_helpers::parse_json::<Vec<Phase>>(&phases, T, "phases")?,
        current_phase: usize::try_from(current_phase).map_err(|_| StoreError::CorruptRow {
            table: T,
            column: "current_phase",
            detail: format!("negative index {current_phase}"),
        })?,
        current_milestone: row_helpers::get_opt(row, 7, T, "current_milestone")?,
        progress_percent: row_helpers::get(row, 8, T, "progress_percent")?,
        files_created: row_helpers::parse_json(&files_created, T, "files_created")?,
        files_modified: row_helpers::parse_json(&files_modified, T, "files_modified")?,
        context_summary: row_helpers::get(row, 11, T, "context_summary")?,
        session_id: session_id.map(SessionId::from_raw),
        resume_token: row_helpers::get_opt(row, 13, T, "resume_token")?,
        error_message: row_helpers::get_opt(row, 14, T, "error_message")?,
        created_at: row_helpers::parse_time(&created_at, T, "created_at")?,
        started_at: row_helpers::parse_time_opt(row_helpers::get_opt(row, 16, T, "started_at")?, T, "started_at")?,
        updated_at: row_helpers::parse_time(&updated_at, T, "updated_at")?,
        completed_at: row_helpers::parse_time_opt(
            row_helpers::get_opt(row, 18, T, "completed_at")?,
            T,
            "completed_at",
        )?,
        paused_at: row_helpers::parse_time_opt(row_helpers::get_opt(row, 19, T, "paused_at")?, T, "paused_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tether_core::job::{JobMutation, PhaseOutline};

    fn repo() -> SqliteJobRepo {
        SqliteJobRepo::new(Database::in_memory().unwrap())
    }

    fn running_job(owner: &str) -> Job {
        let mut job = Job::new("refactor auth", "/srv/app", Principal::new(owner), Utc::now());
        job.apply(
            JobMutation::Start {
                phases: vec![PhaseOutline {
                    name: "Implement".into(),
                    milestones: vec!["edit".into(), "verify".into()],
                }],
                session_id: SessionId::new(),
            },
            Utc::now(),
        )
        .unwrap();
        job
    }

    #[test]
    fn save_and_load() {
        let repo = repo();
        let job = running_job("alice");
        repo.save(&job).unwrap();
        let loaded = repo.load(&job.id).unwrap().unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn load_missing_is_none() {
        assert!(repo().load(&JobId::new()).unwrap().is_none());
    }

    #[test]
    fn save_overwrites_progress() {
        let repo = repo();
        let mut job = running_job("alice");
        repo.save(&job).unwrap();

        job.apply(JobMutation::CompleteMilestone { summary: Some("done".into()) }, Utc::now())
            .unwrap();
        job.apply(
            JobMutation::RecordFiles {
                created: vec!["src/new.rs".into()],
                modified: vec![],
            },
            Utc::now(),
        )
        .unwrap();
        repo.save(&job).unwrap();

        let loaded = repo.load(&job.id).unwrap().unwrap();
        assert_eq!(loaded.progress_percent, 50);
        assert_eq!(loaded.files_created, vec!["src/new.rs"]);
        assert_eq!(loaded.current_milestone.as_deref(), Some("verify"));
        assert_eq!(loaded.phases[0].summary.as_deref(), Some("done"));
    }

    #[test]
    fn list_by_owner_filters_and_limits() {
        let repo = repo();
        for _ in 0..3 {
            repo.save(&running_job("alice")).unwrap();
        }
        repo.save(&running_job("bob")).unwrap();

        assert_eq!(repo.list_by_owner(&Principal::new("alice"), 10).unwrap().len(), 3);
        assert_eq!(repo.list_by_owner(&Principal::new("alice"), 2).unwrap().len(), 2);
        assert_eq!(repo.list_by_owner(&Principal::new("bob"), 10).unwrap().len(), 1);
    }

    #[test]
    fn list_by_status() {
        let repo = repo();
        let mut paused = running_job("alice");
        paused
            .apply(JobMutation::Pause { resume_token: "t".into() }, Utc::now())
            .unwrap();
        repo.save(&paused).unwrap();
        repo.save(&running_job("alice")).unwrap();

        let found = repo.list_by_status(JobStatus::Paused).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].resume_token.as_deref(), Some("t"));
    }

    #[test]
    fn corrupt_status_is_reported() {
        let db = Database::in_memory().unwrap();
        let repo = SqliteJobRepo::new(db.clone());
        let job = running_job("alice");
        repo.save(&job).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE jobs SET status = 'exploded'", [])?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(
            repo.load(&job.id),
            Err(StoreError::CorruptRow { column: "status", .. })
        ));
    }
}
