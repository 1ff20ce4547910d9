/// SQL DDL for the job database.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    instruction TEXT NOT NULL,
    cwd TEXT NOT NULL,
    status TEXT NOT NULL,
    phases TEXT NOT NULL DEFAULT '[]',
    current_phase INTEGER NOT NULL DEFAULT 0,
    current_milestone TEXT,
    progress_percent INTEGER NOT NULL DEFAULT 0,
    files_created TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    context_summary TEXT NOT NULL DEFAULT '',
    session_id TEXT,
    resume_token TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    paused_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
