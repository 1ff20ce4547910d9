pub mod database;
pub mod error;
pub mod job_store;
pub mod jobs;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use job_store::JobStore;
pub use jobs::{JobRecordStore, SqliteJobRepo};
