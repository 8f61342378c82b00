use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_DONE: &str = "done";
pub const STATUS_FAILED: &str = "failed";

pub const JOB_ANALYZE: &str = "analyze";
pub const JOB_EXTRACT: &str = "extract";
pub const JOB_MINE_PATTERNS: &str = "mine-patterns";
pub const JOB_GROUP_EVENTS: &str = "group-events";
pub const JOB_DISCOVER_WORKFLOWS: &str = "discover-workflows";
pub const JOB_MATCH_WORKFLOW: &str = "match-workflow";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type JobResult<T> = Result<T, JobError>;

pub fn create_job(conn: &mut SqliteConnection, job_type: &str, payload: Value) -> JobResult<Job> {
    create_job_with_id(conn, &Uuid::new_v4().to_string(), job_type, payload)
}

pub fn create_job_with_id(
    conn: &mut SqliteConnection,
    job_id: &str,
    job_type: &str,
    payload: Value,
) -> JobResult<Job> {
    let now = Utc::now().naive_utc();
    let new_job = NewJob {
        id: job_id.to_string(),
        job_type: job_type.to_string(),
        payload: payload.to_string(),
        status: STATUS_QUEUED.to_string(),
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(jobs::table)
        .values(&new_job)
        .execute(conn)?;
    Ok(jobs::table.find(&new_job.id).first(conn)?)
}

pub fn mark_running(conn: &mut SqliteConnection, job_id: &str) -> JobResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_RUNNING),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn update_progress(conn: &mut SqliteConnection, job_id: &str, progress: f64) -> JobResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::progress.eq(progress.clamp(0.0, 1.0)),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_done(conn: &mut SqliteConnection, job_id: &str, result: Value) -> JobResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_DONE),
            jobs::progress.eq(1.0),
            jobs::result.eq(Some(result.to_string())),
            jobs::error.eq::<Option<String>>(None),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_failed(conn: &mut SqliteConnection, job_id: &str, error_message: &str) -> JobResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_FAILED),
            jobs::error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn get_job(conn: &mut SqliteConnection, job_id: &str) -> JobResult<Option<Job>> {
    Ok(jobs::table.find(job_id).first(conn).optional()?)
}
