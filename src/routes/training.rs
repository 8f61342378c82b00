use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::ReviewTask;
use crate::routes::to_rfc3339;
use crate::schema::review_tasks;
use crate::state::AppState;
use crate::store;

pub const TASK_PENDING: &str = "pending";
pub const TASK_CONFIRMED: &str = "confirmed";
pub const TASK_REJECTED: &str = "rejected";
pub const TASK_CORRECTED: &str = "corrected";

#[derive(Deserialize)]
pub struct PendingQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct ReviewTaskResponse {
    pub id: Uuid,
    pub bucket_id: String,
    pub event_id: i64,
    #[serde(rename = "type")]
    pub object_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier_key: Option<String>,
    pub confidence: f64,
    pub provenance: String,
    pub status: String,
    pub created_at: String,
}

impl TryFrom<ReviewTask> for ReviewTaskResponse {
    type Error = AppError;

    fn try_from(row: ReviewTask) -> Result<Self, AppError> {
        Ok(Self {
            id: Uuid::parse_str(&row.id).map_err(AppError::internal)?,
            bucket_id: row.bucket_id,
            event_id: row.event_id,
            object_type: row.object_type,
            name: row.object_name,
            identifier_key: row.identifier_key,
            confidence: row.confidence,
            provenance: row.provenance,
            status: row.status,
            created_at: to_rfc3339(row.created_at),
        })
    }
}

pub async fn list_pending(
    State(state): State<AppState>,
    Query(params): Query<PendingQuery>,
) -> AppResult<Json<Vec<ReviewTaskResponse>>> {
    let mut conn = state.db()?;
    let rows: Vec<ReviewTask> = review_tasks::table
        .filter(review_tasks::status.eq(TASK_PENDING))
        .order(review_tasks::created_at.asc())
        .limit(params.limit.unwrap_or(50).clamp(1, 500))
        .load(&mut conn)?;
    rows.into_iter()
        .map(ReviewTaskResponse::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map(Json)
}

fn pending_task(
    conn: &mut diesel::SqliteConnection,
    task_id: &Uuid,
) -> AppResult<ReviewTask> {
    let task: Option<ReviewTask> = review_tasks::table
        .find(task_id.to_string())
        .first(conn)
        .optional()?;
    let task = task.ok_or_else(|| AppError::not_found("review task"))?;
    if task.status != TASK_PENDING {
        return Err(AppError::precondition_failed(format!(
            "review task already {}",
            task.status
        )));
    }
    Ok(task)
}

fn close_task(
    conn: &mut diesel::SqliteConnection,
    task: &ReviewTask,
    status: &str,
    reason: Option<&str>,
) -> AppResult<()> {
    diesel::update(review_tasks::table.find(&task.id))
        .set((
            review_tasks::status.eq(status),
            review_tasks::reason.eq(reason.map(|r| r.to_string())),
            review_tasks::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Confirming a candidate materialises the object and the event link.
pub async fn confirm_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let task = pending_task(&mut conn, &task_id)?;

    let key = task.identifier_key.as_deref().unwrap_or("identifier");
    let data = json!({ key: task.object_name });
    let object = store::upsert_object(&mut conn, &task.object_type, &task.object_name, &data, false)
        .map_err(|err| match err {
            store::StoreError::UnknownObjectType(name) => AppError::precondition_failed(format!(
                "candidate references unknown object type {name}"
            )),
            other => AppError::internal(other),
        })?;
    store::link_event_to_object(
        &mut conn,
        &task.bucket_id,
        task.event_id,
        &object.id,
        &task.provenance,
        task.confidence,
    )
    .map_err(AppError::internal)?;
    close_task(&mut conn, &task, TASK_CONFIRMED, None)?;

    Ok(Json(json!({ "object_id": object.id, "status": TASK_CONFIRMED })))
}

#[derive(Deserialize, Default)]
pub struct RejectTaskRequest {
    pub reason: Option<String>,
}

pub async fn reject_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    payload: Option<Json<RejectTaskRequest>>,
) -> AppResult<Json<Value>> {
    let reason = payload.and_then(|Json(body)| body.reason);
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let task = pending_task(&mut conn, &task_id)?;
    close_task(&mut conn, &task, TASK_REJECTED, reason.as_deref())?;
    Ok(Json(json!({ "status": TASK_REJECTED })))
}

#[derive(Deserialize)]
pub struct CorrectTaskRequest {
    pub object_type: Option<String>,
    pub name: Option<String>,
    pub identifier_key: Option<String>,
}

/// Correcting a candidate links the event to the corrected object instead.
pub async fn correct_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(payload): Json<CorrectTaskRequest>,
) -> AppResult<Json<Value>> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let task = pending_task(&mut conn, &task_id)?;

    let object_type = payload.object_type.unwrap_or_else(|| task.object_type.clone());
    let name = payload.name.unwrap_or_else(|| task.object_name.clone());
    let key = payload
        .identifier_key
        .or_else(|| task.identifier_key.clone())
        .unwrap_or_else(|| "identifier".to_string());
    let data = json!({ key: name });

    let object = store::upsert_object(&mut conn, &object_type, &name, &data, false).map_err(
        |err| match err {
            store::StoreError::UnknownObjectType(unknown) => AppError::precondition_failed(
                format!("correction references unknown object type {unknown}"),
            ),
            other => AppError::internal(other),
        },
    )?;
    store::link_event_to_object(
        &mut conn,
        &task.bucket_id,
        task.event_id,
        &object.id,
        "manual",
        1.0,
    )
    .map_err(AppError::internal)?;
    close_task(&mut conn, &task, TASK_CORRECTED, None)?;

    Ok(Json(json!({
        "object_id": object.id,
        "type": object.object_type,
        "name": object.name,
        "status": TASK_CORRECTED,
    })))
}
