use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{NewStep, NewStepEvent, NewStepObject, Step};
use crate::routes::{parse_timestamp, to_rfc3339};
use crate::schema::{objects, step_events, step_objects, steps};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct StepListQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct EventRef {
    pub bucket_id: String,
    pub event_id: i64,
}

#[derive(Deserialize)]
pub struct CreateStepRequest {
    pub name: String,
    pub started_at: String,
    pub ended_at: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub events: Vec<EventRef>,
}

#[derive(Deserialize)]
pub struct UpdateStepRequest {
    pub name: Option<String>,
    pub data: Option<Value>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub id: Uuid,
    pub name: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration: f64,
    pub data: Value,
    pub event_refs: Vec<Value>,
    pub object_ids: Vec<String>,
}

fn step_response(conn: &mut diesel::SqliteConnection, step: Step) -> AppResult<StepResponse> {
    let event_refs: Vec<(String, i64, i32)> = step_events::table
        .filter(step_events::step_id.eq(&step.id))
        .order(step_events::position.asc())
        .select((
            step_events::bucket_id,
            step_events::event_id,
            step_events::position,
        ))
        .load(conn)?;
    let object_ids: Vec<String> = step_objects::table
        .filter(step_objects::step_id.eq(&step.id))
        .order(step_objects::object_id.asc())
        .select(step_objects::object_id)
        .load(conn)?;

    Ok(StepResponse {
        id: Uuid::parse_str(&step.id).map_err(AppError::internal)?,
        name: step.name,
        started_at: to_rfc3339(step.started_at),
        ended_at: to_rfc3339(step.ended_at),
        duration: step.duration,
        data: serde_json::from_str(&step.data).unwrap_or(Value::Null),
        event_refs: event_refs
            .into_iter()
            .map(|(bucket, event, position)| {
                serde_json::json!({
                    "bucket_id": bucket,
                    "event_id": event,
                    "position": position,
                })
            })
            .collect(),
        object_ids,
    })
}

pub async fn list_steps(
    State(state): State<AppState>,
    Query(params): Query<StepListQuery>,
) -> AppResult<Json<Vec<StepResponse>>> {
    let mut conn = state.db()?;
    let mut query = steps::table
        .order(steps::started_at.asc())
        .limit(params.limit.unwrap_or(100).clamp(1, 1000))
        .into_boxed();
    if let Some(start) = params.start.as_deref() {
        query = query.filter(steps::started_at.ge(parse_timestamp(start, "start")?));
    }
    if let Some(end) = params.end.as_deref() {
        query = query.filter(steps::ended_at.le(parse_timestamp(end, "end")?));
    }
    let rows: Vec<Step> = query.load(&mut conn)?;
    rows.into_iter()
        .map(|step| step_response(&mut conn, step))
        .collect::<AppResult<Vec<_>>>()
        .map(Json)
}

/// Manual step promotion: a user groups events into one logical activity.
pub async fn create_step(
    State(state): State<AppState>,
    Json(payload): Json<CreateStepRequest>,
) -> AppResult<Json<StepResponse>> {
    if payload.name.trim().is_empty() {
        return Err(AppError::invalid_argument("name must not be empty"));
    }
    let started_at = parse_timestamp(&payload.started_at, "started_at")?;
    let ended_at = parse_timestamp(&payload.ended_at, "ended_at")?;
    if ended_at < started_at {
        return Err(AppError::invalid_argument("ended_at precedes started_at"));
    }

    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let row = NewStep {
        id: Uuid::new_v4().to_string(),
        name: payload.name.trim().to_string(),
        started_at,
        ended_at,
        duration: payload.duration,
        data: if payload.data.is_null() {
            "{}".to_string()
        } else {
            payload.data.to_string()
        },
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(steps::table)
        .values(&row)
        .execute(&mut conn)?;
    for (position, event_ref) in payload.events.iter().enumerate() {
        diesel::insert_into(step_events::table)
            .values(NewStepEvent {
                step_id: row.id.clone(),
                bucket_id: event_ref.bucket_id.clone(),
                event_id: event_ref.event_id,
                position: position as i32,
            })
            .execute(&mut conn)?;
    }

    let created: Step = steps::table.find(&row.id).first(&mut conn)?;
    Ok(Json(step_response(&mut conn, created)?))
}

pub async fn get_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StepResponse>> {
    let mut conn = state.db()?;
    let row: Option<Step> = steps::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let row = row.ok_or_else(|| AppError::not_found("step"))?;
    Ok(Json(step_response(&mut conn, row)?))
}

pub async fn update_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStepRequest>,
) -> AppResult<Json<StepResponse>> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let existing: Option<Step> = steps::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let existing = existing.ok_or_else(|| AppError::not_found("step"))?;

    diesel::update(steps::table.find(&existing.id))
        .set((
            steps::name.eq(payload.name.unwrap_or(existing.name)),
            steps::data.eq(payload
                .data
                .map(|data| data.to_string())
                .unwrap_or(existing.data)),
            steps::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    let updated: Step = steps::table.find(&existing.id).first(&mut conn)?;
    Ok(Json(step_response(&mut conn, updated)?))
}

pub async fn delete_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let deleted = diesel::delete(steps::table.find(id.to_string())).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found("step"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct AttachObjectRequest {
    pub object_id: Uuid,
}

pub async fn attach_object(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AttachObjectRequest>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;

    let step: Option<Step> = steps::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    if step.is_none() {
        return Err(AppError::not_found("step"));
    }
    let object_exists: i64 = objects::table
        .filter(objects::id.eq(payload.object_id.to_string()))
        .count()
        .get_result(&mut conn)?;
    if object_exists == 0 {
        return Err(AppError::not_found("object"));
    }

    diesel::insert_into(step_objects::table)
        .values(NewStepObject {
            step_id: id.to_string(),
            object_id: payload.object_id.to_string(),
        })
        .on_conflict_do_nothing()
        .execute(&mut conn)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn detach_object(
    State(state): State<AppState>,
    Path((id, object_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let removed = diesel::delete(
        step_objects::table
            .filter(step_objects::step_id.eq(id.to_string()))
            .filter(step_objects::object_id.eq(object_id.to_string())),
    )
    .execute(&mut conn)?;
    if removed == 0 {
        return Err(AppError::not_found("link"));
    }
    Ok(StatusCode::NO_CONTENT)
}
