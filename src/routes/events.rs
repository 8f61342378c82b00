use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::llm::{self, TaskPriority};
use crate::models::{Event, NewEvent};
use crate::ontology::{extractor, learning};
use crate::routes::objects::EventResponse;
use crate::routes::{parse_timestamp, to_rfc3339};
use crate::schema::events;
use crate::state::AppState;
use crate::store;

const DEFAULT_EVENT_LIMIT: i64 = 500;

#[derive(Deserialize)]
pub struct IngestEvent {
    pub id: i64,
    pub timestamp: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub data: Value,
}

/// Watcher ingest: appends events, runs the textual rules inline, and hands
/// screenshot/OCR payloads to the enrichment queue without blocking.
pub async fn ingest_events(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Json(payload): Json<Vec<IngestEvent>>,
) -> AppResult<Json<Value>> {
    if payload.is_empty() {
        return Ok(Json(json!({ "inserted": 0, "links_created": 0 })));
    }

    let mut rows = Vec::with_capacity(payload.len());
    for incoming in &payload {
        rows.push(NewEvent {
            bucket_id: bucket.clone(),
            id: incoming.id,
            timestamp: parse_timestamp(&incoming.timestamp, "timestamp")?,
            duration: incoming.duration,
            data: if incoming.data.is_null() {
                "{}".to_string()
            } else {
                incoming.data.to_string()
            },
        });
    }

    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let inserted = store::insert_events(&mut conn, &rows).map_err(AppError::internal)?;

    let snapshot = state.rules.current(&mut conn)?;
    let stored: Vec<Event> = rows
        .iter()
        .map(|row| {
            events::table
                .find((row.bucket_id.clone(), row.id))
                .first(&mut conn)
        })
        .collect::<QueryResult<_>>()?;
    let summary =
        extractor::extract_events(&mut conn, &snapshot, &stored).map_err(AppError::internal)?;

    let mut enqueued = 0;
    for event in &stored {
        if let Some(task) =
            llm::task_for_event(&event.bucket_id, event.id, &event.data_value(), TaskPriority::Normal)
        {
            state.enrichment.push(task);
            enqueued += 1;
        }
    }

    Ok(Json(json!({
        "inserted": inserted,
        "links_created": summary.links_created,
        "enrichment_enqueued": enqueued,
    })))
}

#[derive(Deserialize)]
pub struct BucketEventsQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_bucket_events(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<BucketEventsQuery>,
) -> AppResult<Json<Vec<EventResponse>>> {
    let mut conn = state.db()?;
    let start = match params.start.as_deref() {
        Some(raw) => parse_timestamp(raw, "start")?,
        None => chrono::DateTime::<chrono::Utc>::UNIX_EPOCH.naive_utc(),
    };
    let end = match params.end.as_deref() {
        Some(raw) => parse_timestamp(raw, "end")?,
        None => chrono::Utc::now().naive_utc(),
    };
    let events = store::read_events(
        &mut conn,
        Some(&bucket),
        start,
        end,
        Some(params.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, 10_000)),
    )
    .map_err(AppError::internal)?;
    Ok(Json(events.into_iter().map(EventResponse::from).collect()))
}

#[derive(Serialize)]
pub struct EventObjectResponse {
    pub object_id: Uuid,
    #[serde(rename = "type")]
    pub object_type: String,
    pub name: String,
    pub provenance: String,
    pub confidence: f64,
    pub linked_at: String,
}

pub async fn list_event_objects(
    State(state): State<AppState>,
    Path((bucket, event)): Path<(String, i64)>,
) -> AppResult<Json<Vec<EventObjectResponse>>> {
    let mut conn = state.db()?;
    let rows =
        store::objects_for_event(&mut conn, &bucket, event).map_err(AppError::internal)?;
    rows.into_iter()
        .map(|(link, object)| {
            Ok(EventObjectResponse {
                object_id: Uuid::parse_str(&object.id).map_err(AppError::internal)?,
                object_type: object.object_type,
                name: object.name,
                provenance: link.provenance,
                confidence: link.confidence,
                linked_at: to_rfc3339(link.created_at),
            })
        })
        .collect::<AppResult<Vec<_>>>()
        .map(Json)
}

#[derive(Deserialize)]
pub struct LinkRequest {
    pub object_id: Uuid,
}

pub async fn link_event_object(
    State(state): State<AppState>,
    Path((bucket, event)): Path<(String, i64)>,
    Json(payload): Json<LinkRequest>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;

    let exists: Option<Event> = events::table
        .find((bucket.clone(), event))
        .first(&mut conn)
        .optional()?;
    if exists.is_none() {
        return Err(AppError::not_found("event"));
    }

    store::link_event_to_object(
        &mut conn,
        &bucket,
        event,
        &payload.object_id.to_string(),
        "manual",
        1.0,
    )
    .map_err(|err| match err {
        store::StoreError::Database(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::ForeignKeyViolation,
            _,
        )) => AppError::not_found("object"),
        other => AppError::internal(other),
    })?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unlink_event_object(
    State(state): State<AppState>,
    Path((bucket, event, object_id)): Path<(String, i64, Uuid)>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let removed =
        store::unlink_event_from_object(&mut conn, &bucket, event, &object_id.to_string())
            .map_err(AppError::internal)?;
    if removed == 0 {
        return Err(AppError::not_found("link"));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn learning_error(err: learning::LearningError) -> AppError {
    match err {
        learning::LearningError::LinkNotFound => AppError::not_found("link"),
        learning::LearningError::ObjectNotFound => AppError::not_found("object"),
        other => AppError::internal(other),
    }
}

/// The user confirmed a binding; the originating rule gains confidence.
pub async fn confirm_link(
    State(state): State<AppState>,
    Path((bucket, event, object_id)): Path<(String, i64, Uuid)>,
) -> AppResult<Json<Value>> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let rule = learning::confirm_link(&mut conn, &bucket, event, &object_id.to_string())
        .map_err(learning_error)?;
    state.rules.invalidate();
    Ok(Json(json!({
        "rule_id": rule.as_ref().map(|r| r.id.clone()),
        "confidence": rule.map(|r| r.confidence),
    })))
}

#[derive(Deserialize, Default)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

pub async fn reject_link(
    State(state): State<AppState>,
    Path((bucket, event, object_id)): Path<(String, i64, Uuid)>,
    payload: Option<Json<RejectRequest>>,
) -> AppResult<Json<Value>> {
    let reason = payload.and_then(|Json(body)| body.reason);
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let rule = learning::reject_link(
        &mut conn,
        &bucket,
        event,
        &object_id.to_string(),
        reason.as_deref(),
    )
    .map_err(learning_error)?;
    state.rules.invalidate();
    Ok(Json(json!({
        "rule_id": rule.as_ref().map(|r| r.id.clone()),
        "confidence": rule.as_ref().map(|r| r.confidence),
        "enabled": rule.map(|r| r.enabled),
    })))
}

#[derive(Deserialize)]
pub struct CorrectRequest {
    pub object_type: Option<String>,
    pub name: Option<String>,
    pub identifier_key: Option<String>,
}

pub async fn correct_link(
    State(state): State<AppState>,
    Path((bucket, event, object_id)): Path<(String, i64, Uuid)>,
    Json(payload): Json<CorrectRequest>,
) -> AppResult<Json<Value>> {
    let correction = learning::Correction {
        object_type: payload.object_type,
        name: payload.name,
        identifier_key: payload.identifier_key,
    };
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let corrected = learning::correct_link(
        &mut conn,
        &bucket,
        event,
        &object_id.to_string(),
        &correction,
    )
    .map_err(learning_error)?;
    state.rules.invalidate();
    Ok(Json(json!({
        "object_id": corrected.id,
        "type": corrected.object_type,
        "name": corrected.name,
    })))
}
