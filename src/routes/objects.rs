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
use crate::models::Object;
use crate::routes::{parse_timestamp, to_rfc3339};
use crate::schema::objects;
use crate::state::AppState;
use crate::store;

const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Deserialize)]
pub struct ObjectListQuery {
    #[serde(rename = "type")]
    pub object_type: Option<String>,
    pub q: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateObjectRequest {
    #[serde(rename = "type")]
    pub object_type: String,
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize)]
pub struct UpdateObjectRequest {
    pub name: Option<String>,
    pub data: Option<Value>,
    #[serde(default)]
    pub replace_data: bool,
}

#[derive(Serialize)]
pub struct ObjectResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub object_type: String,
    pub name: String,
    pub data: Value,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<Object> for ObjectResponse {
    type Error = AppError;

    fn try_from(row: Object) -> Result<Self, AppError> {
        Ok(Self {
            id: Uuid::parse_str(&row.id).map_err(AppError::internal)?,
            data: row.data_value(),
            object_type: row.object_type,
            name: row.name,
            created_at: to_rfc3339(row.created_at),
            updated_at: to_rfc3339(row.updated_at),
        })
    }
}

#[derive(Serialize)]
pub struct EventResponse {
    pub bucket_id: String,
    pub id: i64,
    pub timestamp: String,
    pub duration: f64,
    pub data: Value,
}

impl From<crate::models::Event> for EventResponse {
    fn from(event: crate::models::Event) -> Self {
        Self {
            data: event.data_value(),
            timestamp: to_rfc3339(event.timestamp),
            bucket_id: event.bucket_id,
            id: event.id,
            duration: event.duration,
        }
    }
}

pub async fn list_objects(
    State(state): State<AppState>,
    Query(params): Query<ObjectListQuery>,
) -> AppResult<Json<Vec<ObjectResponse>>> {
    let mut conn = state.db()?;
    let mut query = objects::table
        .order((objects::object_type.asc(), objects::name.asc()))
        .limit(params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1000))
        .into_boxed();

    if let Some(object_type) = params.object_type {
        query = query.filter(objects::object_type.eq(object_type));
    }
    if let Some(needle) = params.q {
        query = query.filter(objects::name.like(format!("%{needle}%")));
    }
    if let Some(start) = params.start.as_deref() {
        query = query.filter(objects::updated_at.ge(parse_timestamp(start, "start")?));
    }
    if let Some(end) = params.end.as_deref() {
        query = query.filter(objects::updated_at.le(parse_timestamp(end, "end")?));
    }

    let rows: Vec<Object> = query.load(&mut conn)?;
    rows.into_iter()
        .map(ObjectResponse::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map(Json)
}

pub async fn create_object(
    State(state): State<AppState>,
    Json(payload): Json<CreateObjectRequest>,
) -> AppResult<Json<ObjectResponse>> {
    if payload.name.trim().is_empty() {
        return Err(AppError::invalid_argument("name must not be empty"));
    }
    let object_type = payload.object_type.trim();
    let name = payload.name.trim();

    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;

    // A duplicate (type, name) only conflicts when the data diverges; the
    // extractor merges instead, but over REST the caller must resolve it.
    let existing: Option<Object> = objects::table
        .filter(objects::object_type.eq(object_type))
        .filter(objects::name.eq(name))
        .first(&mut conn)
        .optional()?;
    if let Some(existing) = existing {
        let current = existing.data_value();
        if let (Value::Object(current), Value::Object(incoming)) = (&current, &payload.data) {
            let divergent = incoming.iter().any(|(key, value)| {
                current.get(key).is_some_and(|existing_value| existing_value != value)
            });
            if divergent {
                return Err(AppError::conflict(format!(
                    "object {name} already exists with different data"
                )));
            }
        }
    }

    let object = store::upsert_object(&mut conn, object_type, name, &payload.data, false)
        .map_err(|err| match err {
            store::StoreError::UnknownObjectType(unknown) => {
                AppError::invalid_argument(format!("unknown object type {unknown}"))
            }
            other => AppError::internal(other),
        })?;
    Ok(Json(object.try_into()?))
}

pub async fn get_object(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ObjectResponse>> {
    let mut conn = state.db()?;
    let row: Option<Object> = objects::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let row = row.ok_or_else(|| AppError::not_found("object"))?;
    Ok(Json(row.try_into()?))
}

pub async fn update_object(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateObjectRequest>,
) -> AppResult<Json<ObjectResponse>> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let existing: Option<Object> = objects::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let existing = existing.ok_or_else(|| AppError::not_found("object"))?;

    if let Some(name) = payload.name.as_deref() {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::invalid_argument("name must not be empty"));
        }
        if name != existing.name {
            let duplicate: Option<Object> = objects::table
                .filter(objects::object_type.eq(&existing.object_type))
                .filter(objects::name.eq(name))
                .first(&mut conn)
                .optional()?;
            if duplicate.is_some() {
                return Err(AppError::conflict(format!(
                    "an object named {name} already exists for this type"
                )));
            }
            diesel::update(objects::table.find(&existing.id))
                .set(objects::name.eq(name.to_string()))
                .execute(&mut conn)?;
        }
    }

    if let Some(data) = payload.data {
        let merged = if payload.replace_data {
            data
        } else {
            let mut base = match existing.data_value() {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            if let Value::Object(incoming) = data {
                for (key, value) in incoming {
                    base.insert(key, value);
                }
            }
            Value::Object(base)
        };
        diesel::update(objects::table.find(&existing.id))
            .set(objects::data.eq(merged.to_string()))
            .execute(&mut conn)?;
    }

    diesel::update(objects::table.find(&existing.id))
        .set(objects::updated_at.eq(Utc::now().naive_utc()))
        .execute(&mut conn)?;

    let updated: Object = objects::table.find(&existing.id).first(&mut conn)?;
    Ok(Json(updated.try_into()?))
}

pub async fn delete_object(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let deleted = diesel::delete(objects::table.find(id.to_string())).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found("object"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ObjectEventsQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

pub async fn list_object_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ObjectEventsQuery>,
) -> AppResult<Json<Vec<EventResponse>>> {
    let mut conn = state.db()?;
    let exists: Option<Object> = objects::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    if exists.is_none() {
        return Err(AppError::not_found("object"));
    }

    let range = match (params.start.as_deref(), params.end.as_deref()) {
        (Some(start), Some(end)) => Some((
            parse_timestamp(start, "start")?,
            parse_timestamp(end, "end")?,
        )),
        _ => None,
    };

    let events = store::events_for_object(&mut conn, &id.to_string(), range)
        .map_err(AppError::internal)?;
    Ok(Json(events.into_iter().map(EventResponse::from).collect()))
}
