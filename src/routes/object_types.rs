use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use diesel::dsl::count_star;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{NewObjectType, ObjectType};
use crate::routes::to_rfc3339;
use crate::schema::{object_types, objects};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateObjectTypeRequest {
    pub name: String,
    pub display_name: Option<String>,
    pub data_schema: Option<Value>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateObjectTypeRequest {
    pub display_name: Option<String>,
    pub data_schema: Option<Value>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Serialize)]
pub struct ObjectTypeResponse {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ObjectType> for ObjectTypeResponse {
    type Error = AppError;

    fn try_from(row: ObjectType) -> Result<Self, AppError> {
        let id = Uuid::parse_str(&row.id).map_err(AppError::internal)?;
        let data_schema = row
            .data_schema
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Self {
            id,
            name: row.name,
            display_name: row.display_name,
            data_schema,
            icon: row.icon,
            color: row.color,
            created_at: to_rfc3339(row.created_at),
            updated_at: to_rfc3339(row.updated_at),
        })
    }
}

pub async fn list_object_types(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<ObjectTypeResponse>>> {
    let mut conn = state.db()?;
    let rows: Vec<ObjectType> = object_types::table
        .order(object_types::name.asc())
        .load(&mut conn)?;
    rows.into_iter()
        .map(ObjectTypeResponse::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map(Json)
}

pub async fn create_object_type(
    State(state): State<AppState>,
    Json(payload): Json<CreateObjectTypeRequest>,
) -> AppResult<Json<ObjectTypeResponse>> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::invalid_argument("name must not be empty"));
    }

    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let row = NewObjectType {
        id: Uuid::new_v4().to_string(),
        display_name: payload.display_name.unwrap_or_else(|| name.clone()),
        name,
        data_schema: payload.data_schema.map(|schema| schema.to_string()),
        icon: payload.icon,
        color: payload.color,
        created_at: now,
        updated_at: now,
    };

    match diesel::insert_into(object_types::table)
        .values(&row)
        .execute(&mut conn)
    {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => return Err(AppError::conflict("object type name already exists")),
        Err(err) => return Err(err.into()),
    }

    let created: ObjectType = object_types::table.find(&row.id).first(&mut conn)?;
    Ok(Json(created.try_into()?))
}

pub async fn get_object_type(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ObjectTypeResponse>> {
    let mut conn = state.db()?;
    let row: Option<ObjectType> = object_types::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let row = row.ok_or_else(|| AppError::not_found("object type"))?;
    Ok(Json(row.try_into()?))
}

pub async fn update_object_type(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateObjectTypeRequest>,
) -> AppResult<Json<ObjectTypeResponse>> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let existing: Option<ObjectType> = object_types::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let existing = existing.ok_or_else(|| AppError::not_found("object type"))?;

    diesel::update(object_types::table.find(&existing.id))
        .set((
            object_types::display_name
                .eq(payload.display_name.unwrap_or(existing.display_name)),
            object_types::data_schema.eq(payload
                .data_schema
                .map(|schema| schema.to_string())
                .or(existing.data_schema)),
            object_types::icon.eq(payload.icon.or(existing.icon)),
            object_types::color.eq(payload.color.or(existing.color)),
            object_types::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    let updated: ObjectType = object_types::table.find(&existing.id).first(&mut conn)?;
    Ok(Json(updated.try_into()?))
}

pub async fn delete_object_type(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let existing: Option<ObjectType> = object_types::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let existing = existing.ok_or_else(|| AppError::not_found("object type"))?;

    let in_use: i64 = objects::table
        .filter(objects::object_type.eq(&existing.name))
        .select(count_star())
        .first(&mut conn)?;
    if in_use > 0 {
        return Err(AppError::precondition_failed(
            "cannot delete an object type that still has objects",
        ));
    }

    diesel::delete(object_types::table.find(&existing.id)).execute(&mut conn)?;
    Ok(StatusCode::NO_CONTENT)
}
