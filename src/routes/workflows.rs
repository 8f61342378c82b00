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
use crate::models::{NewWorkflow, NewWorkflowObject, Occurrence, Workflow};
use crate::orchestrator::{
    parse_workflow_pattern, WorkflowPattern, WORKFLOW_ACTIVE, WORKFLOW_ARCHIVED, WORKFLOW_DRAFT,
};
use crate::routes::to_rfc3339;
use crate::schema::{
    objects, occurrence_step_instances, occurrences, workflow_objects, workflow_steps, workflows,
};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WorkflowListQuery {
    pub status: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub pattern: PatternBody,
}

/// The pattern may arrive as a bare label list or the full definition.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum PatternBody {
    Labels(Vec<String>),
    Full(WorkflowPattern),
}

impl PatternBody {
    fn into_pattern(self) -> WorkflowPattern {
        match self {
            PatternBody::Labels(labels) => WorkflowPattern::from_labels(labels),
            PatternBody::Full(pattern) => pattern,
        }
    }
}

#[derive(Deserialize)]
pub struct UpdateWorkflowRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pattern: Option<PatternBody>,
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct WorkflowResponse {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub pattern: WorkflowPattern,
    pub status: String,
    pub step_ids: Vec<String>,
    pub object_ids: Vec<String>,
    pub occurrence_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

fn workflow_response(
    conn: &mut diesel::SqliteConnection,
    workflow: Workflow,
) -> AppResult<WorkflowResponse> {
    let pattern = parse_workflow_pattern(&workflow).map_err(AppError::internal)?;
    let step_ids: Vec<String> = workflow_steps::table
        .filter(workflow_steps::workflow_id.eq(&workflow.id))
        .order(workflow_steps::position.asc())
        .select(workflow_steps::step_id)
        .load(conn)?;
    let object_ids: Vec<String> = workflow_objects::table
        .filter(workflow_objects::workflow_id.eq(&workflow.id))
        .order(workflow_objects::object_id.asc())
        .select(workflow_objects::object_id)
        .load(conn)?;
    let occurrence_count: i64 = occurrences::table
        .filter(occurrences::workflow_id.eq(&workflow.id))
        .count()
        .get_result(conn)?;

    Ok(WorkflowResponse {
        id: Uuid::parse_str(&workflow.id).map_err(AppError::internal)?,
        name: workflow.name,
        description: workflow.description,
        pattern,
        status: workflow.status,
        step_ids,
        object_ids,
        occurrence_count,
        created_at: to_rfc3339(workflow.created_at),
        updated_at: to_rfc3339(workflow.updated_at),
    })
}

pub async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<WorkflowListQuery>,
) -> AppResult<Json<Vec<WorkflowResponse>>> {
    let mut conn = state.db()?;
    let mut query = workflows::table
        .order(workflows::created_at.asc())
        .into_boxed();
    match params.status {
        Some(status) => query = query.filter(workflows::status.eq(status)),
        // archived workflows are history, not part of the default view
        None if !params.include_archived => {
            query = query.filter(workflows::status.ne(WORKFLOW_ARCHIVED))
        }
        None => {}
    }
    let rows: Vec<Workflow> = query.load(&mut conn)?;
    rows.into_iter()
        .map(|workflow| workflow_response(&mut conn, workflow))
        .collect::<AppResult<Vec<_>>>()
        .map(Json)
}

/// Saving a workflow without mined data: it starts as a draft.
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> AppResult<Json<WorkflowResponse>> {
    if payload.name.trim().is_empty() {
        return Err(AppError::invalid_argument("name must not be empty"));
    }
    let pattern = payload.pattern.into_pattern();
    if pattern.labels.len() < 2 {
        return Err(AppError::invalid_argument(
            "pattern must have at least two labels",
        ));
    }

    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let row = NewWorkflow {
        id: Uuid::new_v4().to_string(),
        name: payload.name.trim().to_string(),
        description: payload.description,
        pattern: serde_json::to_string(&pattern)?,
        status: WORKFLOW_DRAFT.to_string(),
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(workflows::table)
        .values(&row)
        .execute(&mut conn)?;

    let created: Workflow = workflows::table.find(&row.id).first(&mut conn)?;
    Ok(Json(workflow_response(&mut conn, created)?))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WorkflowResponse>> {
    let mut conn = state.db()?;
    let row: Option<Workflow> = workflows::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let row = row.ok_or_else(|| AppError::not_found("workflow"))?;
    Ok(Json(workflow_response(&mut conn, row)?))
}

pub async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateWorkflowRequest>,
) -> AppResult<Json<WorkflowResponse>> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let existing: Option<Workflow> = workflows::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let existing = existing.ok_or_else(|| AppError::not_found("workflow"))?;

    if let Some(status) = payload.status.as_deref() {
        // the only user-driven transition is active -> archived
        let allowed = status == WORKFLOW_ARCHIVED && existing.status == WORKFLOW_ACTIVE;
        if status != existing.status && !allowed {
            return Err(AppError::precondition_failed(format!(
                "cannot transition workflow from {} to {status}",
                existing.status
            )));
        }
    }

    let pattern = match payload.pattern {
        Some(body) => {
            let pattern = body.into_pattern();
            if pattern.labels.len() < 2 {
                return Err(AppError::invalid_argument(
                    "pattern must have at least two labels",
                ));
            }
            serde_json::to_string(&pattern)?
        }
        None => existing.pattern.clone(),
    };

    diesel::update(workflows::table.find(&existing.id))
        .set((
            workflows::name.eq(payload.name.unwrap_or(existing.name)),
            workflows::description
                .eq(payload.description.unwrap_or(existing.description)),
            workflows::pattern.eq(pattern),
            workflows::status.eq(payload.status.unwrap_or(existing.status)),
            workflows::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    let updated: Workflow = workflows::table.find(&existing.id).first(&mut conn)?;
    Ok(Json(workflow_response(&mut conn, updated)?))
}

/// Deleting a workflow removes exactly its occurrences and their step
/// instances; steps and objects survive.
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let deleted = diesel::delete(workflows::table.find(id.to_string())).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found("workflow"));
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

    let workflow: Option<Workflow> = workflows::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    if workflow.is_none() {
        return Err(AppError::not_found("workflow"));
    }
    let object_exists: i64 = objects::table
        .filter(objects::id.eq(payload.object_id.to_string()))
        .count()
        .get_result(&mut conn)?;
    if object_exists == 0 {
        return Err(AppError::not_found("object"));
    }

    diesel::insert_into(workflow_objects::table)
        .values(NewWorkflowObject {
            workflow_id: id.to_string(),
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
        workflow_objects::table
            .filter(workflow_objects::workflow_id.eq(id.to_string()))
            .filter(workflow_objects::object_id.eq(object_id.to_string())),
    )
    .execute(&mut conn)?;
    if removed == 0 {
        return Err(AppError::not_found("link"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct OccurrenceResponse {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub started_at: String,
    pub ended_at: String,
    pub duration: f64,
    pub step_instances: Vec<Value>,
}

fn occurrence_response(
    conn: &mut diesel::SqliteConnection,
    occurrence: Occurrence,
) -> AppResult<OccurrenceResponse> {
    let instances: Vec<(String, i32)> = occurrence_step_instances::table
        .filter(occurrence_step_instances::occurrence_id.eq(&occurrence.id))
        .order(occurrence_step_instances::position.asc())
        .select((
            occurrence_step_instances::step_id,
            occurrence_step_instances::position,
        ))
        .load(conn)?;
    Ok(OccurrenceResponse {
        id: Uuid::parse_str(&occurrence.id).map_err(AppError::internal)?,
        workflow_id: Uuid::parse_str(&occurrence.workflow_id).map_err(AppError::internal)?,
        started_at: to_rfc3339(occurrence.started_at),
        ended_at: to_rfc3339(occurrence.ended_at),
        duration: occurrence.duration,
        step_instances: instances
            .into_iter()
            .map(|(step_id, position)| {
                serde_json::json!({ "step_id": step_id, "position": position })
            })
            .collect(),
    })
}

pub async fn list_occurrences(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<OccurrenceResponse>>> {
    let mut conn = state.db()?;
    let workflow: Option<Workflow> = workflows::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    if workflow.is_none() {
        return Err(AppError::not_found("workflow"));
    }

    let rows: Vec<Occurrence> = occurrences::table
        .filter(occurrences::workflow_id.eq(id.to_string()))
        .order(occurrences::started_at.asc())
        .load(&mut conn)?;
    rows.into_iter()
        .map(|occurrence| occurrence_response(&mut conn, occurrence))
        .collect::<AppResult<Vec<_>>>()
        .map(Json)
}

pub async fn get_occurrence(
    State(state): State<AppState>,
    Path((id, occ_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<OccurrenceResponse>> {
    let mut conn = state.db()?;
    let row: Option<Occurrence> = occurrences::table
        .find(occ_id.to_string())
        .first(&mut conn)
        .optional()?;
    let row = row.ok_or_else(|| AppError::not_found("occurrence"))?;
    if row.workflow_id != id.to_string() {
        return Err(AppError::not_found("occurrence"));
    }
    Ok(Json(occurrence_response(&mut conn, row)?))
}
