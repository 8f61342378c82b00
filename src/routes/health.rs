use axum::{extract::State, http::StatusCode, Json};
use diesel::dsl::count_star;
use diesel::prelude::*;
use serde_json::json;

use crate::error::AppResult;
use crate::schema::{
    events, extraction_rules, objects, occurrences, review_tasks, workflows,
};
use crate::state::AppState;

pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "enrichment": state.enrichment.snapshot(),
        })),
    )
}

pub async fn stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let mut conn = state.db()?;

    let total_events: i64 = events::table.select(count_star()).first(&mut conn)?;
    let total_objects: i64 = objects::table.select(count_star()).first(&mut conn)?;
    let total_rules: i64 = extraction_rules::table
        .select(count_star())
        .first(&mut conn)?;
    let total_workflows: i64 = workflows::table.select(count_star()).first(&mut conn)?;
    let total_occurrences: i64 = occurrences::table.select(count_star()).first(&mut conn)?;
    let pending_review: i64 = review_tasks::table
        .filter(review_tasks::status.eq("pending"))
        .select(count_star())
        .first(&mut conn)?;

    let objects_by_type: Vec<(String, i64)> = objects::table
        .group_by(objects::object_type)
        .select((objects::object_type, count_star()))
        .order(objects::object_type.asc())
        .load(&mut conn)?;

    Ok(Json(json!({
        "total_events": total_events,
        "total_objects": total_objects,
        "total_rules": total_rules,
        "total_workflows": total_workflows,
        "total_occurrences": total_occurrences,
        "pending_review_tasks": pending_review,
        "objects_by_type": objects_by_type
            .into_iter()
            .map(|(object_type, count)| json!({ "type": object_type, "count": count }))
            .collect::<Vec<_>>(),
    })))
}
