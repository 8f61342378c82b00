use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use diesel::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::jobs;
use crate::models::{ExtractionRule, NewExtractionRule};
use crate::ontology::{
    extractor, validate_rule_definition, CompiledRule, PROVENANCE_USER,
};
use crate::routes::{mining::spawn_guarded_job, parse_timestamp, to_rfc3339};
use crate::schema::extraction_rules;
use crate::state::AppState;
use crate::store;

#[derive(Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub object_type: String,
    pub source_fields: Vec<String>,
    pub pattern: String,
    pub name_template: String,
    #[serde(default)]
    pub data_mapping: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub source_fields: Option<Vec<String>>,
    pub pattern: Option<String>,
    pub name_template: Option<String>,
    pub data_mapping: Option<BTreeMap<String, String>>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

#[derive(Serialize)]
pub struct RuleResponse {
    pub id: Uuid,
    pub name: String,
    pub object_type: String,
    pub source_fields: Vec<String>,
    pub pattern: String,
    pub name_template: String,
    pub data_mapping: BTreeMap<String, String>,
    pub enabled: bool,
    pub priority: i32,
    pub provenance: String,
    pub match_count: i32,
    pub confirm_count: i32,
    pub reject_count: i32,
    pub confidence: f64,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ExtractionRule> for RuleResponse {
    type Error = AppError;

    fn try_from(row: ExtractionRule) -> Result<Self, AppError> {
        Ok(Self {
            id: Uuid::parse_str(&row.id).map_err(AppError::internal)?,
            source_fields: row.source_fields_vec(),
            data_mapping: row.data_mapping_map(),
            name: row.name,
            object_type: row.object_type,
            pattern: row.pattern,
            name_template: row.name_template,
            enabled: row.enabled,
            priority: row.priority,
            provenance: row.provenance,
            match_count: row.match_count,
            confirm_count: row.confirm_count,
            reject_count: row.reject_count,
            confidence: row.confidence,
            created_at: to_rfc3339(row.created_at),
            updated_at: to_rfc3339(row.updated_at),
        })
    }
}

pub async fn list_rules(State(state): State<AppState>) -> AppResult<Json<Vec<RuleResponse>>> {
    let mut conn = state.db()?;
    let rows: Vec<ExtractionRule> = extraction_rules::table
        .order((
            extraction_rules::priority.desc(),
            extraction_rules::id.asc(),
        ))
        .load(&mut conn)?;
    rows.into_iter()
        .map(RuleResponse::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map(Json)
}

pub async fn create_rule(
    State(state): State<AppState>,
    Json(payload): Json<CreateRuleRequest>,
) -> AppResult<Json<RuleResponse>> {
    validate_rule_definition(&payload.pattern, &payload.name_template, &payload.data_mapping)
        .map_err(AppError::invalid_argument)?;
    if payload.source_fields.is_empty() {
        return Err(AppError::invalid_argument(
            "source_fields must not be empty",
        ));
    }

    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let row = NewExtractionRule {
        id: Uuid::new_v4().to_string(),
        name: payload.name,
        object_type: payload.object_type,
        source_fields: serde_json::to_string(&payload.source_fields)?,
        pattern: payload.pattern,
        name_template: payload.name_template,
        data_mapping: serde_json::to_string(&payload.data_mapping)?,
        enabled: payload.enabled,
        priority: payload.priority,
        provenance: PROVENANCE_USER.to_string(),
        confidence: payload.confidence.clamp(0.0, 1.0),
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(extraction_rules::table)
        .values(&row)
        .execute(&mut conn)?;
    state.rules.invalidate();

    let created: ExtractionRule = extraction_rules::table.find(&row.id).first(&mut conn)?;
    Ok(Json(created.try_into()?))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<RuleResponse>> {
    let mut conn = state.db()?;
    let row: Option<ExtractionRule> = extraction_rules::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let row = row.ok_or_else(|| AppError::not_found("extraction rule"))?;
    Ok(Json(row.try_into()?))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateRuleRequest>,
) -> AppResult<Json<RuleResponse>> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let existing: Option<ExtractionRule> = extraction_rules::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let existing = existing.ok_or_else(|| AppError::not_found("extraction rule"))?;

    let pattern = payload.pattern.unwrap_or_else(|| existing.pattern.clone());
    let name_template = payload
        .name_template
        .unwrap_or_else(|| existing.name_template.clone());
    let data_mapping = payload
        .data_mapping
        .unwrap_or_else(|| existing.data_mapping_map());
    validate_rule_definition(&pattern, &name_template, &data_mapping)
        .map_err(AppError::invalid_argument)?;

    let source_fields = payload
        .source_fields
        .unwrap_or_else(|| existing.source_fields_vec());

    diesel::update(extraction_rules::table.find(&existing.id))
        .set((
            extraction_rules::name.eq(payload.name.unwrap_or(existing.name)),
            extraction_rules::source_fields.eq(serde_json::to_string(&source_fields)?),
            extraction_rules::pattern.eq(pattern),
            extraction_rules::name_template.eq(name_template),
            extraction_rules::data_mapping.eq(serde_json::to_string(&data_mapping)?),
            extraction_rules::enabled.eq(payload.enabled.unwrap_or(existing.enabled)),
            extraction_rules::priority.eq(payload.priority.unwrap_or(existing.priority)),
            extraction_rules::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;
    state.rules.invalidate();

    let updated: ExtractionRule = extraction_rules::table.find(&existing.id).first(&mut conn)?;
    Ok(Json(updated.try_into()?))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.db()?;
    let deleted =
        diesel::delete(extraction_rules::table.find(id.to_string())).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found("extraction rule"));
    }
    state.rules.invalidate();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct TestRuleRequest {
    pub samples: Vec<Value>,
}

#[derive(Serialize)]
pub struct TestRuleResult {
    #[serde(rename = "match")]
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub async fn test_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TestRuleRequest>,
) -> AppResult<Json<Vec<TestRuleResult>>> {
    let mut conn = state.db()?;
    let row: Option<ExtractionRule> = extraction_rules::table
        .find(id.to_string())
        .first(&mut conn)
        .optional()?;
    let row = row.ok_or_else(|| AppError::not_found("extraction rule"))?;

    let regex = Regex::new(&row.pattern)
        .map_err(|err| AppError::invalid_argument(format!("pattern does not compile: {err}")))?;
    let compiled = CompiledRule {
        id: row.id.clone(),
        object_type: row.object_type.clone(),
        source_fields: row.source_fields_vec(),
        regex,
        name_template: row.name_template.clone(),
        data_mapping: row.data_mapping_map(),
        priority: row.priority,
        confidence: row.confidence,
    };

    let results = payload
        .samples
        .iter()
        .map(|sample| match extractor::test_rule_against_sample(&compiled, sample) {
            Some(binding) => TestRuleResult {
                matched: true,
                name: Some(binding.name),
                data: Some(binding.data),
            },
            None => TestRuleResult {
                matched: false,
                name: None,
                data: None,
            },
        })
        .collect();
    Ok(Json(results))
}

#[derive(Deserialize)]
pub struct RunRulesRequest {
    pub start: String,
    pub end: String,
    pub bucket: Option<String>,
}

/// Triggers an extraction job over the given window.
pub async fn run_rules(
    State(state): State<AppState>,
    Json(payload): Json<RunRulesRequest>,
) -> AppResult<Json<Value>> {
    let start = parse_timestamp(&payload.start, "start")?;
    let end = parse_timestamp(&payload.end, "end")?;
    let bucket = payload.bucket.clone();
    let rules = state.rules.clone();

    let job_id = spawn_guarded_job(
        &state,
        jobs::JOB_EXTRACT,
        json!({ "start": payload.start, "end": payload.end, "bucket": payload.bucket }),
        move |conn| {
            let snapshot = rules.current(conn).map_err(|err| err.to_string())?;
            let events = store::read_events(conn, bucket.as_deref(), start, end, None)
                .map_err(|err| err.to_string())?;
            let mut links = 0;
            let mut processed = 0;
            for chunk in events.chunks(crate::orchestrator::EVENT_CHUNK) {
                let summary = extractor::extract_events(conn, &snapshot, chunk)
                    .map_err(|err| err.to_string())?;
                links += summary.links_created;
                processed += summary.events_processed;
            }
            Ok(json!({ "events_processed": processed, "links_created": links }))
        },
    )
    .await?;
    Ok(Json(json!({ "job_id": job_id })))
}
