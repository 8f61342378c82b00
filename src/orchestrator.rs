use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::jobs;
use crate::mining::{
    cases::{self, DEFAULT_MAX_GAP_SECONDS},
    discovery::{self, DEFAULT_SIMILARITY_THRESHOLD},
    matching::{self, DEFAULT_MAX_GAP_INSIDE_WORKFLOW},
    patterns::{self, MinedPattern, MinerOptions, DEFAULT_MIN_VARIANT_CASES},
    Case, MiningEvent,
};
use crate::models::{
    Event, NewOccurrence, NewOccurrenceStepInstance, NewStep, NewStepEvent, NewStepObject,
    NewWorkflow, NewWorkflowObject, NewWorkflowStep, Workflow,
};
use crate::ontology::extractor;
use crate::schema::{
    event_objects, occurrence_step_instances, occurrences, step_events, step_objects, steps,
    workflow_objects, workflow_steps, workflows,
};
use crate::state::AppState;
use crate::store::{self, StoreError};

pub const EVENT_CHUNK: usize = 500;
/// Mining requests over windows below this size run synchronously.
pub const SYNC_EVENT_LIMIT: i64 = 10_000;

pub const WORKFLOW_DRAFT: &str = "draft";
pub const WORKFLOW_ACTIVE: &str = "active";
pub const WORKFLOW_ARCHIVED: &str = "archived";

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("cancelled")]
    Cancelled,
}

/// Persisted pattern definition of a workflow: ordered labels, the allowed
/// gap when matching, and the positions that may be skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPattern {
    pub labels: Vec<String>,
    #[serde(default = "default_pattern_gap")]
    pub max_gap: usize,
    #[serde(default)]
    pub optional: Vec<usize>,
}

fn default_pattern_gap() -> usize {
    DEFAULT_MAX_GAP_INSIDE_WORKFLOW
}

impl WorkflowPattern {
    pub fn from_labels(labels: Vec<String>) -> Self {
        Self {
            labels,
            max_gap: DEFAULT_MAX_GAP_INSIDE_WORKFLOW,
            optional: Vec::new(),
        }
    }

    /// Labels that must be present. Optional positions are dropped; when an
    /// optional label does appear in a case it consumes gap budget like any
    /// other intermediate.
    pub fn required_labels(&self) -> Vec<String> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.optional.contains(index))
            .map(|(_, label)| label.clone())
            .collect()
    }
}

pub fn parse_workflow_pattern(workflow: &Workflow) -> Result<WorkflowPattern, serde_json::Error> {
    serde_json::from_str(&workflow.pattern)
}

#[derive(Debug, Clone)]
pub struct MiningWindow {
    pub bucket: Option<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub max_gap_seconds: f64,
}

impl MiningWindow {
    pub fn new(bucket: Option<String>, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            bucket,
            start,
            end,
            max_gap_seconds: DEFAULT_MAX_GAP_SECONDS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisParams {
    pub window: MiningWindow,
    pub miner: MinerOptions,
    pub min_variant_cases: usize,
    pub similarity_threshold: f64,
}

impl AnalysisParams {
    pub fn new(window: MiningWindow) -> Self {
        Self {
            window,
            miner: MinerOptions::default(),
            min_variant_cases: DEFAULT_MIN_VARIANT_CASES,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// Loads the window's events together with their activity labels and linked
/// object ids, in store order.
pub fn load_mining_events(
    conn: &mut SqliteConnection,
    window: &MiningWindow,
) -> Result<Vec<MiningEvent>, StoreError> {
    let events = store::read_events(
        conn,
        window.bucket.as_deref(),
        window.start,
        window.end,
        None,
    )?;
    if events.is_empty() {
        return Ok(Vec::new());
    }

    let buckets: BTreeSet<String> = events.iter().map(|event| event.bucket_id.clone()).collect();
    let links: Vec<(String, i64, String)> = event_objects::table
        .filter(event_objects::bucket_id.eq_any(&buckets))
        .select((
            event_objects::bucket_id,
            event_objects::event_id,
            event_objects::object_id,
        ))
        .load(conn)?;

    let mut by_event: HashMap<(String, i64), BTreeSet<String>> = HashMap::new();
    for (bucket, event_id, object_id) in links {
        by_event
            .entry((bucket, event_id))
            .or_default()
            .insert(object_id);
    }

    Ok(events
        .into_iter()
        .map(|event| {
            let objects = by_event
                .remove(&(event.bucket_id.clone(), event.id))
                .unwrap_or_default();
            MiningEvent {
                label: cases::activity_label(&event.data_value()),
                bucket_id: event.bucket_id,
                id: event.id,
                start: event.timestamp,
                duration: event.duration,
                objects,
            }
        })
        .collect())
}

/// Persists the synthesized steps of one case and returns their ids in case
/// order.
pub fn persist_case_steps(
    conn: &mut SqliteConnection,
    events: &[MiningEvent],
    case: &Case,
) -> QueryResult<Vec<String>> {
    let now = Utc::now().naive_utc();
    let mut step_ids = Vec::with_capacity(case.steps.len());

    for step in &case.steps {
        let step_id = Uuid::new_v4().to_string();
        diesel::insert_into(steps::table)
            .values(NewStep {
                id: step_id.clone(),
                name: step.label.clone(),
                started_at: step.started_at,
                ended_at: step.ended_at,
                duration: step.duration,
                data: json!({ "label": step.label }).to_string(),
                created_at: now,
                updated_at: now,
            })
            .execute(conn)?;
        for (position, &event_index) in step.event_indices.iter().enumerate() {
            let event = &events[event_index];
            diesel::insert_into(step_events::table)
                .values(NewStepEvent {
                    step_id: step_id.clone(),
                    bucket_id: event.bucket_id.clone(),
                    event_id: event.id,
                    position: position as i32,
                })
                .execute(conn)?;
        }
        for object_id in &step.objects {
            diesel::insert_into(step_objects::table)
                .values(NewStepObject {
                    step_id: step_id.clone(),
                    object_id: object_id.clone(),
                })
                .on_conflict_do_nothing()
                .execute(conn)?;
        }
        step_ids.push(step_id);
    }
    Ok(step_ids)
}

fn persist_occurrence(
    conn: &mut SqliteConnection,
    workflow_id: &str,
    case: &Case,
    step_ids: &[String],
    span: std::ops::RangeInclusive<usize>,
) -> QueryResult<Option<String>> {
    let first = *span.start();
    let last = *span.end();
    let started_at = case.steps[first].started_at;
    let ended_at = case.steps[last].ended_at;

    let duplicate: i64 = occurrences::table
        .filter(occurrences::workflow_id.eq(workflow_id))
        .filter(occurrences::started_at.eq(started_at))
        .filter(occurrences::ended_at.eq(ended_at))
        .count()
        .get_result(conn)?;
    if duplicate > 0 {
        return Ok(None);
    }

    let occurrence_id = Uuid::new_v4().to_string();
    let duration: f64 = case.steps[first..=last].iter().map(|s| s.duration).sum();
    diesel::insert_into(occurrences::table)
        .values(NewOccurrence {
            id: occurrence_id.clone(),
            workflow_id: workflow_id.to_string(),
            started_at,
            ended_at,
            duration,
            created_at: Utc::now().naive_utc(),
        })
        .execute(conn)?;
    for (position, step_index) in (first..=last).enumerate() {
        diesel::insert_into(occurrence_step_instances::table)
            .values(NewOccurrenceStepInstance {
                occurrence_id: occurrence_id.clone(),
                step_id: step_ids[step_index].clone(),
                position: position as i32,
            })
            .execute(conn)?;
    }
    Ok(Some(occurrence_id))
}

/// Matches one workflow against the cases and persists non-duplicate
/// occurrences. A draft workflow becomes active on its first occurrence.
pub fn match_workflow_against_cases(
    conn: &mut SqliteConnection,
    workflow: &Workflow,
    events: &[MiningEvent],
    case_list: &[Case],
) -> QueryResult<usize> {
    let Ok(pattern) = parse_workflow_pattern(workflow) else {
        warn!(workflow_id = %workflow.id, "workflow pattern is unreadable; skipping");
        return Ok(0);
    };
    let required = pattern.required_labels();
    if required.len() < 2 {
        return Ok(0);
    }

    let mut created = 0;
    for case in case_list {
        let labels = case.labels();
        let found = matching::match_pattern(&labels, &required, pattern.max_gap);
        if found.is_empty() {
            continue;
        }
        let step_ids = persist_case_steps(conn, events, case)?;
        for one_match in found {
            if persist_occurrence(conn, &workflow.id, case, &step_ids, one_match.step_range())?
                .is_some()
            {
                created += 1;
            }
        }
    }

    if created > 0 {
        diesel::update(
            workflows::table
                .find(&workflow.id)
                .filter(workflows::status.eq(WORKFLOW_DRAFT)),
        )
        .set((
            workflows::status.eq(WORKFLOW_ACTIVE),
            workflows::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    }
    Ok(created)
}

/// Persists one discovered workflow with its occurrences; step templates and
/// attached objects come from the first occurrence.
fn persist_discovered_workflow(
    conn: &mut SqliteConnection,
    discovered: &discovery::DiscoveredWorkflow,
    events: &[MiningEvent],
    case_list: &[Case],
) -> QueryResult<Workflow> {
    let now = Utc::now().naive_utc();
    let workflow_id = Uuid::new_v4().to_string();
    let pattern = WorkflowPattern::from_labels(discovered.pattern.clone());
    diesel::insert_into(workflows::table)
        .values(NewWorkflow {
            id: workflow_id.clone(),
            name: discovered.name.clone(),
            description: String::new(),
            pattern: serde_json::to_string(&pattern).expect("pattern serializes"),
            status: WORKFLOW_DRAFT.to_string(),
            created_at: now,
            updated_at: now,
        })
        .execute(conn)?;

    let workflow: Workflow = workflows::table.find(&workflow_id).first(conn)?;
    match_workflow_against_cases(conn, &workflow, events, case_list)?;

    let first_occurrence: Option<String> = occurrences::table
        .filter(occurrences::workflow_id.eq(&workflow_id))
        .order(occurrences::started_at.asc())
        .select(occurrences::id)
        .first(conn)
        .optional()?;
    if let Some(occurrence_id) = first_occurrence {
        let instance_steps: Vec<(String, i32)> = occurrence_step_instances::table
            .filter(occurrence_step_instances::occurrence_id.eq(&occurrence_id))
            .order(occurrence_step_instances::position.asc())
            .select((
                occurrence_step_instances::step_id,
                occurrence_step_instances::position,
            ))
            .load(conn)?;
        for (step_id, position) in &instance_steps {
            diesel::insert_into(workflow_steps::table)
                .values(NewWorkflowStep {
                    workflow_id: workflow_id.clone(),
                    step_id: step_id.clone(),
                    position: *position,
                })
                .execute(conn)?;
        }
        let object_ids: Vec<String> = step_objects::table
            .filter(step_objects::step_id.eq_any(instance_steps.iter().map(|(id, _)| id.clone())))
            .select(step_objects::object_id)
            .distinct()
            .load(conn)?;
        for object_id in object_ids {
            diesel::insert_into(workflow_objects::table)
                .values(NewWorkflowObject {
                    workflow_id: workflow_id.clone(),
                    object_id,
                })
                .on_conflict_do_nothing()
                .execute(conn)?;
        }
    }

    Ok(workflows::table.find(&workflow_id).first(conn)?)
}

fn pattern_summary(pattern: &MinedPattern) -> Value {
    json!({
        "labels": pattern.labels,
        "case_count": pattern.case_count(),
        "support": pattern.support,
        "avg_duration": pattern.avg_duration,
    })
}

/// Mines frequent patterns over the window; read-only.
pub fn compute_patterns(
    conn: &mut SqliteConnection,
    params: &AnalysisParams,
) -> Result<Value, StoreError> {
    let events = load_mining_events(conn, &params.window)?;
    let case_list = cases::build_cases(&events, params.window.max_gap_seconds, &[]);
    let sequences: Vec<Vec<String>> = case_list.iter().map(Case::labels).collect();
    let durations: Vec<f64> = case_list.iter().map(|case| case.duration).collect();
    let mined = patterns::mine_patterns(&sequences, &durations, &params.miner);
    // strict subsequences with identical coverage add no information
    let kept = patterns::variants(&mined, 1);
    Ok(json!({
        "cases": case_list.len(),
        "patterns": kept.iter().map(pattern_summary).collect::<Vec<_>>(),
    }))
}

/// Sessionises the window and persists the synthesized steps.
pub fn group_events(
    conn: &mut SqliteConnection,
    window: &MiningWindow,
) -> Result<Value, StoreError> {
    let events = load_mining_events(conn, window)?;
    let case_list = cases::build_cases(&events, window.max_gap_seconds, &[]);

    let mut summaries = Vec::with_capacity(case_list.len());
    for case in &case_list {
        let step_ids = persist_case_steps(conn, &events, case)?;
        summaries.push(json!({
            "events": case.event_indices.len(),
            "labels": case.labels(),
            "step_ids": step_ids,
            "started_at": case.started_at.and_utc().to_rfc3339(),
            "ended_at": case.ended_at.and_utc().to_rfc3339(),
            "duration": case.duration,
            "objects": case.objects,
        }));
    }
    Ok(json!({ "cases": summaries }))
}

/// Full discovery: cases, variants, clustering, and persisted workflows.
pub fn discover_workflows(
    conn: &mut SqliteConnection,
    params: &AnalysisParams,
) -> Result<Value, StoreError> {
    let events = load_mining_events(conn, &params.window)?;
    let case_list = cases::build_cases(&events, params.window.max_gap_seconds, &[]);
    let sequences: Vec<Vec<String>> = case_list.iter().map(Case::labels).collect();
    let durations: Vec<f64> = case_list.iter().map(|case| case.duration).collect();
    let mined = patterns::mine_patterns(&sequences, &durations, &params.miner);
    let variants = patterns::variants(&mined, params.min_variant_cases);
    let clusters = discovery::discover_workflows(&variants, params.similarity_threshold);

    let existing_patterns: Vec<String> = workflows::table
        .select(workflows::pattern)
        .load::<String>(conn)?
        .into_iter()
        .filter_map(|raw| serde_json::from_str::<WorkflowPattern>(&raw).ok())
        .map(|pattern| pattern.labels.join("\u{1f}"))
        .collect();

    let mut created = Vec::new();
    for discovered in &clusters {
        if existing_patterns.contains(&discovered.pattern.join("\u{1f}")) {
            continue;
        }
        let workflow = persist_discovered_workflow(conn, discovered, &events, &case_list)?;
        created.push(json!({
            "id": workflow.id,
            "name": workflow.name,
            "pattern": discovered.pattern,
            "status": workflow.status,
        }));
    }

    Ok(json!({
        "cases": case_list.len(),
        "variants": variants.iter().map(pattern_summary).collect::<Vec<_>>(),
        "workflows": created,
    }))
}

/// Matches one saved workflow over a fresh window.
pub fn match_workflow(
    conn: &mut SqliteConnection,
    workflow_id: &str,
    window: &MiningWindow,
) -> Result<Option<Value>, StoreError> {
    let workflow: Option<Workflow> = workflows::table
        .find(workflow_id)
        .first(conn)
        .optional()
        .map_err(StoreError::from)?;
    let Some(workflow) = workflow else {
        return Ok(None);
    };

    let events = load_mining_events(conn, window)?;
    let case_list = cases::build_cases(&events, window.max_gap_seconds, &[]);
    let created = match_workflow_against_cases(conn, &workflow, &events, &case_list)
        .map_err(StoreError::from)?;
    Ok(Some(json!({
        "workflow_id": workflow.id,
        "cases": case_list.len(),
        "occurrences_created": created,
    })))
}

fn cancelled(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

/// The on-demand analysis pipeline: extract new events, build cases, mine,
/// and reconcile variants with saved workflows. Each stage commits on its
/// own; cancellation aborts between stages or chunks and commits nothing
/// from the stage in progress.
pub async fn run_analysis(state: AppState, job_id: String, params: AnalysisParams) {
    let cancel = match state.analysis.try_begin(&job_id) {
        Ok(cancel) => cancel,
        Err(running) => {
            warn!(%job_id, %running, "analysis slot already taken");
            return;
        }
    };

    let outcome = run_analysis_stages(&state, &job_id, &params, &cancel).await;

    {
        let _writer = state.write_lock.lock().await;
        if let Ok(mut conn) = state.pool.get() {
            let _ = match &outcome {
                Ok(summary) => jobs::mark_done(&mut conn, &job_id, summary.clone()),
                Err(message) => jobs::mark_failed(&mut conn, &job_id, message),
            };
        }
    }
    state.analysis.finish(&job_id);
}

async fn set_progress(state: &AppState, job_id: &str, progress: f64) -> Result<(), String> {
    let _writer = state.write_lock.lock().await;
    let mut conn = state.pool.get().map_err(|err| err.to_string())?;
    jobs::update_progress(&mut conn, job_id, progress).map_err(|err| err.to_string())
}

async fn run_analysis_stages(
    state: &AppState,
    job_id: &str,
    params: &AnalysisParams,
    cancel: &Arc<AtomicBool>,
) -> Result<Value, String> {
    {
        let _writer = state.write_lock.lock().await;
        let mut conn = state.pool.get().map_err(|err| err.to_string())?;
        jobs::mark_running(&mut conn, job_id).map_err(|err| err.to_string())?;
    }

    // Extraction over events not yet processed, committed per chunk.
    let extracted = {
        let pool = state.pool.clone();
        let rules = state.rules.clone();
        let params = params.clone();
        let cancel = cancel.clone();
        let _writer = state.write_lock.lock().await;
        tokio::task::spawn_blocking(move || extraction_stage(&pool, &rules, &params, &cancel))
            .await
            .map_err(|err| err.to_string())?
    };
    let extracted = match extracted {
        Ok(value) => value,
        Err(StageError::Cancelled) => return Ok(json!({ "cancelled": true, "stage": "extract" })),
        Err(err) => return Err(err.to_string()),
    };
    set_progress(state, job_id, 0.4).await?;
    if cancelled(cancel) {
        return Ok(json!({ "cancelled": true, "extraction": extracted }));
    }

    // Cases and mining; read-only, single snapshot.
    let mining = {
        let pool = state.pool.clone();
        let params = params.clone();
        tokio::task::spawn_blocking(move || -> Result<Value, StageError> {
            let mut conn = pool.get().map_err(|err| StageError::Pool(err.to_string()))?;
            let events = load_mining_events(&mut conn, &params.window)?;
            let case_list = cases::build_cases(&events, params.window.max_gap_seconds, &[]);
            let sequences: Vec<Vec<String>> = case_list.iter().map(Case::labels).collect();
            let durations: Vec<f64> = case_list.iter().map(|case| case.duration).collect();
            let mined = patterns::mine_patterns(&sequences, &durations, &params.miner);
            let kept = patterns::variants(&mined, params.min_variant_cases);
            Ok(json!({
                "cases": case_list.len(),
                "patterns": mined.len(),
                "variants": kept.iter().map(pattern_summary).collect::<Vec<_>>(),
            }))
        })
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?
    };
    set_progress(state, job_id, 0.7).await?;
    if cancelled(cancel) {
        return Ok(json!({
            "cancelled": true,
            "extraction": extracted,
            "mining": mining,
        }));
    }

    // Reconcile: discover new workflows and match the saved ones, one
    // transaction for the whole stage.
    let reconciled = {
        let pool = state.pool.clone();
        let params = params.clone();
        let _writer = state.write_lock.lock().await;
        tokio::task::spawn_blocking(move || -> Result<Value, StageError> {
            let mut conn = pool.get().map_err(|err| StageError::Pool(err.to_string()))?;
            conn.transaction::<Value, StageError, _>(|conn| {
                let discovered = discover_workflows(conn, &params)?;
                let events = load_mining_events(conn, &params.window)?;
                let case_list = cases::build_cases(&events, params.window.max_gap_seconds, &[]);
                let saved: Vec<Workflow> = workflows::table
                    .filter(workflows::status.eq(WORKFLOW_ACTIVE))
                    .order(workflows::created_at.asc())
                    .load(conn)?;
                let mut occurrences_created = 0;
                for workflow in &saved {
                    occurrences_created +=
                        match_workflow_against_cases(conn, workflow, &events, &case_list)?;
                }
                Ok(json!({
                    "discovery": discovered,
                    "occurrences_created": occurrences_created,
                }))
            })
        })
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?
    };

    info!(%job_id, "analysis finished");
    Ok(json!({
        "extraction": extracted,
        "mining": mining,
        "reconciliation": reconciled,
    }))
}

fn extraction_stage(
    pool: &crate::db::SqlitePool,
    rules: &crate::ontology::RuleCache,
    params: &AnalysisParams,
    cancel: &AtomicBool,
) -> Result<Value, StageError> {
    let mut conn = pool
        .get()
        .map_err(|err| StageError::Pool(err.to_string()))?;
    let snapshot = rules.current(&mut conn)?;

    let watermark_key = format!(
        "extractor_watermark:{}",
        params.window.bucket.as_deref().unwrap_or("*")
    );
    let watermark = store::meta_get(&mut conn, &watermark_key)?
        .and_then(|raw| raw.parse::<NaiveDateTime>().ok());
    let start = watermark
        .map(|mark| mark.max(params.window.start))
        .unwrap_or(params.window.start);

    let events: Vec<Event> = store::read_events(
        &mut conn,
        params.window.bucket.as_deref(),
        start,
        params.window.end,
        None,
    )?;

    let mut events_processed = 0;
    let mut links_created = 0;
    for chunk in events.chunks(EVENT_CHUNK) {
        if cancelled(cancel) {
            return Err(StageError::Cancelled);
        }
        let summary = conn.transaction::<_, StageError, _>(|conn| {
            Ok(extractor::extract_events(conn, &snapshot, chunk)?)
        })?;
        events_processed += summary.events_processed;
        links_created += summary.links_created;
    }

    if let Some(last) = events.last() {
        let mark = last.timestamp.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
        store::meta_set(&mut conn, &watermark_key, &mark)?;
    }
    Ok(json!({
        "events_processed": events_processed,
        "links_created": links_created,
    }))
}
