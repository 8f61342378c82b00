use axum::{
    extract::{Path, State},
    Json,
};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::jobs;
use crate::mining::patterns::MinerOptions;
use crate::orchestrator::{
    self, AnalysisParams, MiningWindow, StageError, SYNC_EVENT_LIMIT,
};
use crate::routes::parse_timestamp;
use crate::state::AppState;
use crate::store;

/// Runs `runner` as a background job guarded by the analysis slot: a second
/// trigger while one job runs is rejected with the in-flight id.
pub(crate) async fn spawn_guarded_job<F>(
    state: &AppState,
    job_type: &str,
    payload: Value,
    runner: F,
) -> AppResult<String>
where
    F: FnOnce(&mut SqliteConnection) -> Result<Value, String> + Send + 'static,
{
    let job_id = Uuid::new_v4().to_string();
    state
        .analysis
        .try_begin(&job_id)
        .map_err(|running| AppError::job_in_progress(&running))?;

    {
        let _writer = state.write_lock.lock().await;
        let mut conn = match state.db() {
            Ok(conn) => conn,
            Err(err) => {
                state.analysis.finish(&job_id);
                return Err(err);
            }
        };
        if let Err(err) = jobs::create_job_with_id(&mut conn, &job_id, job_type, payload) {
            state.analysis.finish(&job_id);
            return Err(AppError::internal(err));
        }
    }

    let task_state = state.clone();
    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        {
            let _writer = task_state.write_lock.lock().await;
            if let Ok(mut conn) = task_state.pool.get() {
                let _ = jobs::mark_running(&mut conn, &task_job_id);
            }
        }

        let result = {
            let _writer = task_state.write_lock.lock().await;
            let pool = task_state.pool.clone();
            tokio::task::spawn_blocking(move || {
                let mut conn = pool.get().map_err(|err| err.to_string())?;
                runner(&mut conn)
            })
            .await
            .unwrap_or_else(|err| Err(err.to_string()))
        };

        {
            let _writer = task_state.write_lock.lock().await;
            if let Ok(mut conn) = task_state.pool.get() {
                let _ = match &result {
                    Ok(value) => jobs::mark_done(&mut conn, &task_job_id, value.clone()),
                    Err(message) => jobs::mark_failed(&mut conn, &task_job_id, message),
                };
            }
        }
        task_state.analysis.finish(&task_job_id);
    });

    Ok(job_id)
}

#[derive(Deserialize)]
pub struct MiningRequest {
    pub start: String,
    pub end: String,
    pub bucket: Option<String>,
    pub min_support: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub max_gap_seconds: Option<f64>,
    pub contiguous: Option<bool>,
    pub min_occurrences: Option<usize>,
    pub similarity_threshold: Option<f64>,
    pub key: Option<String>,
}

impl MiningRequest {
    fn params(&self) -> AppResult<AnalysisParams> {
        let start = parse_timestamp(&self.start, "start")?;
        let end = parse_timestamp(&self.end, "end")?;
        if end < start {
            return Err(AppError::invalid_argument("end precedes start"));
        }
        let mut window = MiningWindow::new(self.bucket.clone(), start, end);
        if let Some(max_gap) = self.max_gap_seconds {
            if max_gap <= 0.0 {
                return Err(AppError::invalid_argument("max_gap_seconds must be positive"));
            }
            window.max_gap_seconds = max_gap;
        }

        let defaults = MinerOptions::default();
        let mut params = AnalysisParams::new(window);
        params.miner = MinerOptions {
            min_support: self.min_support.unwrap_or(defaults.min_support),
            min_length: self.min_length.unwrap_or(defaults.min_length).max(2),
            max_length: self.max_length.unwrap_or(defaults.max_length),
            contiguous: self.contiguous.unwrap_or(defaults.contiguous),
        };
        if params.miner.max_length < params.miner.min_length {
            return Err(AppError::invalid_argument(
                "max_length is below min_length",
            ));
        }
        if let Some(min_occurrences) = self.min_occurrences {
            params.min_variant_cases = min_occurrences.max(1);
        }
        if let Some(threshold) = self.similarity_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(AppError::invalid_argument(
                    "similarity_threshold must be within 0..1",
                ));
            }
            params.similarity_threshold = threshold;
        }
        Ok(params)
    }

    fn tag(&self, mut value: Value) -> Value {
        if let (Some(key), Some(map)) = (&self.key, value.as_object_mut()) {
            map.insert("key".to_string(), Value::String(key.clone()));
        }
        value
    }
}

fn window_is_small(state: &AppState, window: &MiningWindow) -> AppResult<bool> {
    let mut conn = state.db()?;
    let count = store::count_events(&mut conn, window.bucket.as_deref(), window.start, window.end)
        .map_err(AppError::internal)?;
    Ok(count < SYNC_EVENT_LIMIT)
}

pub async fn mine_patterns(
    State(state): State<AppState>,
    Json(payload): Json<MiningRequest>,
) -> AppResult<Json<Value>> {
    let params = payload.params()?;

    if window_is_small(&state, &params.window)? {
        let mut conn = state.db()?;
        let result = orchestrator::compute_patterns(&mut conn, &params)
            .map_err(AppError::internal)?;
        return Ok(Json(payload.tag(result)));
    }

    let job_id = spawn_guarded_job(
        &state,
        jobs::JOB_MINE_PATTERNS,
        json!({ "start": payload.start, "end": payload.end, "bucket": payload.bucket }),
        move |conn| orchestrator::compute_patterns(conn, &params).map_err(|err| err.to_string()),
    )
    .await?;
    Ok(Json(json!({ "job_id": job_id })))
}

pub async fn group_events(
    State(state): State<AppState>,
    Json(payload): Json<MiningRequest>,
) -> AppResult<Json<Value>> {
    let params = payload.params()?;

    if window_is_small(&state, &params.window)? {
        let _writer = state.write_lock.lock().await;
        let mut conn = state.db()?;
        let result = conn
            .transaction::<Value, StageError, _>(|conn| {
                Ok(orchestrator::group_events(conn, &params.window)?)
            })
            .map_err(AppError::internal)?;
        return Ok(Json(payload.tag(result)));
    }

    let job_id = spawn_guarded_job(
        &state,
        jobs::JOB_GROUP_EVENTS,
        json!({ "start": payload.start, "end": payload.end, "bucket": payload.bucket }),
        move |conn| {
            conn.transaction::<Value, StageError, _>(|conn| {
                Ok(orchestrator::group_events(conn, &params.window)?)
            })
            .map_err(|err| err.to_string())
        },
    )
    .await?;
    Ok(Json(json!({ "job_id": job_id })))
}

pub async fn discover_workflows(
    State(state): State<AppState>,
    Json(payload): Json<MiningRequest>,
) -> AppResult<Json<Value>> {
    let params = payload.params()?;

    if window_is_small(&state, &params.window)? {
        let _writer = state.write_lock.lock().await;
        let mut conn = state.db()?;
        let result = conn
            .transaction::<Value, StageError, _>(|conn| {
                Ok(orchestrator::discover_workflows(conn, &params)?)
            })
            .map_err(AppError::internal)?;
        return Ok(Json(payload.tag(result)));
    }

    // Large windows run the full pipeline: extraction, mining, reconcile.
    if let Some(running) = state.analysis.running_job() {
        return Err(AppError::job_in_progress(&running));
    }
    let job = {
        let _writer = state.write_lock.lock().await;
        let mut conn = state.db()?;
        jobs::create_job(
            &mut conn,
            jobs::JOB_ANALYZE,
            json!({ "start": payload.start, "end": payload.end, "bucket": payload.bucket }),
        )
        .map_err(AppError::internal)?
    };
    tokio::spawn(orchestrator::run_analysis(
        state.clone(),
        job.id.clone(),
        params,
    ));
    Ok(Json(json!({ "job_id": job.id })))
}

#[derive(Deserialize)]
pub struct MatchWorkflowRequest {
    pub workflow_id: Uuid,
    #[serde(flatten)]
    pub window: MiningRequest,
}

pub async fn match_workflow(
    State(state): State<AppState>,
    Json(payload): Json<MatchWorkflowRequest>,
) -> AppResult<Json<Value>> {
    let params = payload.window.params()?;
    let workflow_id = payload.workflow_id.to_string();

    if window_is_small(&state, &params.window)? {
        let _writer = state.write_lock.lock().await;
        let mut conn = state.db()?;
        let result = conn
            .transaction::<Option<Value>, StageError, _>(|conn| {
                Ok(orchestrator::match_workflow(conn, &workflow_id, &params.window)?)
            })
            .map_err(AppError::internal)?;
        let result = result.ok_or_else(|| AppError::not_found("workflow"))?;
        return Ok(Json(payload.window.tag(result)));
    }

    let job_id = spawn_guarded_job(
        &state,
        jobs::JOB_MATCH_WORKFLOW,
        json!({
            "workflow_id": workflow_id,
            "start": payload.window.start,
            "end": payload.window.end,
        }),
        move |conn| {
            let matched = conn
                .transaction::<Option<Value>, StageError, _>(|conn| {
                    Ok(orchestrator::match_workflow(conn, &workflow_id, &params.window)?)
                })
                .map_err(|err| err.to_string())?;
            matched.ok_or_else(|| "workflow not found".to_string())
        },
    )
    .await?;
    Ok(Json(json!({ "job_id": job_id })))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let job = jobs::get_job(&mut conn, &job_id.to_string())
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found("job"))?;

    let result: Option<Value> = job
        .result
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(Json(json!({
        "state": job.status,
        "progress": job.progress,
        "error": job.error,
        "result_ref": result,
    })))
}
