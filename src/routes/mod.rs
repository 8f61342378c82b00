use std::time::Duration;

use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;

/// Job-triggering endpoints respond immediately with a job id, so one
/// request budget covers every route.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

use crate::error::AppError;
use crate::state::AppState;

pub mod events;
pub mod health;
pub mod mining;
pub mod object_types;
pub mod objects;
pub mod rules;
pub mod steps;
pub mod training;
pub mod workflows;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
    };

    let object_types_routes = Router::new()
        .route(
            "/",
            get(object_types::list_object_types).post(object_types::create_object_type),
        )
        .route(
            "/:id",
            get(object_types::get_object_type)
                .put(object_types::update_object_type)
                .delete(object_types::delete_object_type),
        );

    let objects_routes = Router::new()
        .route("/", get(objects::list_objects).post(objects::create_object))
        .route(
            "/:id",
            get(objects::get_object)
                .put(objects::update_object)
                .delete(objects::delete_object),
        )
        .route("/:id/events", get(objects::list_object_events));

    let rules_routes = Router::new()
        .route("/", get(rules::list_rules).post(rules::create_rule))
        .route("/run", post(rules::run_rules))
        .route(
            "/:id",
            get(rules::get_rule)
                .put(rules::update_rule)
                .delete(rules::delete_rule),
        )
        .route("/:id/test", post(rules::test_rule));

    let buckets_routes = Router::new()
        .route(
            "/:bucket/events",
            get(events::list_bucket_events).post(events::ingest_events),
        )
        .route(
            "/:bucket/events/:event/objects",
            get(events::list_event_objects).post(events::link_event_object),
        )
        .route(
            "/:bucket/events/:event/objects/:object_id",
            delete(events::unlink_event_object),
        )
        .route(
            "/:bucket/events/:event/objects/:object_id/confirm",
            post(events::confirm_link),
        )
        .route(
            "/:bucket/events/:event/objects/:object_id/reject",
            post(events::reject_link),
        )
        .route(
            "/:bucket/events/:event/objects/:object_id/correct",
            post(events::correct_link),
        );

    let training_routes = Router::new()
        .route("/pending", get(training::list_pending))
        .route("/:task_id/confirm", post(training::confirm_task))
        .route("/:task_id/reject", post(training::reject_task))
        .route("/:task_id/correct", post(training::correct_task));

    let steps_routes = Router::new()
        .route("/", get(steps::list_steps).post(steps::create_step))
        .route(
            "/:id",
            get(steps::get_step)
                .put(steps::update_step)
                .delete(steps::delete_step),
        )
        .route("/:id/objects", post(steps::attach_object))
        .route("/:id/objects/:object_id", delete(steps::detach_object));

    let workflows_routes = Router::new()
        .route(
            "/",
            get(workflows::list_workflows).post(workflows::create_workflow),
        )
        .route(
            "/:id",
            get(workflows::get_workflow)
                .put(workflows::update_workflow)
                .delete(workflows::delete_workflow),
        )
        .route("/:id/objects", post(workflows::attach_object))
        .route(
            "/:id/objects/:object_id",
            delete(workflows::detach_object),
        )
        .route("/:id/occurrences", get(workflows::list_occurrences))
        .route("/:id/occurrences/:occ_id", get(workflows::get_occurrence));

    let mining_routes = Router::new()
        .route("/patterns", post(mining::mine_patterns))
        .route("/group-events", post(mining::group_events))
        .route("/discover-workflows", post(mining::discover_workflows))
        .route("/match-workflow", post(mining::match_workflow));

    let api = Router::new()
        .nest("/object-types", object_types_routes)
        .nest("/objects", objects_routes)
        .nest("/extraction-rules", rules_routes)
        .nest("/buckets", buckets_routes)
        .nest("/training", training_routes)
        .nest("/steps", steps_routes)
        .nest("/workflows", workflows_routes)
        .nest("/mining", mining_routes)
        .route("/jobs/:job_id", get(mining::get_job))
        .route("/stats", get(health::stats))
        .route("/health", get(health::health_check));

    Router::new()
        .nest("/api/0", api)
        .with_state(state)
        .layer(cors)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(DefaultBodyLimit::max(1024 * 1024 * 32))
}

/// Accepts RFC-3339 timestamps, with or without an explicit offset.
pub(crate) fn parse_timestamp(raw: &str, field: &str) -> Result<NaiveDateTime, AppError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc).naive_utc());
    }
    raw.parse::<NaiveDateTime>()
        .map_err(|_| AppError::invalid_argument(format!("{field} is not a valid timestamp")))
}

pub(crate) fn to_rfc3339(timestamp: NaiveDateTime) -> String {
    timestamp.and_utc().to_rfc3339()
}
