use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::SqliteConnection;
use http_body_util::BodyExt;
use serde::Serialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use procmine::config::AppConfig;
use procmine::db;
use procmine::llm::EnrichmentQueue;
use procmine::ontology::seed;
use procmine::routes;
use procmine::state::AppState;

pub struct TestApp {
    pub state: AppState,
    router: Router,
    _store_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let store_dir = tempfile::tempdir().context("failed to create temp store dir")?;
        let store_path = store_dir.path().join("state.db");

        let config = AppConfig {
            store_path: store_path.clone(),
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            cors_allowed_origin: None,
            llm_provider_url: None,
            llm_fallback_url: None,
            llm_api_key: None,
            llm_model: "test-model".to_string(),
            llm_workers: 2,
            llm_queue_capacity: 16,
        };

        let pool = db::init_pool_with_size(&store_path.to_string_lossy(), 4)?;
        {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
            db::run_migrations(&mut conn)?;
            seed::seed_defaults(&mut conn).context("failed to seed defaults")?;
        }

        let enrichment = Arc::new(EnrichmentQueue::new(config.llm_queue_capacity));
        let state = AppState::new(pool, config, enrichment);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            _store_dir: store_dir,
        })
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        let body = match payload {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value)?)
            }
            None => Body::empty(),
        };
        let request = builder.body(body)?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        self.request(Method::POST, path, Some(serde_json::to_value(payload)?))
            .await
    }

    #[allow(dead_code)]
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        self.request(Method::PUT, path, Some(serde_json::to_value(payload)?))
            .await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str) -> Result<hyper::Response<Body>> {
        self.request(Method::DELETE, path, None).await
    }

    /// Ingests a batch of events into a bucket and asserts success.
    #[allow(dead_code)]
    pub async fn ingest(&self, bucket: &str, events: Value) -> Result<Value> {
        let response = self
            .post_json(&format!("/api/0/buckets/{bucket}/events"), &events)
            .await?;
        ensure!(
            response.status() == StatusCode::OK,
            "ingest failed with status {}",
            response.status()
        );
        body_json(response.into_body()).await
    }

    /// Polls a job until it leaves the queued/running states.
    #[allow(dead_code)]
    pub async fn wait_for_job(&self, job_id: &str) -> Result<Value> {
        for _ in 0..200 {
            let response = self.get(&format!("/api/0/jobs/{job_id}")).await?;
            ensure!(
                response.status() == StatusCode::OK,
                "job lookup failed with status {}",
                response.status()
            );
            let body = body_json(response.into_body()).await?;
            match body["state"].as_str() {
                Some("queued") | Some("running") => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Some(_) => return Ok(body),
                None => return Err(anyhow!("job response missing state: {body}")),
            }
        }
        Err(anyhow!("job {job_id} did not finish in time"))
    }

    #[allow(dead_code)]
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn body_json(body: Body) -> Result<Value> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    let bytes = collected.to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|err| anyhow!("response body is not JSON ({err}): {:?}", bytes))
}

/// Window event with an `app` label, the shape watchers emit.
#[allow(dead_code)]
pub fn app_event(id: i64, timestamp: &str, duration: f64, app: &str, title: &str) -> Value {
    json!({
        "id": id,
        "timestamp": timestamp,
        "duration": duration,
        "data": { "app": app, "title": title },
    })
}
