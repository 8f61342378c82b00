use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::sqlite::SqliteConnection;

use crate::{
    config::AppConfig,
    db::SqlitePool,
    error::{AppError, AppResult},
    llm::EnrichmentQueue,
    ontology::RuleCache,
};

pub type PooledSqliteConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

struct RunningAnalysis {
    job_id: String,
    cancel: Arc<AtomicBool>,
}

/// At most one analysis job may run at a time. The slot hands out a cancel
/// flag for the running job and rejects concurrent begins with the
/// in-flight id.
#[derive(Default)]
pub struct AnalysisSlot {
    inner: Mutex<Option<RunningAnalysis>>,
}

impl AnalysisSlot {
    pub fn try_begin(&self, job_id: &str) -> Result<Arc<AtomicBool>, String> {
        let mut inner = self.inner.lock().expect("analysis slot poisoned");
        if let Some(running) = inner.as_ref() {
            return Err(running.job_id.clone());
        }
        let cancel = Arc::new(AtomicBool::new(false));
        *inner = Some(RunningAnalysis {
            job_id: job_id.to_string(),
            cancel: cancel.clone(),
        });
        Ok(cancel)
    }

    pub fn finish(&self, job_id: &str) {
        let mut inner = self.inner.lock().expect("analysis slot poisoned");
        if inner.as_ref().is_some_and(|running| running.job_id == job_id) {
            *inner = None;
        }
    }

    pub fn running_job(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("analysis slot poisoned")
            .as_ref()
            .map(|running| running.job_id.clone())
    }

    pub fn request_cancel(&self, job_id: &str) -> bool {
        let inner = self.inner.lock().expect("analysis slot poisoned");
        match inner.as_ref() {
            Some(running) if running.job_id == job_id => {
                running.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<AppConfig>,
    /// Serialises all mutating store operations; never held across a
    /// network call.
    pub write_lock: Arc<tokio::sync::Mutex<()>>,
    pub rules: Arc<RuleCache>,
    pub enrichment: Arc<EnrichmentQueue>,
    pub analysis: Arc<AnalysisSlot>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: AppConfig, enrichment: Arc<EnrichmentQueue>) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            rules: Arc::new(RuleCache::new()),
            enrichment,
            analysis: Arc::new(AnalysisSlot::default()),
        }
    }

    pub fn db(&self) -> AppResult<PooledSqliteConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
