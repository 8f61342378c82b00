use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::SqlitePool;
use crate::store;

pub mod cache;
pub mod provider;

use cache::FingerprintCache;
use provider::{AnalyzeRequest, LlmProvider, ProviderError, PROVIDER_TIMEOUT};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WORKERS: usize = 2;
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;
pub const AUTO_LINK_THRESHOLD: f64 = 0.8;
const RETRY_BASE: Duration = Duration::from_millis(500);
const MAX_RETRIES: u32 = 3;
const MIN_OCR_LENGTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Normal,
}

#[derive(Debug, Clone)]
pub struct EnrichmentTask {
    pub bucket_id: String,
    pub event_id: i64,
    pub fingerprint: String,
    pub text: String,
    pub image: Option<String>,
    pub priority: TaskPriority,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub completed: AtomicU64,
    pub cache_hits: AtomicU64,
    pub provider_failures: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub completed: u64,
    pub cache_hits: u64,
    pub provider_failures: u64,
}

struct QueueLanes {
    high: VecDeque<EnrichmentTask>,
    normal: VecDeque<EnrichmentTask>,
}

impl QueueLanes {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

/// Bounded two-priority FIFO. Producers never block: at capacity the oldest
/// unstarted task is discarded and counted.
pub struct EnrichmentQueue {
    lanes: Mutex<QueueLanes>,
    notify: Notify,
    capacity: usize,
    pub counters: QueueCounters,
}

impl EnrichmentQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(QueueLanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            counters: QueueCounters::default(),
        }
    }

    pub fn push(&self, task: EnrichmentTask) {
        {
            let mut lanes = self.lanes.lock().expect("queue poisoned");
            if lanes.len() >= self.capacity {
                let discarded = lanes.normal.pop_front().or_else(|| lanes.high.pop_front());
                if discarded.is_some() {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            match task.priority {
                TaskPriority::High => lanes.high.push_back(task),
                TaskPriority::Normal => lanes.normal.push_back(task),
            }
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<EnrichmentTask> {
        let mut lanes = self.lanes.lock().expect("queue poisoned");
        lanes.high.pop_front().or_else(|| lanes.normal.pop_front())
    }

    pub async fn pop(&self) -> EnrichmentTask {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.try_pop() {
                return task;
            }
            notified.await;
        }
    }

    pub fn depth(&self) -> usize {
        self.lanes.lock().expect("queue poisoned").len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            depth: self.depth(),
            capacity: self.capacity,
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            provider_failures: self.counters.provider_failures.load(Ordering::Relaxed),
        }
    }
}

/// Builds an enrichment task for an event whose payload warrants a model
/// pass: a screenshot, or an OCR block long enough that the textual rules
/// are unlikely to cover it.
pub fn task_for_event(
    bucket_id: &str,
    event_id: i64,
    data: &Value,
    priority: TaskPriority,
) -> Option<EnrichmentTask> {
    let ocr_text = data.get("ocr_text").and_then(Value::as_str).unwrap_or("");
    let screenshot = data.get("screenshot").and_then(Value::as_str);
    if screenshot.is_none() && ocr_text.len() < MIN_OCR_LENGTH {
        return None;
    }

    let title = data.get("title").and_then(Value::as_str).unwrap_or("");
    let text = format!("{title}\n{ocr_text}");
    let fingerprint = cache::content_fingerprint(bucket_id, event_id, &text, screenshot);
    Some(EnrichmentTask {
        bucket_id: bucket_id.to_string(),
        event_id,
        fingerprint,
        text,
        image: screenshot.map(|s| s.to_string()),
        priority,
        deadline: None,
    })
}

pub struct WorkerContext {
    pub pool: SqlitePool,
    pub write_lock: Arc<tokio::sync::Mutex<()>>,
    pub queue: Arc<EnrichmentQueue>,
    pub provider: Arc<dyn LlmProvider>,
    pub cache: Arc<FingerprintCache>,
}

/// Spawns the fixed worker pool. Each worker holds at most one outstanding
/// provider call.
pub fn spawn_workers(context: Arc<WorkerContext>, workers: usize) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker_index| {
            let context = context.clone();
            tokio::spawn(async move {
                debug!(worker = worker_index, "enrichment worker started");
                loop {
                    let task = context.queue.pop().await;
                    process_task(&context, task).await;
                }
            })
        })
        .collect()
}

async fn process_task(context: &WorkerContext, task: EnrichmentTask) {
    if task
        .deadline
        .is_some_and(|deadline| Instant::now() >= deadline)
    {
        context.queue.counters.dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if context.cache.contains(&task.fingerprint) {
        context
            .queue
            .counters
            .cache_hits
            .fetch_add(1, Ordering::Relaxed);
        return;
    }

    let request = AnalyzeRequest {
        prompt: provider::enrichment_prompt(&task.text),
        image: task.image.clone(),
    };

    let mut attempt = 0;
    let items = loop {
        let result = tokio::time::timeout(PROVIDER_TIMEOUT, context.provider.analyze(&request))
            .await
            .map_err(|_| ProviderError::Timeout)
            .and_then(|inner| inner);
        match result {
            Ok(items) => break items,
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0.8..=1.2);
                let delay = RETRY_BASE.mul_f64(2f64.powi(attempt as i32 - 1) * jitter);
                warn!(
                    bucket = %task.bucket_id,
                    event = task.event_id,
                    attempt,
                    error = %err,
                    "enrichment retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(
                    bucket = %task.bucket_id,
                    event = task.event_id,
                    error = %err,
                    "enrichment dropped"
                );
                context
                    .queue
                    .counters
                    .provider_failures
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    };

    if let Err(err) = persist_items(context, &task, items).await {
        error!(
            bucket = %task.bucket_id,
            event = task.event_id,
            error = %err,
            "failed to persist enrichment results"
        );
        return;
    }

    context.cache.insert(task.fingerprint.clone());
    context
        .queue
        .counters
        .completed
        .fetch_add(1, Ordering::Relaxed);
}

async fn persist_items(
    context: &WorkerContext,
    task: &EnrichmentTask,
    items: Vec<provider::CandidateObject>,
) -> anyhow::Result<()> {
    let accepted: Vec<provider::CandidateObject> = items
        .into_iter()
        .filter(|item| item.confidence >= LOW_CONFIDENCE_THRESHOLD)
        .collect();
    if accepted.is_empty() {
        return Ok(());
    }

    let _writer = context.write_lock.lock().await;
    let pool = context.pool.clone();
    let bucket_id = task.bucket_id.clone();
    let event_id = task.event_id;

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut conn = pool.get()?;
        for item in accepted {
            if item.confidence >= AUTO_LINK_THRESHOLD {
                let key = item.identifier_key.as_deref().unwrap_or("identifier");
                let data = serde_json::json!({ key: item.identifier });
                match store::upsert_object(&mut conn, &item.object_type, &item.identifier, &data, false)
                {
                    Ok(object) => {
                        store::link_event_to_object(
                            &mut conn,
                            &bucket_id,
                            event_id,
                            &object.id,
                            "llm",
                            item.confidence,
                        )?;
                    }
                    Err(store::StoreError::UnknownObjectType(object_type)) => {
                        warn!(%object_type, "model proposed unknown object type; queueing for review");
                        insert_review_task(&mut conn, &bucket_id, event_id, &item)?;
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                insert_review_task(&mut conn, &bucket_id, event_id, &item)?;
            }
        }
        Ok(())
    })
    .await?
}

fn insert_review_task(
    conn: &mut diesel::SqliteConnection,
    bucket_id: &str,
    event_id: i64,
    item: &provider::CandidateObject,
) -> anyhow::Result<()> {
    use diesel::prelude::*;

    use crate::models::NewReviewTask;
    use crate::schema::review_tasks;

    let now = chrono::Utc::now().naive_utc();
    diesel::insert_into(review_tasks::table)
        .values(NewReviewTask {
            id: Uuid::new_v4().to_string(),
            bucket_id: bucket_id.to_string(),
            event_id,
            object_type: item.object_type.clone(),
            object_name: item.identifier.clone(),
            identifier_key: item.identifier_key.clone(),
            data: serde_json::json!({}).to_string(),
            confidence: item.confidence,
            provenance: "llm".to_string(),
            status: "pending".to_string(),
            created_at: now,
            updated_at: now,
        })
        .execute(conn)?;
    Ok(())
}
