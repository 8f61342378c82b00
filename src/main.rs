use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use procmine::config::AppConfig;
use procmine::db;
use procmine::llm::{
    self,
    cache::FingerprintCache,
    provider::{FailoverProvider, HttpProvider, LlmProvider},
    EnrichmentQueue, WorkerContext,
};
use procmine::ontology::seed;
use procmine::routes;
use procmine::state::AppState;

const EXIT_INIT_ERROR: u8 = 1;
const EXIT_BIND_ERROR: u8 = 2;
const EXIT_MIGRATION_ERROR: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::from(EXIT_INIT_ERROR);
        }
    };
    tracing::info!(
        store_path = %config.store_path.display(),
        llm_workers = config.llm_workers,
        llm_queue_capacity = config.llm_queue_capacity,
        "loaded configuration"
    );

    if let Some(parent) = config.store_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            tracing::error!(error = %err, "cannot create store directory");
            return ExitCode::from(EXIT_INIT_ERROR);
        }
    }

    let pool = match db::init_pool(&config.store_path.to_string_lossy()) {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(error = %err, "cannot open store");
            return ExitCode::from(EXIT_INIT_ERROR);
        }
    };

    {
        let mut conn = match pool.get() {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, "cannot open store connection");
                return ExitCode::from(EXIT_INIT_ERROR);
            }
        };
        if let Err(err) = db::run_migrations(&mut conn) {
            tracing::error!(error = %err, "store migration failed");
            return ExitCode::from(EXIT_MIGRATION_ERROR);
        }
        if let Err(err) = seed::seed_defaults(&mut conn) {
            tracing::error!(error = %err, "seeding default ontology failed");
            return ExitCode::from(EXIT_INIT_ERROR);
        }
    }

    let enrichment = Arc::new(EnrichmentQueue::new(config.llm_queue_capacity));
    let state = AppState::new(pool.clone(), config.clone(), enrichment.clone());

    let _workers = match build_provider(&config) {
        Some(provider) => {
            let context = Arc::new(WorkerContext {
                pool,
                write_lock: state.write_lock.clone(),
                queue: enrichment,
                provider,
                cache: Arc::new(FingerprintCache::default()),
            });
            llm::spawn_workers(context, config.llm_workers)
        }
        None => {
            tracing::warn!("LLM_PROVIDER_URL not set; enrichment disabled");
            Vec::new()
        }
    };

    let address = format!("{}:{}", config.server_host, config.server_port);
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%address, error = %err, "cannot bind server port");
            return ExitCode::from(EXIT_BIND_ERROR);
        }
    };
    tracing::info!(%address, "listening");

    let router = routes::create_router(state);
    let serve = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
    });

    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server error");
        return ExitCode::from(EXIT_INIT_ERROR);
    }
    ExitCode::SUCCESS
}

fn build_provider(config: &AppConfig) -> Option<Arc<dyn LlmProvider>> {
    let primary_url = config.llm_provider_url.clone()?;
    let primary = Box::new(HttpProvider::new(
        primary_url,
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let fallback = config.llm_fallback_url.clone().map(|url| {
        Box::new(HttpProvider::new(
            url,
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        )) as Box<dyn LlmProvider>
    });
    Some(Arc::new(FailoverProvider::new(primary, fallback)))
}

fn init_tracing() {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
