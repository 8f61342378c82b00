use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub store_path: PathBuf,
    pub server_host: String,
    pub server_port: u16,
    pub cors_allowed_origin: Option<String>,
    pub llm_provider_url: Option<String>,
    pub llm_fallback_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_workers: usize,
    pub llm_queue_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let store_path = match env::var("STORE_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_store_path(),
        };
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "5700".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let llm_provider_url = env::var("LLM_PROVIDER_URL").ok();
        let llm_fallback_url = env::var("LLM_FALLBACK_URL").ok();
        let llm_api_key = env::var("LLM_API_KEY").ok();
        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let llm_workers = env::var("LLM_WORKERS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .context("LLM_WORKERS must be an integer")?;
        let llm_queue_capacity = env::var("LLM_QUEUE_CAPACITY")
            .unwrap_or_else(|_| "256".to_string())
            .parse()
            .context("LLM_QUEUE_CAPACITY must be an integer")?;

        Ok(Self {
            store_path,
            server_host,
            server_port,
            cors_allowed_origin,
            llm_provider_url,
            llm_fallback_url,
            llm_api_key,
            llm_model,
            llm_workers,
            llm_queue_capacity,
        })
    }
}

fn default_store_path() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("procmine")
        .join("state.db")
}

#[cfg(test)]
mod tests {
    use super::default_store_path;

    #[test]
    fn default_store_path_is_under_local_share() {
        let path = default_store_path();
        let rendered = path.to_string_lossy();
        assert!(rendered.ends_with(".local/share/procmine/state.db"));
    }
}
