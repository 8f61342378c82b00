use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);
pub const FAILOVER_WINDOW: Duration = Duration::from_secs(60);
pub const FAILOVER_THRESHOLD: u32 = 3;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("permanent provider failure: {0}")]
    Permanent(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider call timed out")]
    Timeout,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout)
    }
}

/// One object candidate returned by the model, per the fixed prompt schema.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateObject {
    pub object_type: String,
    pub identifier: String,
    pub identifier_key: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub prompt: String,
    pub image: Option<String>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<Vec<CandidateObject>, ProviderError>;
}

pub struct HttpProvider {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpProvider {
    pub fn new(url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            api_key,
            model,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    items: Vec<CandidateObject>,
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<Vec<CandidateObject>, ProviderError> {
        let body = json!({
            "model": self.model,
            "prompt": request.prompt,
            "image": request.image,
        });

        let mut builder = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Transient(err.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ProviderError::Transient(format!("status {status}")));
        }
        if status.is_client_error() {
            return Err(ProviderError::Permanent(format!("status {status}")));
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        Ok(parsed.items)
    }
}

struct FailoverState {
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    on_fallback_since: Option<Instant>,
}

/// Primary/fallback pair: three consecutive transient or timeout failures
/// within the window switch traffic to the fallback; the primary is probed
/// again once the window has elapsed.
pub struct FailoverProvider {
    primary: Box<dyn LlmProvider>,
    fallback: Option<Box<dyn LlmProvider>>,
    state: Mutex<FailoverState>,
}

impl FailoverProvider {
    pub fn new(primary: Box<dyn LlmProvider>, fallback: Option<Box<dyn LlmProvider>>) -> Self {
        Self {
            primary,
            fallback,
            state: Mutex::new(FailoverState {
                consecutive_failures: 0,
                first_failure_at: None,
                on_fallback_since: None,
            }),
        }
    }

    fn should_use_fallback(&self) -> bool {
        let mut state = self.state.lock().expect("failover state poisoned");
        match state.on_fallback_since {
            Some(since) if since.elapsed() < FAILOVER_WINDOW => self.fallback.is_some(),
            Some(_) => {
                state.on_fallback_since = None;
                state.consecutive_failures = 0;
                state.first_failure_at = None;
                info!("probing primary LLM provider again");
                false
            }
            None => false,
        }
    }

    fn record_primary_result(&self, failed: bool) {
        let mut state = self.state.lock().expect("failover state poisoned");
        if !failed {
            state.consecutive_failures = 0;
            state.first_failure_at = None;
            return;
        }
        let now = Instant::now();
        match state.first_failure_at {
            Some(first) if now.duration_since(first) <= FAILOVER_WINDOW => {
                state.consecutive_failures += 1;
            }
            _ => {
                state.first_failure_at = Some(now);
                state.consecutive_failures = 1;
            }
        }
        if state.consecutive_failures >= FAILOVER_THRESHOLD && self.fallback.is_some() {
            warn!("switching to fallback LLM provider");
            state.on_fallback_since = Some(now);
        }
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<Vec<CandidateObject>, ProviderError> {
        if self.should_use_fallback() {
            let fallback = self.fallback.as_ref().expect("fallback checked");
            return fallback.analyze(request).await;
        }

        let result = self.primary.analyze(request).await;
        match &result {
            Ok(_) => self.record_primary_result(false),
            Err(err) if err.is_retryable() => self.record_primary_result(true),
            Err(_) => {}
        }
        result
    }
}

/// Fixed prompt schema sent to the provider.
pub fn enrichment_prompt(text: &str) -> String {
    format!(
        "Identify business objects (orders, invoices, purchase orders, customers, \
         products, shipments) in the following screen text. Respond with a JSON \
         object {{\"items\": [{{\"object_type\", \"identifier\", \"identifier_key\", \
         \"confidence\"}}]}}.\n\n{text}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn analyze(
            &self,
            _request: &AnalyzeRequest,
        ) -> Result<Vec<CandidateObject>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProviderError::Transient("boom".to_string()))
            } else {
                Ok(vec![])
            }
        }
    }

    #[tokio::test]
    async fn fails_over_after_three_consecutive_transient_failures() {
        let provider = FailoverProvider::new(
            Box::new(ScriptedProvider {
                calls: AtomicU32::new(0),
                fail: true,
            }),
            Some(Box::new(ScriptedProvider {
                calls: AtomicU32::new(0),
                fail: false,
            })),
        );
        let request = AnalyzeRequest {
            prompt: "p".to_string(),
            image: None,
        };
        for _ in 0..3 {
            let _ = provider.analyze(&request).await;
        }
        // fourth call lands on the fallback and succeeds
        assert!(provider.analyze(&request).await.is_ok());
    }

    #[tokio::test]
    async fn stays_on_primary_without_fallback() {
        let provider = FailoverProvider::new(
            Box::new(ScriptedProvider {
                calls: AtomicU32::new(0),
                fail: true,
            }),
            None,
        );
        let request = AnalyzeRequest {
            prompt: "p".to_string(),
            image: None,
        };
        for _ in 0..5 {
            assert!(provider.analyze(&request).await.is_err());
        }
    }
}
