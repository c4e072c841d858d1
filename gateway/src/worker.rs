use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::metrics::GatewayMetrics;

/// Rewriting operations the backend workers implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationKind {
    Soften,
    Clarify,
    Structure,
    Summarize,
    Terminology,
    Requirements,
    Background,
}

impl TransformationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformationKind::Soften => "soften",
            TransformationKind::Clarify => "clarify",
            TransformationKind::Structure => "structure",
            TransformationKind::Summarize => "summarize",
            TransformationKind::Terminology => "terminology",
            TransformationKind::Requirements => "requirements",
            TransformationKind::Background => "background",
        }
    }

    /// Operations available to unauthenticated preview traffic.
    pub fn preview_allowed(&self) -> bool {
        matches!(
            self,
            TransformationKind::Soften | TransformationKind::Clarify | TransformationKind::Summarize
        )
    }
}

impl FromStr for TransformationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soften" => Ok(Self::Soften),
            "clarify" => Ok(Self::Clarify),
            "structure" => Ok(Self::Structure),
            "summarize" => Ok(Self::Summarize),
            "terminology" => Ok(Self::Terminology),
            "requirements" => Ok(Self::Requirements),
            "background" => Ok(Self::Background),
            other => Err(format!("unknown transformation '{other}'")),
        }
    }
}

impl fmt::Display for TransformationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ANALYSIS_TYPES: &[&str] = &["tone", "clarity", "priority", "sentiment"];

#[derive(Debug, Clone, Serialize)]
pub struct WorkerTransformRequest {
    pub text: String,
    pub transformation_type: TransformationKind,
    pub intensity_level: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_tone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTransformResponse {
    pub transformed_text: String,
    pub model: String,
    pub tokens_used: i64,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerAnalyzeRequest {
    pub text: String,
    pub analysis_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentScore {
    pub polarity: f64,
    pub subjectivity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAnalyzeResponse {
    pub tone: String,
    pub clarity_score: f64,
    pub priority: String,
    pub sentiment: SentimentScore,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Classified proxy failures. Cloneable so single-flight waiters can each
/// receive the leader's error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream call timed out")]
    Timeout,
    #[error("connection to upstream failed: {0}")]
    Connection(String),
    #[error("upstream returned server error {0}")]
    Server(u16),
    #[error("upstream rejected request with status {status}")]
    Client { status: u16, message: String },
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error("circuit open for '{0}'")]
    CircuitOpen(String),
}

impl ProxyError {
    /// 4xx responses surface to the caller without counting against the
    /// circuit; everything else is a backend-health signal.
    pub fn counts_against_circuit(&self) -> bool {
        !matches!(self, ProxyError::Client { .. } | ProxyError::CircuitOpen(_))
    }

    fn retryable(&self) -> bool {
        matches!(self, ProxyError::Timeout | ProxyError::Connection(_) | ProxyError::Server(_))
    }

    pub fn outcome_label(&self) -> &'static str {
        match self {
            ProxyError::Timeout => "timeout",
            ProxyError::Connection(_) => "connection_error",
            ProxyError::Server(_) => "server_error",
            ProxyError::Client { .. } => "client_error",
            ProxyError::Malformed(_) => "malformed_response",
            ProxyError::CircuitOpen(_) => "circuit_open",
        }
    }
}

#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn transform(
        &self,
        req: &WorkerTransformRequest,
        deadline: Instant,
        trace_id: Uuid,
    ) -> Result<WorkerTransformResponse, ProxyError>;

    async fn analyze(
        &self,
        req: &WorkerAnalyzeRequest,
        deadline: Instant,
        trace_id: Uuid,
    ) -> Result<WorkerAnalyzeResponse, ProxyError>;
}

/// Health-aware HTTP client for the stateless worker pool. A process-wide
/// semaphore caps concurrent RPCs.
pub struct WorkerClient {
    client: Client,
    base_url: String,
    breakers: Arc<BreakerRegistry>,
    retries: u32,
    max_response_bytes: usize,
    concurrency: Arc<tokio::sync::Semaphore>,
    metrics: Arc<GatewayMetrics>,
}

impl WorkerClient {
    pub fn new(
        client: Client,
        base_url: String,
        breakers: Arc<BreakerRegistry>,
        retries: u32,
        max_response_bytes: usize,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self::with_concurrency(client, base_url, breakers, retries, max_response_bytes, 64, metrics)
    }

    pub fn with_concurrency(
        client: Client,
        base_url: String,
        breakers: Arc<BreakerRegistry>,
        retries: u32,
        max_response_bytes: usize,
        max_concurrency: usize,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            breakers,
            retries: retries.min(2),
            max_response_bytes,
            concurrency: Arc::new(tokio::sync::Semaphore::new(max_concurrency.max(1))),
            metrics,
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        body: &(impl Serialize + Sync),
        deadline: Instant,
        trace_id: Uuid,
    ) -> Result<T, ProxyError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let _slot = tokio::time::timeout(remaining, self.concurrency.acquire())
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(|_| ProxyError::Connection("worker client shut down".into()))?;

        let url = format!("{}/{}", self.base_url, operation);
        let mut attempt: u32 = 0;
        loop {
            let breaker = self.breakers.get(&url);
            let permit = breaker
                .try_acquire()
                .map_err(|open| ProxyError::CircuitOpen(open.target))?;

            let start = Instant::now();
            let outcome = self.send::<T>(&url, body, deadline, trace_id).await;
            self.metrics.observe_worker_latency(start.elapsed().as_secs_f64());

            match outcome {
                Ok(value) => {
                    permit.succeed();
                    self.metrics.record_worker_call(operation, "ok");
                    return Ok(value);
                }
                Err(err) => {
                    if err.counts_against_circuit() {
                        permit.fail();
                    } else {
                        permit.succeed();
                    }
                    self.metrics.record_worker_call(operation, err.outcome_label());

                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if attempt < self.retries && err.retryable() && !remaining.is_zero() {
                        attempt += 1;
                        let pause = backoff_with_jitter(attempt).min(remaining);
                        debug!(operation, attempt, pause_ms = pause.as_millis() as u64, "retrying worker call");
                        tokio::time::sleep(pause).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &(impl Serialize + Sync),
        deadline: Instant,
        trace_id: Uuid,
    ) -> Result<T, ProxyError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProxyError::Timeout);
        }

        let response = self
            .client
            .post(url)
            .timeout(remaining)
            .header("X-Trace-ID", trace_id.to_string())
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProxyError::Server(status.as_u16()));
        }
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            let message: String = message.chars().take(512).collect();
            return Err(ProxyError::Client { status: status.as_u16(), message });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(ProxyError::Malformed("unexpected content type".into()));
        }
        if let Some(length) = response.content_length() {
            if length as usize > self.max_response_bytes {
                return Err(ProxyError::Malformed("response exceeds size cap".into()));
            }
        }

        let bytes = response.bytes().await.map_err(classify_transport)?;
        if bytes.len() > self.max_response_bytes {
            return Err(ProxyError::Malformed("response exceeds size cap".into()));
        }
        serde_json::from_slice(&bytes).map_err(|err| ProxyError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl WorkerApi for WorkerClient {
    async fn transform(
        &self,
        req: &WorkerTransformRequest,
        deadline: Instant,
        trace_id: Uuid,
    ) -> Result<WorkerTransformResponse, ProxyError> {
        self.execute("transform", req, deadline, trace_id).await
    }

    async fn analyze(
        &self,
        req: &WorkerAnalyzeRequest,
        deadline: Instant,
        trace_id: Uuid,
    ) -> Result<WorkerAnalyzeResponse, ProxyError> {
        self.execute("analyze", req, deadline, trace_id).await
    }
}

fn classify_transport(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::Timeout
    } else {
        ProxyError::Connection(err.to_string())
    }
}

/// Exponential backoff with full jitter: uniform over [0, 100ms * 2^attempt].
fn backoff_with_jitter(attempt: u32) -> Duration {
    let ceiling_ms = 100u64.saturating_mul(1 << attempt.min(6));
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
}
