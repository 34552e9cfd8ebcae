//! The runner seam: where inference actually happens.
//!
//! Concrete model backends (llama.cpp, vLLM, OpenAI- and Anthropic-shaped
//! servers, CPU stats) are external collaborators; this module defines the
//! capability set they implement plus the two built-in variants: a mock for
//! tests and unpriced deployments, and a generic HTTP pass-through.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use url::Url;

use crate::config::{NodeConfig, RunnerConfig, RunnerKind, SandboxMode};
use crate::proto::{InferenceRequest, InferenceResponse, ModelInfo, Usage};
use crate::scheduler::estimate_input_tokens;

/// One streamed output fragment.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Delta {
    pub delta: String,
}

/// Runner liveness report.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunnerHealth {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Pre-flight cost and latency guesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerEstimate {
    pub cost_estimate: Option<f64>,
    pub latency_estimate_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("runner failed: {0}")]
    Failed(String),
    #[error("runner transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("runner does not support {0}")]
    Unsupported(&'static str),
    #[error("sandbox policy rejects {0}")]
    SandboxRejected(String),
}

/// Capability set implemented by every model backend.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn list_models(&self) -> Vec<ModelInfo>;

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, RunnerError>;

    async fn estimate(&self, request: &InferenceRequest) -> RunnerEstimate {
        let _ = request;
        RunnerEstimate::default()
    }

    async fn health(&self) -> RunnerHealth;

    /// Lazy streamed variant; backends without streaming keep the default.
    async fn infer_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<BoxStream<'static, Delta>, RunnerError> {
        let _ = request;
        Err(RunnerError::Unsupported("streaming"))
    }
}

/// Deterministic in-process runner.
pub struct MockRunner {
    models: Vec<ModelInfo>,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner {
            models: vec![ModelInfo {
                model_id: "mock".to_owned(),
                context_window: 8_192,
                max_tokens: 2_048,
            }],
        }
    }

    pub fn with_models(models: Vec<ModelInfo>) -> Self {
        MockRunner { models }
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn list_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, RunnerError> {
        let input_tokens = estimate_input_tokens(&request.prompt);
        let output_tokens = request.max_tokens.min(32).max(1);
        let output = format!(
            "[mock:{}] {}",
            request.model_id,
            request.prompt.chars().rev().collect::<String>()
        );
        Ok(InferenceResponse {
            request_id: request.request_id.clone(),
            model_id: request.model_id.clone(),
            output,
            usage: Usage {
                input_tokens,
                output_tokens,
            },
            latency_ms: 1,
        })
    }

    async fn estimate(&self, request: &InferenceRequest) -> RunnerEstimate {
        RunnerEstimate {
            cost_estimate: Some(0.0),
            latency_estimate_ms: Some(request.max_tokens / 8 + 1),
        }
    }

    async fn health(&self) -> RunnerHealth {
        RunnerHealth {
            ok: true,
            detail: None,
        }
    }

    async fn infer_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<BoxStream<'static, Delta>, RunnerError> {
        let full = self.infer(request).await?;
        let deltas: Vec<Delta> = full
            .output
            .split_inclusive(' ')
            .map(|word| Delta {
                delta: word.to_owned(),
            })
            .collect();
        Ok(Box::pin(futures_util::stream::iter(deltas)))
    }
}

/// Generic HTTP runner: forwards requests to any backend speaking the
/// marketplace wire shapes (`POST /infer`, `GET /models`, `GET /health`).
pub struct HttpRunner {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl HttpRunner {
    pub fn new(http: reqwest::Client, base: Url, timeout: Duration) -> Self {
        HttpRunner {
            http,
            base,
            timeout,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, RunnerError> {
        self.base
            .join(path)
            .map_err(|e| RunnerError::Failed(format!("bad runner url: {e}")))
    }
}

#[async_trait]
impl Runner for HttpRunner {
    async fn list_models(&self) -> Vec<ModelInfo> {
        let Ok(url) = self.endpoint("models") else {
            return Vec::new();
        };
        let result = async {
            self.http
                .get(url)
                .timeout(self.timeout)
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<ModelInfo>>()
                .await
        }
        .await;
        match result {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(error = %e, "runner model listing failed");
                Vec::new()
            }
        }
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, RunnerError> {
        let url = self.endpoint("infer")?;
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::Failed(format!("runner status {status}")));
        }
        response
            .json::<InferenceResponse>()
            .await
            .map_err(RunnerError::Transport)
    }

    async fn health(&self) -> RunnerHealth {
        let Ok(url) = self.endpoint("health") else {
            return RunnerHealth {
                ok: false,
                detail: Some("bad runner url".to_owned()),
            };
        };
        match self.http.get(url).timeout(self.timeout).send().await {
            Ok(response) if response.status().is_success() => RunnerHealth {
                ok: true,
                detail: None,
            },
            Ok(response) => RunnerHealth {
                ok: false,
                detail: Some(format!("status {}", response.status())),
            },
            Err(e) => RunnerHealth {
                ok: false,
                detail: Some(e.to_string()),
            },
        }
    }
}

/// Build the configured runner, enforcing the sandbox policy.
pub fn build_runner(
    config: &RunnerConfig,
    node: &NodeConfig,
    http: reqwest::Client,
) -> Result<std::sync::Arc<dyn Runner>, RunnerError> {
    if node.sandbox_mode == SandboxMode::Restricted {
        let allowed = node
            .sandbox_allowed_runners
            .iter()
            .any(|name| name == config.kind.as_str());
        if !allowed {
            return Err(RunnerError::SandboxRejected(format!(
                "runner kind {}",
                config.kind.as_str()
            )));
        }
    }
    match config.kind {
        RunnerKind::Mock => Ok(std::sync::Arc::new(MockRunner::new())),
        RunnerKind::HttpGeneric => {
            let url = config
                .url
                .as_ref()
                .ok_or(RunnerError::Failed("http runner requires a url".to_owned()))?
                .inner()
                .clone();
            if node.sandbox_mode == SandboxMode::Restricted {
                let host = url.host_str().unwrap_or_default().to_owned();
                let allowed = node
                    .sandbox_allowed_endpoints
                    .iter()
                    .any(|endpoint| *endpoint == host);
                if !allowed {
                    return Err(RunnerError::SandboxRejected(format!("endpoint {host}")));
                }
            }
            Ok(std::sync::Arc::new(HttpRunner::new(
                http,
                url,
                Duration::from_millis(config.timeout_ms),
            )))
        }
    }
}
