//! Local model runtimes and the single-model handle.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::ModelCandidate;
use crate::llm::{parse_retry_after, GenerationConfig, LlmError, LlmResponse, TokenUsage};

/// Something that can host one local model at a time.
#[async_trait]
pub trait LocalRuntime: Send + Sync {
    async fn load(&self, model: &ModelCandidate) -> Result<(), LlmError>;

    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<LlmResponse, LlmError>;

    /// Release the loaded model. Idempotent.
    async fn unload(&self);
}

/// Owns the runtime and the identity of its loaded model.
///
/// Every operation holds the same lock, so no generation can observe a
/// model mid-load or mid-unload.
pub struct ModelHandle {
    runtime: Box<dyn LocalRuntime>,
    loaded: Mutex<Option<ModelCandidate>>,
}

impl ModelHandle {
    pub fn new(runtime: Box<dyn LocalRuntime>) -> Self {
        Self {
            runtime,
            loaded: Mutex::new(None),
        }
    }

    pub async fn loaded(&self) -> Option<ModelCandidate> {
        self.loaded.lock().await.clone()
    }

    /// Generate with `model`, swapping it in first if another is loaded.
    pub async fn generate(
        &self,
        model: &ModelCandidate,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<LlmResponse, LlmError> {
        let mut loaded = self.loaded.lock().await;
        if loaded.as_ref().map(|m| &m.path) != Some(&model.path) {
            if let Some(previous) = loaded.take() {
                tracing::info!(model = %previous.name, "Unloading local model");
                self.runtime.unload().await;
            }
            tracing::info!(model = %model.name, size_gb = model.size_gb, "Loading local model");
            self.runtime.load(model).await?;
            *loaded = Some(model.clone());
        }
        self.runtime.generate(prompt, config).await
    }

    pub async fn unload(&self) {
        let mut loaded = self.loaded.lock().await;
        if let Some(previous) = loaded.take() {
            tracing::info!(model = %previous.name, "Unloading local model");
            self.runtime.unload().await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// llama.cpp server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlamaServerConfig {
    pub binary: String,
    pub host: String,
    pub port: u16,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for LlamaServerConfig {
    fn default() -> Self {
        Self {
            binary: "llama-server".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8089,
            startup_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Runs `llama-server -m <model> --port <port>` as a child process.
pub struct LlamaServerRuntime {
    client: Client,
    config: LlamaServerConfig,
    child: Mutex<Option<Child>>,
}

impl LlamaServerRuntime {
    pub fn new(config: LlamaServerConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            child: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.config.host, self.config.port, path)
    }

    async fn wait_healthy(&self, child: &mut Child) -> Result<(), LlmError> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(LlmError::unavailable(format!(
                    "{} exited during startup: {}",
                    self.config.binary, status
                )));
            }
            if let Ok(resp) = self.client.get(self.url("/health")).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(LlmError::timeout(format!(
                    "{} not healthy after {}s",
                    self.config.binary,
                    self.config.startup_timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "no_stops")]
    stop: &'a [String],
}

fn no_stops(stops: &&[String]) -> bool {
    stops.is_empty()
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tokens_evaluated: Option<u64>,
    #[serde(default)]
    tokens_predicted: Option<u64>,
    #[serde(default)]
    stop_type: Option<String>,
}

#[async_trait]
impl LocalRuntime for LlamaServerRuntime {
    async fn load(&self, model: &ModelCandidate) -> Result<(), LlmError> {
        let mut guard = self.child.lock().await;
        if let Some(mut old) = guard.take() {
            let _ = old.kill().await;
        }

        let mut child = Command::new(&self.config.binary)
            .arg("-m")
            .arg(&model.path)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LlmError::unavailable(format!("Failed to start {}: {}", self.config.binary, e))
            })?;

        if let Err(e) = self.wait_healthy(&mut child).await {
            let _ = child.kill().await;
            return Err(e);
        }
        *guard = Some(child);
        Ok(())
    }

    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<LlmResponse, LlmError> {
        let request = CompletionRequest {
            prompt,
            n_predict: config.max_tokens,
            temperature: config.temperature,
            stop: &config.stop_sequences,
        };

        let start = Instant::now();
        let response = self
            .client
            .post(self.url("/completion"))
            .json(&request)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers().get("retry-after"));
        let body = response.text().await.map_err(LlmError::from_reqwest)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), body, retry_after));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse completion response: {}", e))
        })?;

        let usage = match (parsed.tokens_evaluated, parsed.tokens_predicted) {
            (None, None) => None,
            (p, c) => Some(TokenUsage::new(p.unwrap_or(0), c.unwrap_or(0))),
        };
        Ok(LlmResponse {
            text: parsed.content,
            model: parsed.model.unwrap_or_else(|| "llama-server".to_string()),
            usage,
            finish_reason: parsed.stop_type,
            generation_time: start.elapsed(),
        })
    }

    async fn unload(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to stop {}: {}", self.config.binary, e);
            }
        }
    }
}
