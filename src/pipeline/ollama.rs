//! Vision-model adapters: Ollama over HTTP, and a scripted mock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::error::ModelError;
use super::render::PageContent;
use super::traits::{ModelRequest, VisionModel};
use super::types::AgentId;

/// Ollama HTTP client for vision-capable chat models.
pub struct OllamaVisionModel {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl OllamaVisionModel {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ModelError::Http(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }

    /// Whether the configured model is pulled on the Ollama instance.
    pub async fn is_model_available(&self) -> Result<bool, ModelError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        Ok(parsed.models.iter().any(|m| m.name.starts_with(&self.model)))
    }

    fn map_send_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_connect() {
            ModelError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            ModelError::Timeout(self.timeout_secs)
        } else {
            ModelError::Http(e.to_string())
        }
    }
}

/// Request body for Ollama /api/chat
#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    format: &'a Value,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Response body from Ollama /api/chat
#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

/// Response body from Ollama /api/tags
#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

#[async_trait]
impl VisionModel for OllamaVisionModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn call(&self, request: &ModelRequest<'_>) -> Result<String, ModelError> {
        let images: Vec<String> = request
            .pages
            .iter()
            .filter_map(|p| match &p.content {
                PageContent::Png(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                PageContent::Text(_) => None,
            })
            .collect();

        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest {
            model: &self.model,
            messages: vec![OllamaMessage {
                role: "user",
                content: request.prompt,
                images,
            }],
            format: request.schema,
            stream: false,
            options: OllamaOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ModelError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        debug!(
            agent_id = %request.agent_id,
            model = %self.model,
            response_len = parsed.message.content.len(),
            "Model call completed"
        );
        Ok(parsed.message.content)
    }
}

// ── Mock for testing ──────────────────────────────────────

/// One scripted reply of the mock model.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(ModelError),
    /// Never completes; exercises timeouts and cancellation.
    Hang,
}

/// Mock vision model with per-agent scripts and call accounting.
///
/// Scripted replies are consumed first. Afterwards an agent answers with its
/// default data (empty when none is set) and cites every page it was sent.
pub struct MockVisionModel {
    scripts: Mutex<HashMap<AgentId, VecDeque<MockReply>>>,
    defaults: HashMap<AgentId, Map<String, Value>>,
    prompts: Mutex<Vec<(AgentId, String)>>,
    calls: Mutex<HashMap<AgentId, u32>>,
    total_calls: AtomicU32,
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MockVisionModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVisionModel {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            defaults: HashMap::new(),
            prompts: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            total_calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Data an agent answers with once its script is exhausted.
    pub fn with_data(mut self, agent_id: &str, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.defaults.insert(AgentId::new(agent_id), map);
        }
        self
    }

    /// Queue a scripted reply for an agent.
    pub fn with_reply(self, agent_id: &str, reply: MockReply) -> Self {
        lock(&self.scripts)
            .entry(AgentId::new(agent_id))
            .or_default()
            .push_back(reply);
        self
    }

    /// Simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls_for(&self, agent_id: &str) -> u32 {
        lock(&self.calls).get(&AgentId::new(agent_id)).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Prompts received by an agent, in call order.
    pub fn prompts_for(&self, agent_id: &str) -> Vec<String> {
        lock(&self.prompts)
            .iter()
            .filter(|(id, _)| id.as_str() == agent_id)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VisionModel for MockVisionModel {
    fn name(&self) -> &str {
        "mock-vision"
    }

    async fn call(&self, request: &ModelRequest<'_>) -> Result<String, ModelError> {
        let agent_id = request.agent_id.clone();
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.calls).entry(agent_id.clone()).or_insert(0) += 1;
        lock(&self.prompts).push((agent_id.clone(), request.prompt.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = lock(&self.scripts).get_mut(&agent_id).and_then(VecDeque::pop_front);
        match scripted {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(e)) => Err(e),
            Some(MockReply::Hang) => {
                std::future::pending::<()>().await;
                Err(ModelError::Timeout(0))
            }
            None => {
                let data = self.defaults.get(&agent_id).cloned().unwrap_or_default();
                let pages: Vec<u32> = request.pages.iter().map(|p| p.page_number).collect();
                Ok(json!({ "data": data, "evidence_pages": pages }).to_string())
            }
        }
    }
}
