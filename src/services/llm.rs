use crate::core::config::Config;
use crate::core::error::LlmError;
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    10
}

/// One call to the generative backend.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub user: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Ask the provider to constrain its output to JSON.
    pub json_mode: bool,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_output_tokens: 2048,
            temperature: 0.7,
            timeout: Duration::from_secs(60),
            json_mode: false,
        }
    }

    pub fn max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;
}

/// Runs one attempt of `request` against `llm`, bounded by `request.timeout`
/// even when the client itself ignores it.
pub async fn generate_with_timeout(
    llm: &dyn LlmClient,
    request: &GenerationRequest,
) -> Result<String, LlmError> {
    match tokio::time::timeout(request.timeout, llm.generate(request)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(request.timeout)),
    }
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>, LlmError> {
    let llm = &config.llm;
    let inner: Box<dyn LlmClient> = match llm.provider.as_str() {
        "gemini" => {
            let cfg = llm
                .gemini
                .as_ref()
                .ok_or_else(|| LlmError::Config("Gemini config missing".to_string()))?;
            Box::new(GeminiClient::new(&cfg.api_key, &cfg.model))
        }
        "ollama" => {
            let cfg = llm
                .ollama
                .as_ref()
                .ok_or_else(|| LlmError::Config("Ollama config missing".to_string()))?;
            Box::new(OllamaClient::new(&cfg.base_url, &cfg.model))
        }
        "openai" => {
            let cfg = llm
                .openai
                .as_ref()
                .ok_or_else(|| LlmError::Config("OpenAI config missing".to_string()))?;
            Box::new(OpenAIClient::new(
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
            ))
        }
        other => {
            return Err(LlmError::Config(format!("Unknown LLM provider: {}", other)));
        }
    };

    Ok(Box::new(RetryingClient::new(
        inner,
        llm.retry_count,
        Duration::from_secs(llm.retry_delay_seconds),
    )))
}

fn send_error(e: reqwest::Error, timeout: Duration) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout)
    } else {
        LlmError::Transport(e.to_string())
    }
}

async fn check_status(resp: reqwest::Response, timeout: Duration) -> Result<String, LlmError> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| send_error(e, timeout))?;
    if !status.is_success() {
        return Err(LlmError::Backend {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

// --- Retry ---

/// Retries transient failures of the wrapped client. `request.timeout` bounds
/// each attempt, so a timed-out attempt can still be retried.
#[derive(Debug)]
pub struct RetryingClient {
    inner: Box<dyn LlmClient>,
    retry_count: usize,
    retry_delay: Duration,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn LlmClient>, retry_count: usize, retry_delay: Duration) -> Self {
        Self {
            inner,
            retry_count,
            retry_delay,
        }
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match generate_with_timeout(self.inner.as_ref(), request).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < self.retry_count => {
                    attempt += 1;
                    warn!(
                        "LLM call failed ({}), retrying {}/{} in {:?}",
                        e, attempt, self.retry_count, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

fn parse_gemini_response(body: &str) -> Result<String, LlmError> {
    let result: GeminiResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::MalformedResponse(format!(
            "Failed to parse Gemini response: {}. Body: {}",
            e, body
        ))
    })?;

    if let Some(err) = result.error {
        return Err(LlmError::MalformedResponse(format!(
            "Gemini API returned error: {}",
            err.message
        )));
    }

    let first = result
        .candidates
        .as_ref()
        .and_then(|c| c.first())
        .ok_or_else(|| LlmError::MalformedResponse("Gemini response has no candidates".to_string()))?;

    if let Some(part) = first.content.as_ref().and_then(|c| c.parts.first()) {
        return Ok(part.text.clone());
    }

    let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
    Err(LlmError::MalformedResponse(format!(
        "Gemini response empty. Finish reason: {}",
        reason
    )))
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: request.user.clone(),
                }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: request.system.clone(),
                }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
                response_mime_type: request
                    .json_mode
                    .then(|| "application/json".to_string()),
            },
        };

        let resp = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| send_error(e, request.timeout))?;

        let body = check_status(resp, request.timeout).await?;
        parse_gemini_response(&body)
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            stream: false,
            format: request.json_mode.then(|| "json".to_string()),
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_output_tokens,
            },
        };

        let resp = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| send_error(e, request.timeout))?;

        let body = check_status(resp, request.timeout).await?;
        let result: OllamaResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::MalformedResponse(format!("Failed to parse Ollama response: {}", e))
        })?;
        Ok(result.message.content)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAIResponseFormat>,
}

#[derive(Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

fn parse_openai_response(body: &str) -> Result<String, LlmError> {
    let result: OpenAIResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::MalformedResponse(format!("Failed to parse OpenAI response: {}", e))
    })?;
    result
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .ok_or_else(|| {
            LlmError::MalformedResponse("OpenAI response empty or missing content".to_string())
        })
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            response_format: request.json_mode.then(|| OpenAIResponseFormat {
                kind: "json_object".to_string(),
            }),
        };

        let resp = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| send_error(e, request.timeout))?;

        let body = check_status(resp, request.timeout).await?;
        parse_openai_response(&body)
    }
}
