//! AI adapter: provider abstraction over a JSON-constrained chat completion.
//!
//! Every pipeline talks to an `Arc<dyn LlmClient>`. Production uses the OpenAI
//! Chat Completions API; tests and local runs swap in the mock, failing or
//! scripted clients.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AiConfig;

// ------------------------------------------------------------
// Public surface
// ------------------------------------------------------------

/// What a request is for. Used for metrics labels and by the mock client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmTask {
    Pricing,
    ViralStrategy,
    ViralContent,
    Optimization,
    ImplementationPlan,
    AbTest,
    SelfCheck,
}

impl LlmTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmTask::Pricing => "pricing",
            LlmTask::ViralStrategy => "viral_strategy",
            LlmTask::ViralContent => "viral_content",
            LlmTask::Optimization => "optimization",
            LlmTask::ImplementationPlan => "implementation_plan",
            LlmTask::AbTest => "ab_test",
            LlmTask::SelfCheck => "self_check",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub task: LlmTask,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

impl LlmRequest {
    pub fn new(task: LlmTask, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task,
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 800,
        }
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("AI is disabled")]
    Disabled,
    #[error("missing API key")]
    MissingApiKey,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("empty completion")]
    EmptyReply,
    #[error("malformed JSON reply: {0}")]
    MalformedJson(String),
    #[error("reply does not match expected shape: {0}")]
    Schema(String),
}

pub type LlmFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, LlmError>> + Send + 'a>>;

/// Trait object used by the pipelines and handlers.
pub trait LlmClient: Send + Sync {
    /// Send the request and return the parsed JSON object from the reply.
    fn complete_json<'a>(&'a self, req: &'a LlmRequest) -> LlmFuture<'a>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

pub type DynLlmClient = Arc<dyn LlmClient>;

/// Call the client and deserialize into `T`, recording the outcome.
pub async fn request_typed<T: DeserializeOwned>(
    client: &dyn LlmClient,
    req: &LlmRequest,
) -> Result<T, LlmError> {
    let result = client
        .complete_json(req)
        .await
        .and_then(|v| serde_json::from_value::<T>(v).map_err(|e| LlmError::Schema(e.to_string())));

    let outcome = if result.is_ok() { "ok" } else { "error" };
    counter!("llm_requests_total", "task" => req.task.as_str(), "outcome" => outcome).increment(1);
    if let Err(e) = &result {
        debug!(
            target: "ai",
            task = req.task.as_str(),
            provider = client.provider_name(),
            error = %e,
            "llm request failed"
        );
    }
    result
}

/// Log and count a fallback substitution.
pub fn record_fallback(task: LlmTask, err: &LlmError) {
    counter!("llm_fallbacks_total", "task" => task.as_str()).increment(1);
    warn!(target: "ai", task = task.as_str(), error = %err, "using fallback response");
}

/// Factory: build a client according to config.
///
/// * `test_mode = "mock"` → deterministic canned replies.
/// * `test_mode = "error"` → every call fails (exercises fallbacks).
/// * `enabled == false` → disabled client.
/// * otherwise the OpenAI provider.
pub fn build_llm_client(cfg: &AiConfig) -> anyhow::Result<DynLlmClient> {
    match cfg.test_mode.as_deref() {
        Some("mock") => return Ok(Arc::new(MockClient)),
        Some("error") => return Ok(Arc::new(FailingClient)),
        Some(other) => warn!(target: "ai", mode = other, "unknown AI_TEST_MODE ignored"),
        None => {}
    }

    if !cfg.enabled {
        info!(target: "ai", "AI disabled in config; all pipelines use fallbacks");
        return Ok(Arc::new(DisabledClient));
    }

    match cfg.provider.as_str() {
        "openai" => {
            if cfg.usable_api_key().is_none() {
                warn!(target: "ai", "OPENAI_API_KEY not set; AI responses will fall back");
            }
            Ok(Arc::new(OpenAiProvider::new(cfg)?))
        }
        other => {
            warn!(target: "ai", provider = other, "unsupported AI provider; disabling AI");
            Ok(Arc::new(DisabledClient))
        }
    }
}

/// One-off smoke test of the configured client. Never fails; logs the result.
pub async fn quick_self_check(client: &dyn LlmClient) {
    let req = LlmRequest::new(
        LlmTask::SelfCheck,
        "You are a health check. Respond with JSON only.",
        r#"Return {"status":"ok"}."#,
    )
    .max_tokens(20);
    match client.complete_json(&req).await {
        Ok(v) => info!(
            target: "ai",
            provider = client.provider_name(),
            reply = %v,
            "AI self-check ok"
        ),
        Err(e) => warn!(
            target: "ai",
            provider = client.provider_name(),
            error = %e,
            "AI self-check failed"
        ),
    }
}

// ------------------------------------------------------------
// OpenAI provider
// ------------------------------------------------------------

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI provider (Chat Completions with `response_format = json_object`).
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(cfg: &AiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("growth-engine/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_key: cfg.usable_api_key().unwrap_or_default().to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
        })
    }

    async fn fetch(&self, req: &LlmRequest) -> Result<Value, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct ResponseFormat {
            r#type: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
            response_format: ResponseFormat,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            #[serde(default)]
            content: Option<String>,
        }

        let body = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &req.system,
                },
                Msg {
                    role: "user",
                    content: &req.prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: req.max_tokens,
            response_format: ResponseFormat {
                r#type: "json_object",
            },
        };

        let resp = self
            .http
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LlmError::Status(status.as_u16()));
        }
        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        parse_json_reply(&content)
    }
}

impl LlmClient for OpenAiProvider {
    fn complete_json<'a>(&'a self, req: &'a LlmRequest) -> LlmFuture<'a> {
        Box::pin(self.fetch(req))
    }
    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

// ------------------------------------------------------------
// Non-network clients
// ------------------------------------------------------------

/// Fails every call with `Disabled`; used when AI is off.
pub struct DisabledClient;

impl LlmClient for DisabledClient {
    fn complete_json<'a>(&'a self, _req: &'a LlmRequest) -> LlmFuture<'a> {
        Box::pin(async { Err(LlmError::Disabled) })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Simulates a provider outage.
pub struct FailingClient;

impl LlmClient for FailingClient {
    fn complete_json<'a>(&'a self, _req: &'a LlmRequest) -> LlmFuture<'a> {
        Box::pin(async { Err(LlmError::Transport("simulated provider error".into())) })
    }
    fn provider_name(&self) -> &'static str {
        "error"
    }
}

/// Deterministic canned replies per task, for local runs without a key.
pub struct MockClient;

impl MockClient {
    pub fn reply_for(task: LlmTask) -> Value {
        match task {
            LlmTask::Pricing => json!({
                "multiplier": 1.15,
                "confidence": 0.8,
                "expectedConversion": 0.12,
                "reasoning": "Mock: steady demand supports a modest premium."
            }),
            LlmTask::ViralStrategy => json!({
                "trendingTopics": ["AI agents", "creator economy"],
                "hooks": ["Nobody is talking about this yet", "Here is what changed this week"],
                "hashtagIdeas": ["#AI", "#BuildInPublic"],
                "bestPostingTime": "18:00 local"
            }),
            LlmTask::ViralContent => json!({
                "content": "Mock: here is what changed this week and why it matters.",
                "hashtags": ["#AI", "#BuildInPublic", "#Growth"],
                "viralScore": 82
            }),
            LlmTask::Optimization => json!({
                "recommendations": [
                    mock_rec("Performance", "High", "Lazy-load dashboard panels", 0.9, 15),
                    mock_rec("Conversion", "Critical", "Simplify checkout", 0.95, 30),
                    mock_rec("UX", "Medium", "Clarify pricing copy", 0.7, 8),
                    mock_rec("Engagement", "Low", "Add streak reminders", 0.85, 5),
                    mock_rec("Content", "Medium", "Refresh onboarding tips", 0.6, 4)
                ]
            }),
            LlmTask::ImplementationPlan => json!({
                "steps": [
                    "Instrument the affected flow",
                    "Ship the change behind a flag",
                    "Roll out to 10% of traffic",
                    "Review metrics and expand"
                ]
            }),
            LlmTask::AbTest => json!({
                "hypothesis": "The change improves the primary metric",
                "variants": ["control", "treatment"],
                "primaryMetric": "conversion_rate",
                "sampleSize": 5000,
                "durationDays": 14
            }),
            LlmTask::SelfCheck => json!({ "status": "ok" }),
        }
    }
}

fn mock_rec(category: &str, priority: &str, title: &str, confidence: f64, roi: u32) -> Value {
    json!({
        "category": category,
        "priority": priority,
        "title": title,
        "description": format!("Mock: {title}."),
        "implementation": "Mock implementation notes.",
        "expectedImpact": format!("+{roi}% on the primary metric"),
        "confidence": confidence,
        "timeToImplement": "1 week",
        "potentialRoi": format!("{roi}%"),
        "potentialRoiPct": roi
    })
}

impl LlmClient for MockClient {
    fn complete_json<'a>(&'a self, req: &'a LlmRequest) -> LlmFuture<'a> {
        let out = Self::reply_for(req.task);
        Box::pin(async move { Ok(out) })
    }
    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

type Responder = dyn Fn(&LlmRequest) -> Result<Value, LlmError> + Send + Sync;

/// Test double driven by a closure; records every request it sees.
pub struct ScriptedClient {
    responder: Box<Responder>,
    seen: Mutex<Vec<LlmRequest>>,
}

impl ScriptedClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<Value, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_for(&self, task: LlmTask) -> usize {
        self.requests().iter().filter(|r| r.task == task).count()
    }
}

impl LlmClient for ScriptedClient {
    fn complete_json<'a>(&'a self, req: &'a LlmRequest) -> LlmFuture<'a> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req.clone());
        let out = (self.responder)(req);
        Box::pin(async move { out })
    }
    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

// ------------------------------------------------------------
// Reply parsing
// ------------------------------------------------------------

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("fence regex"));

/// Parse model output into a JSON object or array. Tolerates code fences and
/// prose around a single top-level object.
pub fn parse_json_reply(content: &str) -> Result<Value, LlmError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(LlmError::EmptyReply);
    }
    let body = CODE_FENCE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    let value = match serde_json::from_str::<Value>(body) {
        Ok(v) => v,
        Err(first) => {
            let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
                return Err(LlmError::MalformedJson(first.to_string()));
            };
            if end <= start {
                return Err(LlmError::MalformedJson(first.to_string()));
            }
            serde_json::from_str::<Value>(&body[start..=end])
                .map_err(|e| LlmError::MalformedJson(e.to_string()))?
        }
    };

    if value.is_object() || value.is_array() {
        Ok(value)
    } else {
        Err(LlmError::MalformedJson("expected a JSON object".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_fenced_and_wrapped_json() {
        assert_eq!(parse_json_reply(r#"{"a":1}"#).unwrap()["a"], 1);
        assert_eq!(
            parse_json_reply("```json\n{\"a\": 2}\n```").unwrap()["a"],
            2
        );
        assert_eq!(
            parse_json_reply("Sure! Here you go: {\"a\": 3} Hope it helps.").unwrap()["a"],
            3
        );
    }

    #[test]
    fn rejects_empty_scalar_and_garbage() {
        assert_eq!(parse_json_reply("   "), Err(LlmError::EmptyReply));
        assert!(matches!(
            parse_json_reply("42"),
            Err(LlmError::MalformedJson(_))
        ));
        assert!(matches!(
            parse_json_reply("no json here"),
            Err(LlmError::MalformedJson(_))
        ));
    }

    #[tokio::test]
    async fn disabled_and_failing_clients_error() {
        let req = LlmRequest::new(LlmTask::SelfCheck, "s", "p");
        assert_eq!(
            DisabledClient.complete_json(&req).await,
            Err(LlmError::Disabled)
        );
        assert!(matches!(
            FailingClient.complete_json(&req).await,
            Err(LlmError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn request_typed_maps_shape_errors() {
        #[derive(Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            value: u32,
        }
        let client = ScriptedClient::new(|_| Ok(json!({ "other": true })));
        let req = LlmRequest::new(LlmTask::SelfCheck, "s", "p");
        let out = request_typed::<Needs>(&client, &req).await;
        assert!(matches!(out, Err(LlmError::Schema(_))));
        assert_eq!(client.calls_for(LlmTask::SelfCheck), 1);
    }

    #[test]
    fn factory_honours_test_mode_and_enabled_flag() {
        let mut cfg = AiConfig {
            test_mode: Some("mock".into()),
            ..AiConfig::default()
        };
        assert_eq!(build_llm_client(&cfg).unwrap().provider_name(), "mock");
        cfg.test_mode = Some("error".into());
        assert_eq!(build_llm_client(&cfg).unwrap().provider_name(), "error");
        cfg.test_mode = None;
        cfg.enabled = false;
        assert_eq!(build_llm_client(&cfg).unwrap().provider_name(), "disabled");
        cfg.enabled = true;
        cfg.provider = "claude".into();
        assert_eq!(build_llm_client(&cfg).unwrap().provider_name(), "disabled");
    }

    #[tokio::test]
    async fn unresolved_env_sentinel_is_not_sent_as_a_key() {
        let cfg = AiConfig::default();
        assert_eq!(cfg.api_key, "ENV");
        assert_eq!(cfg.usable_api_key(), None);

        let provider = OpenAiProvider::new(&cfg).unwrap();
        let req = LlmRequest::new(LlmTask::SelfCheck, "s", "p");
        assert_eq!(provider.complete_json(&req).await, Err(LlmError::MissingApiKey));
    }
}
