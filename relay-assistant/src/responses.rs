use crate::error::{AssistantError, Result};
use crate::traits::{AssistantBackend, AssistantThread};
use crate::types::{AssistantTurn, ReasoningEffort, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct ResponsesConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub instructions: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Backend for an OpenAI-compatible `/responses` endpoint.
///
/// The server keeps conversation state; a thread is just the id of its most
/// recent response, chained through `previous_response_id`.
#[derive(Clone)]
pub struct ResponsesBackend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    http: reqwest::Client,
    cfg: ResponsesConfig,
}

impl ResponsesBackend {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(cfg: ResponsesConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            return Err(AssistantError::InvalidInput("api key is required".to_string()));
        }
        if cfg.model.trim().is_empty() {
            return Err(AssistantError::InvalidInput("model is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            inner: Arc::new(BackendInner { http, cfg }),
        })
    }

    pub fn model(&self) -> &str {
        &self.inner.cfg.model
    }

    fn thread(&self, last_response_id: Option<String>) -> Arc<dyn AssistantThread> {
        Arc::new(ResponsesThread {
            backend: self.inner.clone(),
            last_response_id: RwLock::new(last_response_id),
        })
    }
}

impl AssistantBackend for ResponsesBackend {
    fn start_thread(&self) -> Arc<dyn AssistantThread> {
        self.thread(None)
    }

    fn resume_thread(&self, thread_id: &str) -> Result<Arc<dyn AssistantThread>> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() {
            return Err(AssistantError::InvalidInput(
                "thread id must not be empty".to_string(),
            ));
        }
        Ok(self.thread(Some(thread_id.to_string())))
    }
}

struct ResponsesThread {
    backend: Arc<BackendInner>,
    last_response_id: RwLock<Option<String>>,
}

#[async_trait]
impl AssistantThread for ResponsesThread {
    fn id(&self) -> Option<String> {
        self.last_response_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.backend.cfg.model))]
    async fn run(&self, input: &str, cancel: CancellationToken) -> Result<AssistantTurn> {
        if input.trim().is_empty() {
            return Err(AssistantError::InvalidInput("input is empty".to_string()));
        }
        let previous_response_id = self.id();
        let req = ResponsesRequest::new(&self.backend.cfg, input, previous_response_id.as_deref());

        let parsed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AssistantError::Cancelled),
            parsed = self.backend.create_response(&req) => parsed?,
        };
        if cancel.is_cancelled() {
            return Err(AssistantError::Cancelled);
        }

        let response_id = parsed.id.clone();
        let turn = parsed.into_turn()?;
        *self
            .last_response_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(response_id);
        Ok(turn)
    }
}

impl BackendInner {
    async fn create_response(&self, req: &ResponsesRequest<'_>) -> Result<ResponsesResponse> {
        let url = format!("{}/responses", self.cfg.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AssistantError::Http(format!(
                "responses status={status} body={body}"
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: &'a str,
    store: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningParam>,
}

#[derive(Debug, Serialize)]
struct ReasoningParam {
    effort: ReasoningEffort,
}

impl<'a> ResponsesRequest<'a> {
    fn new(cfg: &'a ResponsesConfig, input: &'a str, previous_response_id: Option<&'a str>) -> Self {
        Self {
            model: &cfg.model,
            input,
            store: true,
            previous_response_id,
            instructions: cfg.instructions.as_deref().filter(|s| !s.trim().is_empty()),
            reasoning: cfg.reasoning_effort.map(|effort| ReasoningParam { effort }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<ResponsesErrorBody>,
    #[serde(default)]
    output: Vec<ResponsesOutputItem>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponsesErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutputItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    content: Vec<ResponsesContentPart>,
}

#[derive(Debug, Deserialize)]
struct ResponsesContentPart {
    #[serde(rename = "type")]
    part_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl ResponsesResponse {
    fn into_turn(self) -> Result<AssistantTurn> {
        if let Some(error) = self.error {
            return Err(AssistantError::ResponseFormat(format!(
                "response {} failed: {}",
                self.id, error.message
            )));
        }
        if self.status.as_deref() == Some("failed") {
            return Err(AssistantError::ResponseFormat(format!(
                "response {} failed without detail",
                self.id
            )));
        }

        let final_response = self
            .output
            .iter()
            .filter(|item| item.item_type == "message")
            .flat_map(|item| item.content.iter())
            .filter(|part| part.part_type == "output_text")
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(AssistantTurn {
            final_response,
            usage: self.usage.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ResponsesConfig {
        ResponsesConfig {
            api_key: "sk-test".to_string(),
            model: "gpt-5-codex".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            instructions: Some("Be brief.".to_string()),
            reasoning_effort: Some(ReasoningEffort::Medium),
        }
    }

    #[test]
    fn request_chains_previous_response() {
        let cfg = config();
        let req = ResponsesRequest::new(&cfg, "hello", Some("resp_1"));
        assert_eq!(
            serde_json::to_value(&req).expect("serialize"),
            json!({
                "model": "gpt-5-codex",
                "input": "hello",
                "store": true,
                "previous_response_id": "resp_1",
                "instructions": "Be brief.",
                "reasoning": { "effort": "medium" }
            })
        );
    }

    #[test]
    fn first_request_omits_optional_fields() {
        let cfg = ResponsesConfig {
            instructions: Some("  ".to_string()),
            reasoning_effort: None,
            ..config()
        };
        let value = serde_json::to_value(ResponsesRequest::new(&cfg, "hi", None)).expect("serialize");
        assert!(value.get("previous_response_id").is_none());
        assert!(value.get("instructions").is_none());
        assert!(value.get("reasoning").is_none());
    }

    #[test]
    fn output_text_parts_are_joined() {
        let parsed: ResponsesResponse = serde_json::from_value(json!({
            "id": "resp_2",
            "status": "completed",
            "output": [
                { "type": "reasoning", "content": [] },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "first" },
                    { "type": "refusal", "refusal": "no" },
                    { "type": "output_text", "text": "second" }
                ]}
            ],
            "usage": { "input_tokens": 12, "output_tokens": 3 }
        }))
        .expect("response json");
        let turn = parsed.into_turn().expect("turn");
        assert_eq!(turn.final_response, "first\nsecond");
        assert_eq!(turn.usage.input_tokens, 12);
        assert_eq!(turn.usage.output_tokens, 3);
    }

    #[test]
    fn failed_response_is_an_error() {
        let parsed: ResponsesResponse = serde_json::from_value(json!({
            "id": "resp_3",
            "status": "failed",
            "error": { "code": "server_error", "message": "upstream broke" }
        }))
        .expect("response json");
        let err = parsed.into_turn().expect_err("failed response");
        assert!(err.to_string().contains("upstream broke"));
    }

    #[test]
    fn resume_keeps_thread_id() {
        let backend = ResponsesBackend::new(config()).expect("backend");
        assert_eq!(backend.start_thread().id(), None);
        let resumed = backend.resume_thread(" resp_9 ").expect("resume");
        assert_eq!(resumed.id().as_deref(), Some("resp_9"));
        assert!(backend.resume_thread("").is_err());
    }

    #[test]
    fn backend_requires_key_and_model() {
        let missing_key = ResponsesConfig {
            api_key: String::new(),
            ..config()
        };
        assert!(matches!(
            ResponsesBackend::new(missing_key),
            Err(AssistantError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_run_returns_without_request() {
        let backend = ResponsesBackend::new(ResponsesConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..config()
        })
        .expect("backend");
        let thread = backend.start_thread();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = thread.run("hello", cancel).await.expect_err("cancelled");
        assert!(matches!(err, AssistantError::Cancelled));
        assert_eq!(thread.id(), None);
    }
}
