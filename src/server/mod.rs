use crate::core::{InferenceEngine, SamplingParams, TokenUsage};
use crate::server::streaming::Streamer;
use crate::tools::{FunctionCall, Tool, ToolCall, ToolChoice, ToolChoiceMode};
use crate::utils::config::ServerConfig;
use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::sse::KeepAliveStream;
use axum::response::{IntoResponse, Sse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub mod aggregator;
pub mod logger;
pub mod server;
pub mod streaming;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    /// Kept as raw JSON so tool results and assistant tool calls pass through intact
    pub messages: Vec<Value>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<isize>,
    pub max_tokens: Option<usize>,
    pub repeat_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatCompletionRequest {
    /// Sampling parameters with unset fields taken from the server defaults and
    /// `max_tokens` capped at the configured maximum.
    pub fn sampling_params(&self, config: &ServerConfig) -> SamplingParams {
        let defaults = &config.sampling;
        SamplingParams {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            max_tokens: self
                .max_tokens
                .unwrap_or(defaults.max_tokens)
                .min(config.max_tokens),
            repeat_penalty: self.repeat_penalty.unwrap_or(defaults.repeat_penalty),
            presence_penalty: self.presence_penalty.unwrap_or(defaults.presence_penalty),
            frequency_penalty: self.frequency_penalty.unwrap_or(defaults.frequency_penalty),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        fn in_range(name: &str, value: Option<f32>, lo: f32, hi: f32) -> Result<(), String> {
            match value {
                Some(v) if !(lo..=hi).contains(&v) => {
                    Err(format!("{name} must be between {lo} and {hi}, got {v}"))
                }
                _ => Ok(()),
            }
        }
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_string());
        }
        in_range("temperature", self.temperature, 0.0, 2.0)?;
        in_range("top_p", self.top_p, 0.0, 1.0)?;
        in_range("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        in_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        in_range("repeat_penalty", self.repeat_penalty, 0.0, f32::MAX)?;
        if matches!(self.top_k, Some(k) if k < 0) {
            return Err("top_k must be non-negative".to_string());
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be at least 1".to_string());
        }
        Ok(())
    }

    /// Whether tool call extraction applies to this request.
    pub fn tool_calls_allowed(&self) -> bool {
        !matches!(self.tool_choice, Some(ToolChoice::Mode(ToolChoiceMode::None)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl From<TokenUsage> for Usage {
    fn from(u: TokenUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.prompt_tokens + u.completion_tokens,
        }
    }
}

/// Identity shared by every chunk of one streamed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkIdentity {
    pub id: String,
    pub model: String,
    pub created: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoiceChunk>,
}

impl ChatCompletionChunk {
    fn with_delta(identity: &ChunkIdentity, delta: Delta, finish_reason: Option<String>) -> Self {
        Self {
            id: identity.id.clone(),
            object: "chat.completion.chunk",
            created: identity.created,
            model: identity.model.clone(),
            choices: vec![ChatChoiceChunk {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    pub fn text(identity: &ChunkIdentity, content: impl Into<String>) -> Self {
        let delta = Delta {
            content: Some(content.into()),
            tool_calls: None,
        };
        Self::with_delta(identity, delta, None)
    }

    pub fn tool_call(identity: &ChunkIdentity, index: usize, call: &ToolCall) -> Self {
        let delta = Delta {
            content: None,
            tool_calls: Some(vec![ToolCallDelta {
                index,
                id: call.id.clone(),
                tool_type: call.tool_type.clone(),
                function: call.function.clone(),
            }]),
        };
        Self::with_delta(identity, delta, None)
    }

    pub fn finish(identity: &ChunkIdentity, reason: impl Into<String>) -> Self {
        Self::with_delta(identity, Delta::default(), Some(reason.into()))
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first()?.finish_reason.as_deref()
    }

    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }

    pub fn tool_calls(&self) -> &[ToolCallDelta] {
        self.choices
            .first()
            .and_then(|c| c.delta.tool_calls.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChoiceChunk {
    pub index: usize,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionCall,
}

/// `{ "error": { "message", "type" } }`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                error_type: error_type.into(),
            },
        }
    }

    fn to_response(&self, code: StatusCode) -> axum::response::Response {
        let mut r = Json(self).into_response();
        *r.status_mut() = code;
        r
    }
}

pub struct ServerData {
    pub engine: Arc<dyn InferenceEngine>,
    pub config: ServerConfig,
}

pub enum ChatResponder {
    Streamer(Sse<KeepAliveStream<Streamer>>),
    Completion(ChatCompletionResponse),
    Json(Value),
    ModelError(String),
    ValidationError(String),
    BadRequest(String),
    Unavailable(String),
}

impl IntoResponse for ChatResponder {
    fn into_response(self) -> axum::response::Response {
        match self {
            ChatResponder::Streamer(s) => s.into_response(),
            ChatResponder::Completion(s) => Json(s).into_response(),
            ChatResponder::Json(v) => Json(v).into_response(),
            ChatResponder::ModelError(e) => ErrorFrame::new(e, "server_error")
                .to_response(StatusCode::INTERNAL_SERVER_ERROR),
            ChatResponder::ValidationError(e) => ErrorFrame::new(e, "invalid_request_error")
                .to_response(StatusCode::UNPROCESSABLE_ENTITY),
            ChatResponder::BadRequest(e) => {
                ErrorFrame::new(e, "invalid_request_error").to_response(StatusCode::BAD_REQUEST)
            }
            ChatResponder::Unavailable(e) => ErrorFrame::new(e, "service_unavailable")
                .to_response(StatusCode::SERVICE_UNAVAILABLE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::new_tool_call;
    use serde_json::json;

    fn identity() -> ChunkIdentity {
        ChunkIdentity {
            id: "chatcmpl-1".to_string(),
            model: "qwen".to_string(),
            created: 100,
        }
    }

    #[test]
    fn text_chunk_shape() {
        let v = serde_json::to_value(ChatCompletionChunk::text(&identity(), "hi")).unwrap();
        assert_eq!(
            v,
            json!({"id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 100,
                   "model": "qwen",
                   "choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": null}]})
        );
    }

    #[test]
    fn tool_call_and_terminal_chunk_shape() {
        let call = new_tool_call("call_a", "bash", "{\"command\":\"ls\"}");
        let v = serde_json::to_value(ChatCompletionChunk::tool_call(&identity(), 1, &call)).unwrap();
        assert_eq!(
            v["choices"][0]["delta"],
            json!({"tool_calls": [{"index": 1, "id": "call_a", "type": "function",
                   "function": {"name": "bash", "arguments": "{\"command\":\"ls\"}"}}]})
        );
        assert_eq!(v["choices"][0]["finish_reason"], Value::Null);

        let v = serde_json::to_value(ChatCompletionChunk::finish(&identity(), "stop")).unwrap();
        assert_eq!(v["choices"][0]["delta"], json!({}));
        assert_eq!(v["choices"][0]["finish_reason"], json!("stop"));
    }

    #[test]
    fn request_defaults_and_cap() {
        let config = ServerConfig::default();
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "x",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1_000_000,
            "temperature": 0.2
        }))
        .unwrap();
        let params = req.sampling_params(&config);
        assert_eq!(params.max_tokens, config.max_tokens);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_k, config.sampling.top_k);
        assert!(req.validate().is_ok());
        assert!(req.tool_calls_allowed());
    }

    #[test]
    fn request_validation() {
        let mut req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 2.5
        }))
        .unwrap();
        assert!(req.validate().unwrap_err().contains("temperature"));
        req.temperature = None;
        req.top_k = Some(-1);
        assert!(req.validate().is_err());
        req.top_k = None;
        req.messages.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn tool_choice_none_disables_extraction() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": "none"
        }))
        .unwrap();
        assert!(!req.tool_calls_allowed());
    }

    #[test]
    fn assistant_message_serializes_null_content() {
        let msg = ChatMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![new_tool_call("call_1", "bash", "{}")]),
        };
        let v = serde_json::to_value(msg).unwrap();
        assert_eq!(v["content"], Value::Null);
        assert_eq!(v["tool_calls"][0]["type"], json!("function"));
    }
}
