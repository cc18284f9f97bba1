// src/core/mod.rs
//! Inference engine boundary.
//!
//! The bridge never samples tokens itself. It hands a [`GenerationRequest`] to an
//! [`InferenceEngine`] and consumes the [`GenerationFragment`]s it produces.

pub mod upstream;

use crate::tools::Tool;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stop sequences forwarded with every request.
pub const DEFAULT_STOP_SEQUENCES: [&str; 6] = [
    "<|im_end|>",
    "<|endoftext|>",
    "<|im_start|>user",
    "<|im_start|>system",
    "\n<|im_start|>",
    "\n<|im_end|>",
];

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed upstream payload: {0}")]
    Payload(String),
    #[error("engine is not ready")]
    NotReady,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// One increment of generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationFragment {
    pub request_id: String,
    pub model_name: String,
    pub delta_text: String,
    pub created_at: u64,
    /// Set by the engine on the last fragment when it decided to stop
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl GenerationFragment {
    pub fn new(
        request_id: impl Into<String>,
        model_name: impl Into<String>,
        delta_text: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            model_name: model_name.into(),
            delta_text: delta_text.into(),
            created_at,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: isize,
    pub max_tokens: usize,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.8,
            top_k: 20,
            max_tokens: 16384,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Chat history as sent by the client
    pub messages: Vec<Value>,
    pub tools: Option<Vec<Tool>>,
    pub params: SamplingParams,
    pub stop: Vec<String>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Value>, params: SamplingParams) -> Self {
        Self {
            messages,
            tools: None,
            params,
            stop: DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_tools(mut self, tools: Option<Vec<Tool>>) -> Self {
        self.tools = tools.filter(|t| !t.is_empty());
        self
    }
}

pub type FragmentStream = BoxStream<'static, Result<GenerationFragment>>;

/// A text generator the server can drive.
pub trait InferenceEngine: Send + Sync {
    fn model_name(&self) -> &str;

    fn ready(&self) -> BoxFuture<'_, bool>;

    /// Generate the whole response as one aggregate fragment.
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<GenerationFragment>>;

    fn generate_stream(&self, request: GenerationRequest) -> BoxFuture<'_, Result<FragmentStream>>;
}

pub(crate) fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
