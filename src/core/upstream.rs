// src/core/upstream.rs
//! Engine backed by a llama.cpp style OpenAI-compatible server.

use super::{
    unix_timestamp, EngineError, FragmentStream, GenerationFragment, GenerationRequest,
    InferenceEngine, Result, TokenUsage,
};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

pub struct UpstreamEngine {
    client: Client,
    base_url: String,
    model: String,
}

impl UpstreamEngine {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn request_body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let p = &request.params;
        let mut body = json!({
            "model": self.model,
            "messages": prepare_messages(&request.messages),
            "temperature": p.temperature,
            "top_p": p.top_p,
            "top_k": p.top_k,
            "max_tokens": p.max_tokens,
            "repeat_penalty": p.repeat_penalty,
            "presence_penalty": p.presence_penalty,
            "frequency_penalty": p.frequency_penalty,
            "stop": request.stop,
            "stream": stream,
        });
        if let Some(tools) = &request.tools {
            body["tools"] = json!(tools);
        }
        body
    }

    async fn send(&self, body: Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl InferenceEngine for UpstreamEngine {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn ready(&self) -> BoxFuture<'_, bool> {
        async move {
            match self.client.get(self.endpoint("models")).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    tracing::debug!("Upstream readiness probe failed: {}", e);
                    false
                }
            }
        }
        .boxed()
    }

    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<GenerationFragment>> {
        async move {
            let body = self.request_body(&request, false);
            let payload: Value = self.send(body).await?.json().await?;
            completion_to_fragment(&payload, &self.model)
        }
        .boxed()
    }

    fn generate_stream(&self, request: GenerationRequest) -> BoxFuture<'_, Result<FragmentStream>> {
        async move {
            let body = self.request_body(&request, true);
            let response = self.send(body).await?;
            Ok(fragment_stream(response.bytes_stream(), self.model.clone()))
        }
        .boxed()
    }
}

/// Decode assistant `tool_calls[].function.arguments` given as JSON strings into
/// objects; llama.cpp chat templates iterate over them as mappings.
pub fn prepare_messages(messages: &[Value]) -> Vec<Value> {
    let mut messages = messages.to_vec();
    for message in messages.iter_mut() {
        let Some(calls) = message.get_mut("tool_calls").and_then(Value::as_array_mut) else {
            continue;
        };
        for call in calls.iter_mut() {
            let Some(arguments) = call.pointer_mut("/function/arguments") else {
                continue;
            };
            let Some(raw) = arguments.as_str() else {
                continue;
            };
            match serde_json::from_str::<Value>(raw) {
                Ok(decoded) => *arguments = decoded,
                Err(_) => tracing::warn!("Failed to decode tool call arguments: {}", raw),
            }
        }
    }
    messages
}

fn upstream_error(payload: &Value) -> Option<EngineError> {
    let error = payload.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(EngineError::Payload(message))
}

fn identity(payload: &Value, fallback_model: &str) -> (String, String, u64) {
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()));
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(fallback_model)
        .to_string();
    let created = payload
        .get("created")
        .and_then(Value::as_u64)
        .unwrap_or_else(unix_timestamp);
    (id, model, created)
}

fn usage(payload: &Value) -> Option<TokenUsage> {
    let usage = payload.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as usize,
        completion_tokens: usage.get("completion_tokens")?.as_u64()? as usize,
    })
}

/// Turn a non-streaming completion body into one aggregate fragment.
pub fn completion_to_fragment(payload: &Value, fallback_model: &str) -> Result<GenerationFragment> {
    if let Some(err) = upstream_error(payload) {
        return Err(err);
    }
    let choice = payload
        .pointer("/choices/0")
        .ok_or_else(|| EngineError::Payload("completion has no choices".to_string()))?;
    let (id, model, created) = identity(payload, fallback_model);
    let content = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut fragment = GenerationFragment::new(id, model, content, created);
    fragment.finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    fragment.usage = usage(payload);
    Ok(fragment)
}

/// Turn one streamed chunk into a fragment. Chunks without choices are skipped.
pub fn chunk_to_fragment(payload: &Value, fallback_model: &str) -> Result<Option<GenerationFragment>> {
    if let Some(err) = upstream_error(payload) {
        return Err(err);
    }
    let Some(choice) = payload.pointer("/choices/0") else {
        return Ok(None);
    };
    let (id, model, created) = identity(payload, fallback_model);
    let delta = choice
        .pointer("/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut fragment = GenerationFragment::new(id, model, delta, created);
    fragment.finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    fragment.usage = usage(payload);
    Ok(Some(fragment))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental decoder for `data:` lines of a server-sent event stream.
/// Network chunks may split lines anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(nl) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=nl).collect();
            if let Some(event) = Self::decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.pending);
        Self::decode_line(&line)
    }

    fn decode_line(line: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(line);
        let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?;
        let data = data.trim_start();
        if data == "[DONE]" {
            Some(SseEvent::Done)
        } else if data.is_empty() {
            None
        } else {
            Some(SseEvent::Data(data.to_string()))
        }
    }
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    decoder: SseDecoder,
    ready: VecDeque<Result<GenerationFragment>>,
    finished: bool,
    model: String,
}

impl<S> SseState<S> {
    fn absorb(&mut self, events: impl IntoIterator<Item = SseEvent>) {
        for event in events {
            if self.finished {
                return;
            }
            match event {
                SseEvent::Done => self.finished = true,
                SseEvent::Data(data) => {
                    let parsed = serde_json::from_str::<Value>(&data)
                        .map_err(|e| EngineError::Payload(format!("{}: {}", e, data)))
                        .and_then(|payload| chunk_to_fragment(&payload, &self.model));
                    match parsed {
                        Ok(Some(fragment)) => self.ready.push_back(Ok(fragment)),
                        Ok(None) => {}
                        Err(e) => {
                            self.ready.push_back(Err(e));
                            self.finished = true;
                        }
                    }
                }
            }
        }
    }
}

/// Adapt a raw SSE byte stream into generation fragments.
pub fn fragment_stream<S, B, E>(bytes: S, model: String) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<EngineError> + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
        model,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.push(chunk.as_ref());
                    st.absorb(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e.into()), st));
                }
                None => {
                    let tail = st.decoder.finish();
                    st.absorb(tail);
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}
