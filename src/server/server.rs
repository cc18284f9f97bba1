// src/server/server.rs
use super::aggregator::StreamAggregator;
use super::logger::ChatCompletionLogger;
use super::{
    streaming::{drive_stream, Streamer},
    ChatResponder,
};
use super::{ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ServerData};
use crate::core::{EngineError, GenerationFragment, GenerationRequest};
use crate::tools::helpers::{build_tool_schema_map, log_tool_calls};
use crate::tools::parser::ToolParser;
use crate::tools::ToolSchemaMap;
use axum::{
    extract::{Json, State},
    response::{sse::KeepAlive, Sse},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn engine_error(context: &str, e: EngineError) -> ChatResponder {
    tracing::error!("{} failed: {}", context, e);
    match e {
        EngineError::NotReady => ChatResponder::Unavailable("Model not loaded".to_string()),
        e => ChatResponder::ModelError(format!("{} failed: {}", context, e)),
    }
}

/// Build the client response for a finished generation, turning tool call
/// markup in the text into structured calls.
pub fn build_completion_response(
    fragment: GenerationFragment,
    tool_calling: bool,
    schemas: Option<&ToolSchemaMap>,
    logger: Option<&ChatCompletionLogger>,
) -> ChatCompletionResponse {
    let parser = ToolParser::new();
    let text = fragment.delta_text;
    let mut finish_reason = fragment.finish_reason.unwrap_or_else(|| "stop".to_string());
    let mut message = ChatMessage::assistant(text.clone());

    if tool_calling && parser.has_tool_calls(&text) {
        if let Some(logger) = logger {
            logger.log_raw_tool_body(&text);
        }
        let (content, parsed) = parser.parse_and_extract_text(&text, schemas);
        if parsed.found {
            log_tool_calls("Parsed", &parsed.calls);
            if let Some(logger) = logger {
                logger.log_tool_calls("parsed", &parsed.calls);
            }
            message.content = (!content.is_empty()).then_some(content);
            message.tool_calls = Some(parsed.calls);
            finish_reason = "tool_calls".to_string();
        }
    }

    ChatCompletionResponse {
        id: fragment.request_id,
        object: "chat.completion",
        created: fragment.created_at,
        model: fragment.model_name,
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: Some(finish_reason),
        }],
        usage: fragment.usage.map(Into::into).unwrap_or_default(),
    }
}

pub async fn chat_completion(
    State(data): State<Arc<ServerData>>,
    Json(request): Json<ChatCompletionRequest>,
) -> ChatResponder {
    if let Err(e) = request.validate() {
        return ChatResponder::ValidationError(e);
    }

    let logger = ChatCompletionLogger::new();
    if let Some(logger) = &logger {
        logger.log_request(&request);
    }

    let use_stream = request.stream.unwrap_or(false);
    let tool_calling = data.config.tool_calling && request.tool_calls_allowed();
    let schemas = request
        .tools
        .as_deref()
        .filter(|tools| !tools.is_empty())
        .map(build_tool_schema_map);
    let params = request.sampling_params(&data.config);
    tracing::debug!(
        "Chat request: {} messages, {} tools, stream={}",
        request.messages.len(),
        schemas.as_ref().map_or(0, |s| s.len()),
        use_stream
    );
    let generation = GenerationRequest::new(request.messages, params).with_tools(request.tools);

    if use_stream {
        let stream = match data.engine.generate_stream(generation).await {
            Ok(stream) => stream,
            Err(e) => return engine_error("Stream generation", e),
        };
        if let Some(logger) = &logger {
            logger.log_start_response();
        }

        let aggregator = StreamAggregator::new(data.config.model_id.clone())
            .with_schemas(schemas)
            .with_tool_calling(tool_calling);
        let (response_tx, client_rx) = flume::unbounded();
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        tokio::spawn(drive_stream(
            stream,
            aggregator,
            response_tx,
            disconnect_rx,
            logger,
        ));

        ChatResponder::Streamer(
            Sse::new(Streamer::new(client_rx, disconnect_tx)).keep_alive(
                KeepAlive::new()
                    .interval(Duration::from_millis(data.config.keep_alive_ms))
                    .text("keep-alive-text"),
            ),
        )
    } else {
        let fragment = match data.engine.generate(generation).await {
            Ok(fragment) => fragment,
            Err(e) => {
                if let Some(logger) = &logger {
                    logger.log_error(&e.to_string());
                }
                return engine_error("Completion generation", e);
            }
        };
        let response =
            build_completion_response(fragment, tool_calling, schemas.as_ref(), logger.as_deref());
        if let Some(logger) = &logger {
            logger.log_response(&response);
        }
        ChatResponder::Completion(response)
    }
}

pub async fn health(State(data): State<Arc<ServerData>>) -> ChatResponder {
    if !data.engine.ready().await {
        return ChatResponder::Unavailable("Model not loaded".to_string());
    }
    ChatResponder::Json(json!({
        "status": "ok",
        "model": data.config.model_id,
        "context_window": data.config.context_window,
        "tool_calling_enabled": data.config.tool_calling,
    }))
}

pub async fn list_models(State(data): State<Arc<ServerData>>) -> ChatResponder {
    ChatResponder::Json(json!({
        "object": "list",
        "data": [{
            "id": data.config.model_id,
            "object": "model",
            "owned_by": "local",
            "permission": [],
        }],
    }))
}

pub async fn completions() -> ChatResponder {
    ChatResponder::BadRequest(
        "Text completions not supported. Use /v1/chat/completions".to_string(),
    )
}

pub async fn root(State(data): State<Arc<ServerData>>) -> ChatResponder {
    ChatResponder::Json(json!({
        "status": "running",
        "name": "Qwen3-Coder Server",
        "model": data.config.model_name,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/health",
            "chat": "/v1/chat/completions",
            "models": "/v1/models",
        },
    }))
}
