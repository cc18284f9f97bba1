// src/server/aggregator.rs
//! Incremental tool call detection over a streamed generation.
//!
//! The aggregator sees fragments one at a time and must decide, without the
//! rest of the stream, what is safe to forward as text. Anything from the last
//! unflushed `<` onward is held back so a tag is never split across frames.
//! Once a call-opening tag shows up, text forwarding stops and the buffer is
//! parsed as soon as a closing tag arrives. Every response ends with exactly one
//! terminal frame (or one error frame) followed by the `[DONE]` sentinel.

use super::streaming::ChatResponse;
use super::{ChatCompletionChunk, ChunkIdentity, ErrorFrame};
use crate::core::{unix_timestamp, GenerationFragment};
use crate::tools::helpers::log_tool_calls;
use crate::tools::parser::ToolParser;
use crate::tools::scanner::{FUNCTION_END, FUNCTION_PREFIX, TOOL_CALL_END, TOOL_CALL_START};
use crate::tools::{ToolCall, ToolSchemaMap};

/// Content fragments tolerated inside an unclosed call.
pub const WATCHDOG_LIMIT: usize = 500;

pub const CALL_OPEN_MARKERS: [&str; 2] = [TOOL_CALL_START, FUNCTION_PREFIX];
pub const CALL_CLOSE_MARKERS: [&str; 2] = [TOOL_CALL_END, FUNCTION_END];
pub const HARD_STOP_MARKERS: [&str; 3] = ["<|im_start|>", "<|im_end|>", "<|endoftext|>"];

/// Longest marker (`<|endoftext|>`) minus one. A marker split across fragments
/// starts at most this many bytes before the previously scanned end.
const MARKER_OVERLAP: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Plain,
    InCall,
    Flushing,
    Done,
}

pub struct StreamAggregator {
    parser: ToolParser,
    schemas: Option<ToolSchemaMap>,
    tool_calling: bool,
    fallback_model: String,

    buffer: String,
    yielded_len: usize,
    /// Buffer length after the last completed marker scan
    scanned: usize,
    tokens_since_detected: usize,
    finished_with_tool_calls: bool,
    identity: Option<ChunkIdentity>,
    phase: StreamPhase,
}

fn earliest_marker(text: &str, markers: &[&str]) -> Option<usize> {
    markers.iter().filter_map(|m| text.find(m)).min()
}

/// Cut at the first hard-stop marker and drop a trailing partial one.
fn strip_control_markers(text: &str) -> &str {
    let text = match earliest_marker(text, &HARD_STOP_MARKERS) {
        Some(pos) => &text[..pos],
        None => text,
    };
    if let Some(pos) = text.rfind("<|") {
        let suffix = &text[pos..];
        if HARD_STOP_MARKERS.iter().any(|m| m.starts_with(suffix)) {
            return &text[..pos];
        }
    }
    text
}

impl StreamAggregator {
    pub fn new(fallback_model: impl Into<String>) -> Self {
        Self {
            parser: ToolParser::new(),
            schemas: None,
            tool_calling: true,
            fallback_model: fallback_model.into(),
            buffer: String::new(),
            yielded_len: 0,
            scanned: 0,
            tokens_since_detected: 0,
            finished_with_tool_calls: false,
            identity: None,
            phase: StreamPhase::Plain,
        }
    }

    /// Restrict emitted calls to these tools.
    pub fn with_schemas(mut self, schemas: Option<ToolSchemaMap>) -> Self {
        self.schemas = schemas;
        self
    }

    /// With tool calling off, every fragment is forwarded as text.
    pub fn with_tool_calling(mut self, enabled: bool) -> Self {
        self.tool_calling = enabled;
        self
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == StreamPhase::Done
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn tool_call_detected(&self) -> bool {
        self.phase == StreamPhase::InCall
    }

    pub fn finished_with_tool_calls(&self) -> bool {
        self.finished_with_tool_calls
    }

    fn identity(&mut self) -> &ChunkIdentity {
        let fallback = &self.fallback_model;
        self.identity.get_or_insert_with(|| ChunkIdentity {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: fallback.clone(),
            created: unix_timestamp(),
        })
    }

    fn emit_text(&mut self, out: &mut Vec<ChatResponse>, text: &str) {
        if text.is_empty() {
            return;
        }
        let chunk = ChatCompletionChunk::text(self.identity(), text);
        out.push(ChatResponse::Chunk(chunk));
    }

    fn emit_calls(&mut self, out: &mut Vec<ChatResponse>, calls: &[ToolCall]) {
        log_tool_calls("Streaming", calls);
        let identity = self.identity().clone();
        out.extend(
            calls
                .iter()
                .enumerate()
                .map(|(idx, call)| ChatResponse::Chunk(ChatCompletionChunk::tool_call(&identity, idx, call))),
        );
        self.finished_with_tool_calls = true;
    }

    fn terminate(&mut self, out: &mut Vec<ChatResponse>) {
        let reason = if self.finished_with_tool_calls {
            "tool_calls"
        } else {
            "stop"
        };
        let chunk = ChatCompletionChunk::finish(self.identity(), reason);
        out.push(ChatResponse::Chunk(chunk));
        out.push(ChatResponse::Done);
        self.yielded_len = self.buffer.len();
        self.phase = StreamPhase::Done;
    }

    /// Consume one fragment and return the frames it releases.
    pub fn push(&mut self, fragment: &GenerationFragment) -> Vec<ChatResponse> {
        let mut out = Vec::new();
        if matches!(self.phase, StreamPhase::Flushing | StreamPhase::Done) {
            return out;
        }
        if self.identity.is_none() {
            self.identity = Some(ChunkIdentity {
                id: fragment.request_id.clone(),
                model: fragment.model_name.clone(),
                created: fragment.created_at,
            });
        }

        if !fragment.delta_text.is_empty() {
            self.buffer.push_str(&fragment.delta_text);

            if self.phase == StreamPhase::InCall {
                self.tokens_since_detected += 1;
                if self.tokens_since_detected > WATCHDOG_LIMIT {
                    tracing::warn!(
                        "Runaway generation: tool call still open after {} fragments, forcing flush",
                        WATCHDOG_LIMIT
                    );
                    self.flush(&mut out);
                    return out;
                }
            }

            if self.find_new_marker(&HARD_STOP_MARKERS).is_some() {
                tracing::info!("Stop marker found in generated text, ending stream");
                self.flush(&mut out);
                return out;
            }

            if self.phase == StreamPhase::Plain {
                self.scan_plain(&mut out);
            }

            if self.phase == StreamPhase::InCall && self.try_complete_call(&mut out) {
                return out;
            }
            self.scanned = self.buffer.len();
        }

        if let Some(reason) = &fragment.finish_reason {
            tracing::debug!("Engine finished with reason '{}'", reason);
            self.flush(&mut out);
        }
        out
    }

    /// The stream ended without a terminal decision.
    pub fn finish(&mut self) -> Vec<ChatResponse> {
        let mut out = Vec::new();
        if !self.is_done() {
            self.flush(&mut out);
        }
        out
    }

    /// Upstream failed: one error frame and the sentinel replace the terminal frame.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<ChatResponse> {
        if self.is_done() {
            return Vec::new();
        }
        self.phase = StreamPhase::Done;
        vec![
            ChatResponse::Error(ErrorFrame::new(message, "stream_error")),
            ChatResponse::Done,
        ]
    }

    /// Earliest marker in text not covered by a previous scan, as a buffer offset.
    fn find_new_marker(&self, markers: &[&str]) -> Option<usize> {
        let mut from = self
            .scanned
            .saturating_sub(MARKER_OVERLAP)
            .max(self.yielded_len);
        while !self.buffer.is_char_boundary(from) {
            from -= 1;
        }
        earliest_marker(&self.buffer[from..], markers).map(|pos| from + pos)
    }

    /// The unyielded tail is always empty or a single held `<...` run, so only
    /// new text can move the release point.
    fn scan_plain(&mut self, out: &mut Vec<ChatResponse>) {
        let call_start = if self.tool_calling {
            self.find_new_marker(&CALL_OPEN_MARKERS)
        } else {
            None
        };

        let release = match call_start {
            Some(at) => {
                tracing::debug!("Tool call opening detected in stream");
                self.phase = StreamPhase::InCall;
                self.tokens_since_detected = 0;
                at
            }
            None => {
                let fresh = self.scanned.max(self.yielded_len);
                match self.buffer[fresh..].rfind('<') {
                    Some(pos) => fresh + pos,
                    None if self.buffer[self.yielded_len..].starts_with('<') => self.yielded_len,
                    None => self.buffer.len(),
                }
            }
        };

        let text = self.buffer[self.yielded_len..release].to_string();
        self.yielded_len = release;
        self.emit_text(out, &text);
    }

    fn try_complete_call(&mut self, out: &mut Vec<ChatResponse>) -> bool {
        if self.find_new_marker(&CALL_CLOSE_MARKERS).is_none() {
            return false;
        }
        let parsed = self.parser.parse(&self.buffer, self.schemas.as_ref());
        if !parsed.found {
            return false;
        }
        self.emit_calls(out, &parsed.calls);
        self.terminate(out);
        true
    }

    fn flush(&mut self, out: &mut Vec<ChatResponse>) {
        self.phase = StreamPhase::Flushing;

        let pending = self.buffer[self.yielded_len..].to_string();
        // Text from the first control marker on belongs to another turn.
        let turn = strip_control_markers(&pending);
        if self.tool_calling && !self.finished_with_tool_calls {
            if let Some(pos) = earliest_marker(turn, &CALL_OPEN_MARKERS) {
                let end = self.yielded_len + turn.len();
                let parsed = self.parser.parse(&self.buffer[..end], self.schemas.as_ref());
                if parsed.found {
                    self.emit_text(out, &turn[..pos]);
                    self.emit_calls(out, &parsed.calls);
                }
            }
        }

        if !self.finished_with_tool_calls && !turn.trim().is_empty() {
            self.emit_text(out, turn);
        }
        self.terminate(out);
    }
}
