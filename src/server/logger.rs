// src/server/logger.rs
//! Chat completion request/response logger.
//! Enable by setting environment variable CODER_BRIDGE_CHAT_LOGGER=true

use super::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::tools::ToolCall;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CHAT_LOGGER_ENV: &str = "CODER_BRIDGE_CHAT_LOGGER";

fn flag_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

pub fn is_logging_enabled() -> bool {
    flag_enabled(std::env::var(CHAT_LOGGER_ENV).ok().as_deref())
}

/// Per-request transcript under `log/`, one file per chat completion.
pub struct ChatCompletionLogger {
    path: PathBuf,
}

impl ChatCompletionLogger {
    /// None unless the transcript flag is set.
    pub fn new() -> Option<Arc<Self>> {
        is_logging_enabled().then(|| Arc::new(Self::in_dir(Path::new("log"))))
    }

    fn in_dir(dir: &Path) -> Self {
        if let Err(e) = fs::create_dir_all(dir) {
            tracing::warn!("Cannot create transcript dir {}: {}", dir.display(), e);
        }
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let path = dir.join(format!(
            "openai_{}_{:03}.log",
            stamp.as_secs(),
            stamp.subsec_millis()
        ));
        tracing::info!("Chat transcript: {}", path.display());
        Self { path }
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    fn append(&self, content: &str) {
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(content.as_bytes()));
        if let Err(e) = written {
            tracing::debug!("Transcript write to {} failed: {}", self.path.display(), e);
        }
    }

    fn section<T: Serialize + ?Sized>(&self, header: &str, value: &T) {
        if let Ok(json) = serde_json::to_string_pretty(value) {
            self.append(&format!("\n=== {header} ===\n{json}\n"));
        }
    }

    pub fn log_request(&self, request: &ChatCompletionRequest) {
        self.section("REQUEST", request);
    }

    pub fn log_start_response(&self) {
        self.append("\n=== MODEL RESPONSE ===\n");
    }

    pub fn log_stream_token(&self, token: &str) {
        self.append(token);
    }

    /// Generated text containing call markup, before parsing.
    pub fn log_raw_tool_body(&self, raw: &str) {
        self.append(&format!("\n=== RAW TOOL BODY ===\n{raw}\n"));
    }

    pub fn log_tool_calls(&self, label: &str, tool_calls: &[ToolCall]) {
        if !tool_calls.is_empty() {
            let header = format!("{} TOOL CALLS ({})", label.to_uppercase(), tool_calls.len());
            self.section(&header, tool_calls);
        }
    }

    pub fn log_stream_end(&self, final_chunk: &ChatCompletionChunk) {
        self.section("FINAL CHUNK", final_chunk);
    }

    pub fn log_response(&self, response: &ChatCompletionResponse) {
        self.section("RESPONSE", response);
    }

    pub fn log_error(&self, error: &str) {
        self.append(&format!("\n=== ERROR ===\n{error}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::new_tool_call;

    #[test]
    fn env_flag_parsing() {
        assert!(flag_enabled(Some("true")));
        assert!(flag_enabled(Some("TRUE")));
        assert!(flag_enabled(Some("1")));
        assert!(!flag_enabled(Some("yes")));
        assert!(!flag_enabled(None));
    }

    #[test]
    fn writes_sections_to_file() {
        let dir = std::env::temp_dir().join(format!("coder-bridge-log-{}", uuid::Uuid::new_v4()));
        let logger = ChatCompletionLogger::in_dir(&dir);
        logger.log_start_response();
        logger.log_stream_token("Hello");
        logger.log_raw_tool_body("<function=bash></function>");
        logger.log_tool_calls("parsed", &[new_tool_call("call_1", "bash", "{}")]);
        logger.log_tool_calls("empty", &[]);
        logger.log_error("boom");

        let written = fs::read_to_string(logger.file_path()).unwrap();
        assert!(written.contains("=== MODEL RESPONSE ===\nHello"));
        assert!(written.contains("=== PARSED TOOL CALLS (1) ==="));
        assert!(!written.contains("EMPTY"));
        assert!(written.contains("=== ERROR ===\nboom"));
        let _ = fs::remove_dir_all(&dir);
    }
}
