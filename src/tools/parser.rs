// src/tools/parser.rs
//! Tool call parsing from complete model output.

use super::coerce::{coerce_parameter, fallback_arguments};
use super::helpers::is_known_tool;
use super::scanner::{
    contains_call_start, extract_call_blocks, extract_parameters, RawCallBlock, FUNCTION_PREFIX,
    TOOL_CALL_START,
};
use super::{generate_tool_call_id, new_tool_call, ToolCall, ToolSchemaMap};
use serde_json::{Map, Value};

/// Outcome of parsing one completed text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedToolCalls {
    pub found: bool,
    pub calls: Vec<ToolCall>,
}

/// Parser for extracting tool calls from model output text.
///
/// Holds no state, so one value can be shared across requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolParser;

impl ToolParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse every call block in `text`.
    ///
    /// With `schemas`, calls to unknown tools are dropped and the schema drives
    /// the argument fallback for blocks without parameter tags.
    pub fn parse(&self, text: &str, schemas: Option<&ToolSchemaMap>) -> ParsedToolCalls {
        if !text.contains(FUNCTION_PREFIX) {
            return ParsedToolCalls::default();
        }

        let mut calls = Vec::new();
        for block in extract_call_blocks(text) {
            if !is_known_tool(block.function_name, schemas) {
                continue;
            }
            let arguments = Value::Object(Self::block_arguments(&block, schemas)).to_string();
            calls.push(new_tool_call(
                generate_tool_call_id(),
                block.function_name,
                arguments,
            ));
        }

        ParsedToolCalls {
            found: !calls.is_empty(),
            calls,
        }
    }

    fn block_arguments(block: &RawCallBlock<'_>, schemas: Option<&ToolSchemaMap>) -> Map<String, Value> {
        let params = extract_parameters(block.raw_body);
        if params.is_empty() {
            let schema = schemas.and_then(|s| s.get(block.function_name));
            return fallback_arguments(block.raw_body, schema);
        }
        params
            .into_iter()
            .map(|p| (p.name.to_string(), coerce_parameter(p.raw_value).into_json()))
            .collect()
    }

    /// Check if text contains any tool call opening tag
    pub fn has_tool_calls(&self, text: &str) -> bool {
        contains_call_start(text)
    }

    /// Text before the first call-opening tag, trimmed.
    pub fn extract_text_before_tool_call<'a>(&self, text: &'a str) -> &'a str {
        let first = [TOOL_CALL_START, FUNCTION_PREFIX]
            .iter()
            .filter_map(|tag| text.find(tag))
            .min();
        match first {
            Some(pos) => text[..pos].trim(),
            None => text.trim(),
        }
    }

    /// Extract both the text response and the tool calls.
    pub fn parse_and_extract_text(
        &self,
        text: &str,
        schemas: Option<&ToolSchemaMap>,
    ) -> (String, ParsedToolCalls) {
        let content = self.extract_text_before_tool_call(text).to_string();
        (content, self.parse(text, schemas))
    }
}
