// src/tools/helpers.rs
//! Helper functions for tool call processing.
//!
//! These functions handle schema mapping, call-name validation and logging.

use super::{Tool, ToolCall, ToolSchema, ToolSchemaMap};

/// Build a map of tool names to their parameter schemas
pub fn build_tool_schema_map(tools: &[Tool]) -> ToolSchemaMap {
    tools
        .iter()
        .filter(|tool| tool.tool_type == "function")
        .map(|tool| (tool.function.name.clone(), ToolSchema::from_tool(tool)))
        .collect()
}

/// Whether a parsed call may be returned. Without a schema every name passes;
/// with one, unknown names are dropped and logged.
pub fn is_known_tool(name: &str, schemas: Option<&ToolSchemaMap>) -> bool {
    let Some(schemas) = schemas else {
        return true;
    };
    if schemas.contains_key(name) {
        return true;
    }
    let mut available: Vec<&str> = schemas.keys().map(String::as_str).collect();
    available.sort_unstable();
    tracing::warn!(
        "Tool '{}' not found in schema map, dropping call. Available tools: {:?}",
        name,
        available
    );
    false
}

/// Format tool calls for logging - returns a summary string
pub fn format_tool_calls_summary(tool_calls: &[ToolCall]) -> String {
    if tool_calls.is_empty() {
        return String::new();
    }
    tool_calls
        .iter()
        .map(|call| {
            let args = call.function.arguments.replace('\n', " ");
            let truncated = if args.chars().count() > 160 {
                let snippet: String = args.chars().take(160).collect();
                format!("{}...", snippet)
            } else {
                args
            };
            format!("{}(args={})", call.function.name, truncated)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Log tool calls with a label
pub fn log_tool_calls(label: &str, tool_calls: &[ToolCall]) {
    if tool_calls.is_empty() {
        return;
    }
    let summary = format_tool_calls_summary(tool_calls);
    tracing::info!("{} tool call(s): {}", label, summary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{function_tool, new_tool_call};

    #[test]
    fn test_build_tool_schema_map() {
        let tools = vec![
            function_tool("bash", "Run a command")
                .param("command", "string", "command line", true)
                .build(),
            function_tool("read", "Read a file")
                .param("path", "string", "file path", true)
                .build(),
        ];
        let map = build_tool_schema_map(&tools);
        assert_eq!(map.len(), 2);
        assert_eq!(map["bash"].sole_required(), Some("command"));
    }

    #[test]
    fn unknown_names_are_rejected_only_with_schema() {
        let tools = vec![function_tool("bash", "Run a command").build()];
        let map = build_tool_schema_map(&tools);
        assert!(is_known_tool("bash", Some(&map)));
        assert!(!is_known_tool("foo", Some(&map)));
        assert!(is_known_tool("foo", None));
    }

    #[test]
    fn summary_truncates_long_arguments() {
        let long = format!("{{\"content\":\"{}\"}}", "x".repeat(400));
        let calls = vec![
            new_tool_call("call_1", "write", long),
            new_tool_call("call_2", "bash", "{\"command\":\"ls\\n\"}"),
        ];
        let summary = format_tool_calls_summary(&calls);
        assert!(summary.starts_with("write(args={\"content\":\"xxx"));
        assert!(summary.contains("...), bash(args="));
        assert!(format_tool_calls_summary(&[]).is_empty());
    }
}
