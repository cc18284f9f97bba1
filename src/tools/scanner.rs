// src/tools/scanner.rs
//! Two-level tag scanner for the Qwen3-Coder tool call markup.
//!
//! ```text
//! <tool_call>
//! <function=get_weather>
//! <parameter=city>NYC</parameter>
//! </function>
//! </tool_call>
//! ```
//!
//! The block scanner finds `<function=NAME>` bodies, preferring those inside
//! `<tool_call>` wrappers and falling back to the whole text when the model
//! skipped the wrapper. The parameter scanner then splits a body into
//! `<parameter=NAME>` values. Unclosed tags run to the nearest boundary
//! instead of failing, so truncated generations still yield their calls.

pub const TOOL_CALL_START: &str = "<tool_call>";
pub const TOOL_CALL_END: &str = "</tool_call>";
pub const FUNCTION_PREFIX: &str = "<function=";
pub const FUNCTION_END: &str = "</function>";
pub const PARAMETER_PREFIX: &str = "<parameter=";
pub const PARAMETER_END: &str = "</parameter>";

/// A `<function=NAME>` block as found in the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCallBlock<'a> {
    pub function_name: &'a str,
    pub raw_body: &'a str,
}

/// A `<parameter=NAME>` value inside a function body, untrimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawParameter<'a> {
    pub name: &'a str,
    pub raw_value: &'a str,
}

/// Extract every call block from `text`, in source order.
pub fn extract_call_blocks(text: &str) -> Vec<RawCallBlock<'_>> {
    let spans = wrapper_spans(text);
    if spans.is_empty() {
        let mut blocks = Vec::new();
        let mut pos = 0;
        while let Some((block, resume)) = next_function_block(text, pos) {
            blocks.push(block);
            pos = resume;
        }
        return blocks;
    }

    // One function per wrapper; anything after it inside the span is ignored.
    spans
        .into_iter()
        .filter_map(|span| next_function_block(span, 0).map(|(block, _)| block))
        .collect()
}

/// Bodies of `<tool_call>` wrappers. An unclosed wrapper ends at the next
/// wrapper opening or at end-of-text.
fn wrapper_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find(TOOL_CALL_START) {
        let start = cursor + rel + TOOL_CALL_START.len();
        let rest = &text[start..];
        let close = rest.find(TOOL_CALL_END);
        let reopen = rest.find(TOOL_CALL_START);
        match (close, reopen) {
            (Some(end), Some(next)) if next < end => {
                spans.push(&rest[..next]);
                cursor = start + next;
            }
            (Some(end), _) => {
                spans.push(&rest[..end]);
                cursor = start + end + TOOL_CALL_END.len();
            }
            (None, Some(next)) => {
                spans.push(&rest[..next]);
                cursor = start + next;
            }
            (None, None) => {
                spans.push(rest);
                break;
            }
        }
    }
    spans
}

/// Find the next well-named function tag at or after `from`.
/// Returns the block and the offset to resume scanning at.
fn next_function_block(text: &str, from: usize) -> Option<(RawCallBlock<'_>, usize)> {
    let mut pos = from;
    loop {
        let tag = pos + text[pos..].find(FUNCTION_PREFIX)?;
        let name_start = tag + FUNCTION_PREFIX.len();
        let rest = &text[name_start..];

        let name_end_rel = rest.find(['>', '\n'])?;
        let name = rest[..name_end_rel].trim();
        if rest.as_bytes()[name_end_rel] == b'\n' || name.is_empty() {
            pos = name_start;
            continue;
        }

        let body_start = name_start + name_end_rel + 1;
        let (body_end, resume) = match text[body_start..].find(FUNCTION_END) {
            Some(rel) => (body_start + rel, body_start + rel + FUNCTION_END.len()),
            None => (text.len(), text.len()),
        };
        return Some((
            RawCallBlock {
                function_name: name,
                raw_body: &text[body_start..body_end],
            },
            resume,
        ));
    }
}

/// Split a function body into its parameters.
///
/// A value ends at the earliest of its own `</parameter>`, the next
/// `<parameter=`, `</function>` or end-of-body, so one malformed parameter
/// cannot swallow the ones after it.
pub fn extract_parameters(body: &str) -> Vec<RawParameter<'_>> {
    let mut params = Vec::new();
    let mut pos = 0;
    while let Some(rel) = body[pos..].find(PARAMETER_PREFIX) {
        let name_start = pos + rel + PARAMETER_PREFIX.len();
        let Some(name_end_rel) = body[name_start..].find('>') else {
            break;
        };
        let name = body[name_start..name_start + name_end_rel].trim();
        let value_start = name_start + name_end_rel + 1;
        let value_rest = &body[value_start..];

        let mut value_end = value_rest.len();
        let mut consumed = value_rest.len();
        if let Some(end) = value_rest.find(PARAMETER_END) {
            value_end = end;
            consumed = end + PARAMETER_END.len();
        }
        for boundary in [PARAMETER_PREFIX, FUNCTION_END] {
            if let Some(b) = value_rest.find(boundary) {
                if b < value_end {
                    value_end = b;
                    consumed = b;
                }
            }
        }

        if !name.is_empty() {
            params.push(RawParameter {
                name,
                raw_value: &value_rest[..value_end],
            });
        }
        pos = value_start + consumed;
    }
    params
}

/// Whether the text contains a call-opening tag.
pub fn contains_call_start(text: &str) -> bool {
    text.contains(TOOL_CALL_START) || text.contains(FUNCTION_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_blocks_in_order() {
        let text = "Let me look.\n<tool_call>\n<function=read>\n<parameter=path>a.rs</parameter>\n</function>\n</tool_call>\n<tool_call>\n<function=grep>\n<parameter=pattern>fn main</parameter>\n</function>\n</tool_call>";
        let blocks = extract_call_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].function_name, "read");
        assert_eq!(blocks[1].function_name, "grep");
        assert!(blocks[1].raw_body.contains("fn main"));
    }

    #[test]
    fn one_function_per_wrapper() {
        let text = "<tool_call><function=a></function><function=b></function></tool_call>";
        let blocks = extract_call_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].function_name, "a");
    }

    #[test]
    fn unwrapped_fallback() {
        let text = "<function=a>x</function>\n<function=b>y</function>";
        let blocks = extract_call_blocks(text);
        assert_eq!(
            blocks,
            vec![
                RawCallBlock {
                    function_name: "a",
                    raw_body: "x"
                },
                RawCallBlock {
                    function_name: "b",
                    raw_body: "y"
                },
            ]
        );
    }

    #[test]
    fn unwrapped_functions_ignored_when_a_wrapper_exists() {
        let text = "<function=stray>1</function><tool_call><function=real>2</function></tool_call>";
        let blocks = extract_call_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].function_name, "real");
    }

    #[test]
    fn truncated_function_runs_to_end() {
        let text = "<tool_call>\n<function=bash>\n<parameter=command>ls -la";
        let blocks = extract_call_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].raw_body, "\n<parameter=command>ls -la");
    }

    #[test]
    fn unclosed_wrapper_stops_at_next_wrapper() {
        let text = "<tool_call><function=a>1</function>\n<tool_call><function=b>2</function></tool_call>";
        let blocks = extract_call_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].function_name, "b");
    }

    #[test]
    fn function_name_is_trimmed_and_must_be_single_line() {
        let blocks = extract_call_blocks("<function= bash >x</function>");
        assert_eq!(blocks[0].function_name, "bash");

        let blocks = extract_call_blocks("<function=broken\nname>x</function><function=ok>y</function>");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].function_name, "ok");

        assert!(extract_call_blocks("<function=>x</function>").is_empty());
        assert!(extract_call_blocks("<function=never_closed").is_empty());
    }

    #[test]
    fn parameters_closed_normally() {
        let params = extract_parameters("\n<parameter=a>1</parameter>\n<parameter=b>\ntwo\n</parameter>\n");
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "a");
        assert_eq!(params[0].raw_value, "1");
        assert_eq!(params[1].raw_value, "\ntwo\n");
    }

    #[test]
    fn unclosed_parameter_stops_at_next_parameter() {
        let params = extract_parameters("<parameter=a>1\n<parameter=b>2</parameter>");
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].raw_value, "1\n");
        assert_eq!(params[1].raw_value, "2");
    }

    #[test]
    fn unclosed_parameter_stops_at_function_end() {
        let params = extract_parameters("<parameter=a>value</function>trailing");
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].raw_value, "value");
    }

    #[test]
    fn unclosed_parameter_runs_to_end_of_body() {
        let params = extract_parameters("<parameter=cmd>echo hi");
        assert_eq!(params[0].raw_value, "echo hi");
    }

    #[test]
    fn empty_parameter_value_is_kept() {
        let params = extract_parameters("<parameter=flag></parameter>");
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].raw_value, "");
    }

    #[test]
    fn detects_call_start() {
        assert!(contains_call_start("x <tool_call>"));
        assert!(contains_call_start("<function=x>"));
        assert!(!contains_call_start("<functional>"));
    }
}
