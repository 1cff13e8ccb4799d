//! Extraction of the JSON analysis object from free-form model output.

use crate::util::truncate_str;
use serde_json::{json, Value};

/// Raw output kept in the fallback object when nothing parses.
const RAW_RESPONSE_CHARS: usize = 500;
const MAX_EMBEDDED_CANDIDATES: usize = 4;

fn push_unique_candidate(candidates: &mut Vec<String>, candidate: impl Into<String>) {
    let candidate = candidate.into();
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

fn strip_markdown_fences(content: &str) -> Option<String> {
    let start = content.find("```")?;
    let without_open = &content[start + 3..];
    let after_header = match without_open.find('\n') {
        Some(newline_idx) => &without_open[newline_idx + 1..],
        None => without_open,
    };
    let end_idx = after_header.find("```")?;
    Some(after_header[..end_idx].trim().to_string())
}

fn extract_balanced_json_from(content: &str, start: usize) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(content[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Balanced `{...}` spans, in order of appearance.
fn extract_object_candidates(content: &str, max_candidates: usize) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, ch) in content.char_indices() {
        if ch != '{' {
            continue;
        }
        if let Some(candidate) = extract_balanced_json_from(content, idx) {
            push_unique_candidate(&mut out, candidate);
            if out.len() >= max_candidates {
                break;
            }
        }
    }
    out
}

/// Parse the model's output into a JSON object.
///
/// Tries the whole text, then a fenced block, then embedded balanced objects.
/// When nothing parses the result is an error object carrying the first 500
/// characters of the output, so a paid call still yields a storable record.
pub fn parse_analysis_output(content: &str) -> Value {
    let mut candidates = Vec::new();
    push_unique_candidate(&mut candidates, content);
    if let Some(stripped) = strip_markdown_fences(content) {
        push_unique_candidate(&mut candidates, stripped);
    }
    let snapshot = candidates.clone();
    for current in &snapshot {
        for extracted in extract_object_candidates(current, MAX_EMBEDDED_CANDIDATES) {
            push_unique_candidate(&mut candidates, extracted);
        }
    }

    let mut last_err: Option<String> = None;
    for candidate in &candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value @ Value::Object(_)) => return value,
            Ok(_) => last_err = Some("response is not a JSON object".to_string()),
            Err(err) => last_err = Some(err.to_string()),
        }
    }

    json!({
        "error": "Failed to parse analysis response",
        "raw_response": truncate_str(content, RAW_RESPONSE_CHARS),
        "parse_error": last_err.unwrap_or_else(|| "empty response".to_string()),
    })
}

/// Whether a parsed result is the parse-failure fallback object.
pub fn is_parse_failure(result: &Value) -> bool {
    result.get("raw_response").is_some() && result.get("parse_error").is_some()
}
