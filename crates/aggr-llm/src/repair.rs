//! JSON repair pass (`spec.md` §6 "LLM wire format").
//!
//! The dispatcher tolerates responses wrapped in ```json fences or
//! with trailing prose; it locates the outermost balanced `{...}` and,
//! if that still fails to parse, attempts to balance unmatched braces
//! and brackets before giving up. Extends the fence-stripping seen in
//! `extraction::ai::openai::OpenAI::summarize` with an explicit
//! brace-matching scan, since LLM aggregation/merge responses are
//! larger and more prone to truncation.

use serde::de::DeserializeOwned;

/// Strip a leading ```json / ``` fence and trailing ``` fence, if present.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .trim()
        .strip_suffix("```")
        .unwrap_or(trimmed)
        .trim()
}

/// Find the outermost balanced `{...}` span in `text`, tracking string
/// literals so braces inside quoted strings don't confuse the scan.
fn outermost_braces(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Append missing closing braces/brackets so an obviously-truncated
/// JSON blob at least parses, even if the tail content is lost. Does
/// not attempt to recover truncated string literals or values.
fn balance(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for b in text.bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push('}'),
            b'[' => stack.push(']'),
            b'}' | b']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut repaired = text.to_string();
    if in_string {
        repaired.push('"');
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    repaired
}

/// Parse `raw` as `T`, tolerating code fences, trailing prose, and
/// minor truncation. Tries, in order: direct parse, fence-stripped
/// parse, outermost-`{...}`-span parse, and a brace-balanced repair of
/// that span.
pub fn parse_repaired<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    if let Ok(v) = serde_json::from_str(raw) {
        return Ok(v);
    }

    let stripped = strip_fence(raw);
    if let Ok(v) = serde_json::from_str(stripped) {
        return Ok(v);
    }

    let Some(span) = outermost_braces(stripped) else {
        return Err("no balanced JSON object found in response".to_string());
    };
    if let Ok(v) = serde_json::from_str(span) {
        return Ok(v);
    }

    let repaired = balance(span);
    serde_json::from_str(&repaired).map_err(|e| format!("repair pass failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn parses_plain_json() {
        let v: Value = parse_repaired(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn strips_json_fence() {
        let v: Value = parse_repaired("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn tolerates_trailing_prose() {
        let v: Value =
            parse_repaired(r#"Here is the result: {"a": 1} Hope that helps!"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn repairs_truncated_object() {
        let v: Value = parse_repaired(r#"{"a": [1, 2, 3"#).unwrap();
        assert_eq!(v["a"][1], 2);
    }

    #[test]
    fn fails_cleanly_on_garbage() {
        let result: Result<Value, String> = parse_repaired("not json at all");
        assert!(result.is_err());
    }
}
