//! Tolerant JSON extraction from LLM responses.
//!
//! Models wrap JSON in markdown fences, add trailing commas, or prefix prose
//! despite instructions. These helpers recover the payload where possible so
//! the strict re-prompt path is only taken when the content is truly broken.

use serde_json::Value;

/// Extract a JSON value from raw model output.
///
/// Tries, in order: direct parse, fenced ```json blocks, bare ``` blocks,
/// and finally the substring between the first `{`/`[` and the matching last
/// `}`/`]`. Trailing commas are stripped before each fallback parse.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(inner) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(&strip_trailing_commas(inner)) {
            return Some(value);
        }
    }

    let candidate = outermost_json_span(trimmed)?;
    serde_json::from_str(&strip_trailing_commas(candidate)).ok()
}

/// Ensure the literal token "json" appears in the prompt. Some providers
/// reject JSON-mode requests whose prompt never mentions the word.
pub fn ensure_json_keyword(prompt: &str) -> String {
    if prompt.to_lowercase().contains("json") {
        prompt.to_string()
    } else {
        format!("{}\n\nRespond in JSON format.", prompt)
    }
}

fn fenced_block(content: &str) -> Option<&str> {
    let start = if let Some(idx) = content.find("```json") {
        idx + 7
    } else if let Some(idx) = content.find("```") {
        idx + 3
    } else {
        return None;
    };
    let end = content[start..].find("```")? + start;
    Some(content[start..end].trim())
}

fn outermost_json_span(content: &str) -> Option<&str> {
    let open = content.find(['{', '['])?;
    let close_char = if content.as_bytes()[open] == b'{' { '}' } else { ']' };
    let close = content.rfind(close_char)?;
    if close <= open {
        return None;
    }
    Some(&content[open..=close])
}

fn strip_trailing_commas(json: &str) -> String {
    // Good enough for model output; strings containing ",}" are not worth
    // a full parser here.
    let mut out = String::with_capacity(json.len());
    let mut chars = json.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            let mut lookahead = chars.clone();
            while let Some(&next) = lookahead.peek() {
                if next.is_whitespace() {
                    lookahead.next();
                } else {
                    break;
                }
            }
            if matches!(lookahead.peek(), Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_parse() {
        let value = extract_json(r#"{"is_toc": "yes"}"#).unwrap();
        assert_eq!(value["is_toc"], "yes");
    }

    #[test]
    fn test_fenced_block() {
        let content = "Here you go:\n```json\n{\"items\": [1, 2]}\n```\nDone.";
        let value = extract_json(content).unwrap();
        assert_eq!(value["items"][1], 2);
    }

    #[test]
    fn test_bare_fence() {
        let content = "```\n[{\"title\": \"Intro\"}]\n```";
        let value = extract_json(content).unwrap();
        assert_eq!(value[0]["title"], "Intro");
    }

    #[test]
    fn test_prose_wrapped_object() {
        let content = "The answer is {\"page\": 5} as requested.";
        let value = extract_json(content).unwrap();
        assert_eq!(value["page"], 5);
    }

    #[test]
    fn test_trailing_comma_recovery() {
        let content = "```json\n{\"a\": 1, \"b\": [1, 2,],}\n```";
        let value = extract_json(content).unwrap();
        assert_eq!(value["b"][1], 2);
    }

    #[test]
    fn test_garbage_returns_none() {
        assert!(extract_json("no structured data here").is_none());
        assert!(extract_json("").is_none());
    }

    #[test]
    fn test_ensure_json_keyword() {
        assert!(ensure_json_keyword("list the sections").contains("JSON"));
        let already = "Reply in JSON: {...}";
        assert_eq!(ensure_json_keyword(already), already);
    }
}
