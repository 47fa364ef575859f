//! Shared helpers for parsing model output and bounding text.

use serde::de::DeserializeOwned;

/// Extract the outermost JSON object from text that may contain other content.
/// Brace-counting skips braces that appear inside JSON string literals, so
/// responses carrying source code survive intact.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a typed value out of a model response: the whole text first, then
/// the outermost embedded object (covers ```json fences and prose wrappers).
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Option<T> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }
    let object = extract_json_object(text)?;
    serde_json::from_str(&object).ok()
}

/// Truncate to at most `max_bytes`, respecting char boundaries, appending a
/// marker when anything was cut.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... [truncated {} bytes]", &text[..cut], text.len() - cut)
}

/// First eight characters of a run id, used in branch and directory names.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_with_prefix_and_suffix() {
        let text = r#"Here is the plan: {"key": "value"} hope it helps"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"```json
{"new_content": "fn main() { println!(\"}\"); }", "file_path": "src/main.rs"}
```"#;
        let extracted = extract_json_object(text).unwrap();
        let value: serde_json::Value = serde_json::from_str(&extracted).unwrap();
        assert_eq!(value["file_path"], "src/main.rs");
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_parse_json_response_typed() {
        #[derive(serde::Deserialize)]
        struct Reply {
            title: String,
        }
        let reply: Reply = parse_json_response("Sure!\n{\"title\": \"Retry limit\"}").unwrap();
        assert_eq!(reply.title, "Retry limit");
        assert!(parse_json_response::<Reply>("no object at all").is_none());
    }

    #[test]
    fn test_truncate_utf8_respects_char_boundaries() {
        let text = "héllo wörld";
        let out = truncate_utf8(text, 2);
        assert!(out.starts_with('h'));
        assert!(out.contains("truncated"));
        assert_eq!(truncate_utf8("short", 100), "short");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
