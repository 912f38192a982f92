use serde::de::DeserializeOwned;

/// Robustly extracts and parses JSON from an LLM response.
/// Handles: Markdown code blocks, conversational intro/outro, and brace-counting for nested JSON.
pub fn extract_json<T: DeserializeOwned>(response: &str) -> Result<T, String> {
    let trimmed = response.trim();

    // Stage 1: Try direct parse (ideal case - pure JSON response)
    if let Ok(parsed) = serde_json::from_str::<T>(trimmed) {
        return Ok(parsed);
    }

    // Stage 2: Remove markdown code blocks if present
    let cleaned = remove_markdown_blocks(trimmed);
    if let Ok(parsed) = serde_json::from_str::<T>(&cleaned) {
        return Ok(parsed);
    }

    // Stage 3: Use brace-counting to find outermost { } pair
    if let Some(json_str) = find_json_object(&cleaned) {
        if let Ok(parsed) = serde_json::from_str::<T>(json_str) {
            return Ok(parsed);
        }
    }

    // Stage 4: Try finding JSON in the original response (in case markdown removal broke something)
    if let Some(json_str) = find_json_object(trimmed) {
        if let Ok(parsed) = serde_json::from_str::<T>(json_str) {
            return Ok(parsed);
        }
    }

    Err(format!(
        "no valid JSON object in model response. Preview: {}...",
        preview(trimmed, 200)
    ))
}

/// Extract the first JSON object from a response as an untyped map
pub fn extract_object(response: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    match extract_json::<serde_json::Value>(response)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(format!(
            "expected a JSON object, got {}",
            preview(&other.to_string(), 80)
        )),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Remove markdown code blocks (```json ... ``` or ``` ... ```)
fn remove_markdown_blocks(text: &str) -> String {
    // Fenced block somewhere in the middle of prose
    if let Some(start) = text.find("```") {
        let after_fence = &text[start + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_string();
        }
        return body.trim().to_string();
    }
    text.trim().to_string()
}

/// Find the outermost JSON object using brace counting.
/// Braces inside string literals are ignored.
fn find_json_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start_idx: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
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
            '"' if start_idx.is_some() => in_string = true,
            '{' => {
                if depth == 0 {
                    start_idx = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = start_idx {
                        return Some(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestPlan {
        notes: String,
        operations: Vec<TestOp>,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestOp {
        op: String,
        path: Option<String>,
    }

    #[test]
    fn test_pure_json() {
        let input = r#"{"notes": "test", "operations": []}"#;
        let result: TestPlan = extract_json(input).unwrap();
        assert_eq!(result.notes, "test");
    }

    #[test]
    fn test_markdown_code_block() {
        let input = r#"```json
{"notes": "test", "operations": []}
```"#;
        let result: TestPlan = extract_json(input).unwrap();
        assert_eq!(result.notes, "test");
    }

    #[test]
    fn test_fenced_block_inside_prose() {
        let input = "Sure! Here you go:\n```json\n{\"notes\": \"x\", \"operations\": []}\n```\nLet me know.";
        let result: TestPlan = extract_json(input).unwrap();
        assert_eq!(result.notes, "x");
    }

    #[test]
    fn test_json_with_text_before() {
        let input = r#"Here is the plan:
{"notes": "test", "operations": []}"#;
        let result: TestPlan = extract_json(input).unwrap();
        assert_eq!(result.notes, "test");
    }

    #[test]
    fn test_nested_json() {
        let input = r#"{"notes": "nested", "operations": [{"op": "delete", "path": "/test"}]}"#;
        let result: TestPlan = extract_json(input).unwrap();
        assert_eq!(result.operations.len(), 1);
        assert_eq!(result.operations[0].op, "delete");
    }

    #[test]
    fn test_braces_inside_strings() {
        let input = r#"ok: {"notes": "use } carefully {", "operations": [{"op": "create_file", "path": "a}.txt"}]} done"#;
        let result: TestPlan = extract_json(input).unwrap();
        assert_eq!(result.operations[0].path.as_deref(), Some("a}.txt"));
    }

    #[test]
    fn test_no_object() {
        assert!(extract_object("I cannot help with that.").is_err());
        assert!(extract_object("[1, 2, 3]").is_err());
    }
}
