//! Recovery of structured payloads from free-form model output.
//!
//! Models wrap JSON in code fences, precede it with prose, or get cut off
//! before the closing brackets. Each of those is handled here.

use serde_json::Value;

/// Pull the structured payload out of `text`.
///
/// Every opening bracket is tried in order, so bracketed prose such as
/// "section [3.2]" ahead of the real answer is skipped. The first span that
/// carries `key` (or is a list of objects) wins; failing that, the first
/// JSON object found.
pub fn extract_payload(text: &str, key: &str) -> Option<Value> {
    let stripped = strip_code_fences(text);
    let mut fallback = None;

    if let Ok(value) = serde_json::from_str::<Value>(&stripped) {
        if carries(&value, key) {
            return Some(value);
        }
        if value.is_object() {
            fallback = Some(value);
        }
    }

    let mut offset = 0;
    while let Some(pos) = stripped[offset..].find(['{', '[']) {
        let start = offset + pos;
        let candidate = &stripped[start..];
        let parsed = match matching_close(candidate) {
            // Outermost span that closes cleanly, ignoring trailing prose
            Some(end) => serde_json::from_str::<Value>(&candidate[..=end]).ok(),
            // Truncated output: close whatever is still open
            None => serde_json::from_str::<Value>(&balance_closers(candidate.trim_end())).ok(),
        };
        if let Some(value) = parsed {
            if carries(&value, key) {
                return Some(value);
            }
            if fallback.is_none() && value.is_object() {
                fallback = Some(value);
            }
        }
        offset = start + 1;
    }

    fallback
}

/// Whether `value` looks like the payload requested under `key`.
fn carries(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => map.get(key).is_some_and(Value::is_array),
        Value::Array(items) => !items.is_empty() && items.iter().all(Value::is_object),
        _ => false,
    }
}

/// The array under `key`, or the payload itself when it is a bare array.
pub fn payload_items<'a>(value: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get(key).and_then(Value::as_array),
        _ => None,
    }
}

/// String field lookup trying several aliases in order.
pub fn str_field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| item.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// List-of-strings field; a single string is split into lines.
pub fn str_list(item: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        match item.get(*key) {
            Some(Value::Array(values)) => {
                return values
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.trim().to_string()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            Some(Value::String(s)) => {
                return s
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => {}
        }
    }
    Vec::new()
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    // Try ```json ... ``` first
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Try ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Byte index of the bracket closing the one at position 0.
fn matching_close(text: &str) -> Option<usize> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (idx, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Append the closers for every bracket left open, innermost first.
fn balance_closers(text: &str) -> String {
    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }

    let mut result = text.trim_end_matches(',').to_string();
    if in_string {
        result.push('"');
    }
    while let Some(closer) = open.pop() {
        result.push(closer);
    }
    result
}
