use crate::types::{CodeModeRequest, FileBuffer, SessionId};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Order-independent hash of a file set's shape: each file contributes its
/// path and content length, never its content.
pub fn file_set_fingerprint(files: &[FileBuffer]) -> String {
    let mut pairs: Vec<String> = files
        .iter()
        .map(|file| format!("{}:{}", file.path, file.content.len()))
        .collect();
    pairs.sort();
    hash_str(&pairs.join("|"))
}

/// Dedup key over the session, the request type and every request field.
pub fn request_key(session_id: &SessionId, request: &CodeModeRequest) -> String {
    let payload = serde_json::to_value(request)
        .map(|value| normalize_json(&value))
        .and_then(|value| serde_json::to_string(&value))
        .unwrap_or_default();
    hash_str(&format!("{}|{}|{}", session_id, request.kind(), payload))
}

/// Dedup key for a free-text task.
pub fn task_key(
    session_id: &SessionId,
    task: &str,
    rules: Option<&str>,
    selected_files: Option<&[String]>,
) -> String {
    let mut selected: Vec<&str> = selected_files
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();
    selected.sort_unstable();
    let payload = serde_json::json!({
        "task": task,
        "rules": rules,
        "selected_files": selected,
    });
    hash_str(&format!("{session_id}|execute_code_task|{payload}"))
}

fn normalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut ordered = BTreeMap::new();
            for (key, value) in map {
                ordered.insert(key.clone(), normalize_json(value));
            }
            Value::Object(ordered.into_iter().collect())
        }
        Value::Array(values) => Value::Array(values.iter().map(normalize_json).collect()),
        other => other.clone(),
    }
}

fn hash_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
