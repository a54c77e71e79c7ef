//! Canonical JSON, content hashing, redaction and truncation for audit and
//! notification payloads. Grounded on `original_source/orchestrator/observability/omnitrace.py`.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Maximum payload size before truncation (32 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;
const MAX_SAFE_STRING_LENGTH: usize = 20;
const LARGE_NUMBER_THRESHOLD: f64 = 10_000.0;
const MAX_REDACT_DEPTH: usize = 10;

const ALLOWLIST_KEYS: &[&str] = &[
    "id",
    "workflow_id",
    "run_id",
    "step",
    "step_id",
    "event_type",
    "timestamp",
    "status",
    "retry_count",
    "attempt",
    "version",
    "type",
    "name",
    "action",
    "lane",
    "result",
    "success",
    "error_code",
    "duration_ms",
];

const DROPLIST_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "auth",
    "authorization",
    "credential",
    "private_key",
    "privatekey",
    "access_token",
    "refresh_token",
    "session",
    "cookie",
];

const SENSITIVE_PATTERNS: &[&str] = &[
    "email",
    "phone",
    "address",
    "ssn",
    "social_security",
    "credit_card",
    "card_number",
    "cvv",
    "pin",
    "account_number",
    "routing_number",
    "bank",
    "salary",
    "income",
    "dob",
    "birth",
    "passport",
    "license",
    "user_",
    "customer_",
    "client_",
    "personal_",
];

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^@\s]+@[^@\s]+\.[^@\s]+").unwrap())
}

/// Deterministic JSON representation: sorted keys, no extraneous whitespace.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sort_value(value)).expect("Value serialization cannot fail")
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// Lowercase hex prefix of SHA-256 of `canonical_json(value)`.
pub fn compute_hash(value: &Value, length: usize) -> String {
    let canonical = canonical_json(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let full = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    full.chars().take(length).collect()
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    if DROPLIST_KEYS.contains(&lower.as_str()) {
        return true;
    }
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

fn is_allowlisted_key(key: &str) -> bool {
    ALLOWLIST_KEYS.contains(&key.to_lowercase().as_str())
}

fn should_redact_value(value: &Value) -> bool {
    match value {
        Value::String(s) => s.len() > MAX_SAFE_STRING_LENGTH || email_regex().is_match(s),
        Value::Number(n) => n
            .as_f64()
            .map(|f| f.abs() > LARGE_NUMBER_THRESHOLD)
            .unwrap_or(false),
        _ => false,
    }
}

fn redacted_marker(value: &Value) -> Value {
    Value::String(format!("<redacted:{}>", compute_hash(value, 16)))
}

/// Recursive PII-safe projection. Allowlisted keys are preserved verbatim
/// (recursing into nested objects); droplisted/sensitive-pattern keys are
/// replaced by a content hash marker; everything else recurses, with long
/// strings, emails and large numbers redacted by value.
pub fn redact(value: &Value) -> Value {
    redact_depth(value, 0)
}

fn redact_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_REDACT_DEPTH {
        let mut truncated = Map::new();
        truncated.insert(
            "<truncated>".to_string(),
            Value::String("max depth exceeded".to_string()),
        );
        return Value::Object(truncated);
    }

    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                if is_allowlisted_key(key) {
                    out.insert(key.clone(), redact_depth(val, depth + 1));
                    continue;
                }
                if is_sensitive_key(key) {
                    out.insert(key.clone(), redacted_marker(val));
                    continue;
                }
                match val {
                    Value::Object(_) => {
                        out.insert(key.clone(), redact_depth(val, depth + 1));
                    }
                    Value::Array(items) => {
                        let mapped = items
                            .iter()
                            .map(|item| match item {
                                Value::Object(_) => redact_depth(item, depth + 1),
                                _ if should_redact_value(item) => redacted_marker(item),
                                _ => item.clone(),
                            })
                            .collect();
                        out.insert(key.clone(), Value::Array(mapped));
                    }
                    _ if should_redact_value(val) => {
                        out.insert(key.clone(), redacted_marker(val));
                    }
                    _ => {
                        out.insert(key.clone(), val.clone());
                    }
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Truncate a payload if its canonical JSON exceeds `max_size` bytes,
/// preserving the well-known essential keys.
pub fn truncate(payload: &Value, max_size: usize) -> Value {
    let serialized = canonical_json(payload);
    if serialized.len() <= max_size {
        return payload.clone();
    }

    const ESSENTIAL_KEYS: &[&str] = &["workflow_id", "id", "event_type", "timestamp", "status"];
    let mut out = Map::new();
    if let Value::Object(map) = payload {
        for key in ESSENTIAL_KEYS {
            if let Some(v) = map.get(*key) {
                out.insert((*key).to_string(), v.clone());
            }
        }
    }
    out.insert("<truncated>".to_string(), Value::Bool(true));
    out.insert(
        "original_size".to_string(),
        Value::Number(serialized.len().into()),
    );
    Value::Object(out)
}

/// `"<event_type>:<workflow_id[0:8]>:<hash[0:8]>"` used for tracing correlation.
pub fn event_key(
    workflow_id: &str,
    event_type: &str,
    step: Option<&str>,
    retry_count: u32,
    timestamp: Option<&str>,
) -> String {
    let mut components = vec![workflow_id.to_string(), event_type.to_string()];
    if let Some(step) = step {
        components.push(step.to_string());
    }
    components.push(retry_count.to_string());
    if let Some(ts) = timestamp {
        components.push(ts.to_string());
    }
    let key_data = components.join(":");
    let hash = compute_hash(&Value::String(key_data), 8);
    let wf_prefix: String = workflow_id.chars().take(8).collect();
    format!("{event_type}:{wf_prefix}:{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(canonical_json(&v), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn compute_hash_is_deterministic() {
        let v = json!({"a": 1});
        assert_eq!(compute_hash(&v, 16), compute_hash(&v, 16));
    }

    #[test]
    fn compute_hash_respects_length() {
        let v = json!("x");
        assert_eq!(compute_hash(&v, 8).len(), 8);
    }

    #[test]
    fn redact_preserves_allowlisted_keys() {
        let v = json!({"workflow_id": "wf-1234567890123456789", "password": "hunter2"});
        let redacted = redact(&v);
        assert_eq!(
            redacted["workflow_id"],
            json!("wf-1234567890123456789")
        );
        assert_ne!(redacted["password"], json!("hunter2"));
        assert!(redacted["password"]
            .as_str()
            .unwrap()
            .starts_with("<redacted:"));
    }

    #[test]
    fn redact_drops_long_unknown_strings() {
        let v = json!({"notes": "this is a very long note exceeding twenty chars"});
        let redacted = redact(&v);
        assert!(redacted["notes"]
            .as_str()
            .unwrap()
            .starts_with("<redacted:"));
    }

    #[test]
    fn redact_leaves_short_unknown_strings() {
        let v = json!({"table": "users"});
        assert_eq!(redact(&v)["table"], json!("users"));
    }

    #[test]
    fn truncate_passes_through_small_payloads() {
        let v = json!({"id": "1"});
        assert_eq!(truncate(&v, MAX_PAYLOAD_SIZE), v);
    }

    #[test]
    fn truncate_keeps_essential_keys_only_when_oversized() {
        let big = "x".repeat(MAX_PAYLOAD_SIZE + 1);
        let v = json!({"workflow_id": "wf1", "id": "t1", "junk": big});
        let truncated = truncate(&v, MAX_PAYLOAD_SIZE);
        assert_eq!(truncated["workflow_id"], json!("wf1"));
        assert_eq!(truncated["<truncated>"], json!(true));
        assert!(truncated.get("junk").is_none());
    }

    #[test]
    fn event_key_has_expected_shape() {
        let key = event_key("workflow-123456", "tool_call", Some("s1"), 0, None);
        assert!(key.starts_with("tool_call:workflow:"));
    }
}
