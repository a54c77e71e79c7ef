use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key substrings that, when found (case-insensitively) in a `tool_params` key,
/// cause the value to be replaced by `"[REDACTED]"` on ingestion. The original
/// value is never read further by the core once this runs.
const REDACTED_KEY_SUBSTRINGS: &[&str] =
    &["password", "token", "secret", "key", "api_key", "auth"];

const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

/// Recognized flags influencing risk triage. Unknown flags are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentFlags {
    #[serde(default)]
    pub irreversible: bool,
    #[serde(default)]
    pub contains_sensitive_data: bool,
    #[serde(default)]
    pub affects_rights: bool,
}

/// The input to the risk gate: a proposed tool call, prior to execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionIntent {
    pub tenant_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub step_id: String,
    pub tool_name: String,
    pub tool_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub flags: IntentFlags,
}

impl ActionIntent {
    /// Build an intent, redacting sensitive `tool_params` keys on ingestion.
    pub fn new(
        tenant_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_params: BTreeMap<String, Value>,
        flags: IntentFlags,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            step_id: step_id.into(),
            tool_name: tool_name.into(),
            tool_params: redact_params(tool_params),
            flags,
        }
    }
}

fn is_redacted_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    REDACTED_KEY_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Project any `tool_params` key matching the redacted-key vocabulary to the
/// literal `"[REDACTED]"`. Pure; called once at intent construction time.
pub fn redact_params(params: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    params
        .into_iter()
        .map(|(k, v)| {
            if is_redacted_key(&k) {
                (k, Value::String(REDACTED_PLACEHOLDER.to_string()))
            } else {
                (k, v)
            }
        })
        .collect()
}
