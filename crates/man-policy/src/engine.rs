//! The Policy Engine (spec.md §4.1): a pure, deterministic `triage` function
//! classifying an `ActionIntent` into a `ManLane`. Grounded on
//! `original_source/orchestrator/policies/man_policy.py` for the dimension
//! weights and short-circuit order.

use man_types::{ActionIntent, ManLane, ManPolicy, RiskTriageResult};

/// Fixed subjective-language vocabulary (spec.md §4.1 step 2). Order is the
/// scan order, not significant to the result (the dimension counts distinct
/// matches, it does not report which ones matched).
const SUBJECTIVE_VOCABULARY: &[&str] = &[
    "exception",
    "vulnerability",
    "risk",
    "danger",
    "warning",
    "critical",
    "emergency",
    "urgent",
    "suspicious",
    "anomaly",
];

fn hard_trigger_reason() -> RiskTriageResult {
    RiskTriageResult::new(ManLane::Red, 1.0, vec!["Hard trigger activated".to_string()])
}

fn hard_triggers_fire(intent: &ActionIntent, policy: &ManPolicy, workflow_key: Option<&str>) -> bool {
    if policy.hard_triggers.tools.contains(&intent.tool_name) {
        return true;
    }
    if let Some(key) = workflow_key {
        if policy.hard_triggers.workflows.contains(key) {
            return true;
        }
    }
    for (key, value) in &intent.tool_params {
        let Some(forbidden) = policy.hard_triggers.params.get(key) else {
            continue;
        };
        let value_str = match value {
            serde_json::Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        if forbidden.iter().any(|needle| value_str.contains(&needle.to_lowercase())) {
            return true;
        }
    }
    false
}

/// Count distinct vocabulary words present at least once in `haystack`
/// (already lower-cased). This is occurrence-of-distinct-words, not a raw
/// term count: "risk risk risk" contributes the same as one "risk".
fn subjective_language_score(haystack: &str) -> (f64, bool) {
    let count = SUBJECTIVE_VOCABULARY.iter().filter(|w| haystack.contains(*w)).count();
    ((count as f64 * 0.20).min(1.0), count > 0)
}

fn missing_fields_score(intent: &ActionIntent) -> f64 {
    let mut score = 0.0;
    if intent.tool_params.is_empty() {
        score += 0.30;
    }
    if intent.step_id.is_empty() {
        score += 0.20;
    }
    score.min(1.0)
}

fn format_reason(name: &str, score: f64) -> String {
    format!("{name}: {score:.2}")
}

/// Deterministic risk classification. Equal `(intent, policy, workflow_key,
/// free_text_signals)` always produce byte-equal `RiskTriageResult`s
/// (spec.md invariant 1).
pub fn triage(
    intent: &ActionIntent,
    policy: &ManPolicy,
    workflow_key: Option<&str>,
    free_text_signals: &[String],
) -> RiskTriageResult {
    if hard_triggers_fire(intent, policy, workflow_key) {
        return hard_trigger_reason();
    }

    let mut reasons = Vec::new();
    let mut score: f64 = 0.0;

    if intent.flags.affects_rights {
        reasons.push(format_reason("affects_rights", 1.00));
        score = score.max(1.00);
    }
    if intent.flags.contains_sensitive_data {
        reasons.push(format_reason("contains_sensitive_data", 0.90));
        score = score.max(0.90);
    }
    if intent.flags.irreversible {
        reasons.push(format_reason("irreversible", 0.80));
        score = score.max(0.80);
    }

    let mut haystack = free_text_signals.join(" ").to_lowercase();
    for value in intent.tool_params.values() {
        haystack.push(' ');
        haystack.push_str(&value.to_string().to_lowercase());
    }
    let (subjective_score, subjective_hit) = subjective_language_score(&haystack);
    if subjective_hit {
        reasons.push(format_reason("subjective_language", subjective_score));
        score = score.max(subjective_score);
    }

    let missing_score = missing_fields_score(intent);
    if missing_score > 0.0 {
        reasons.push(format_reason("missing_fields", missing_score));
        score = score.max(missing_score);
    }

    if let Some(minimum) = policy.tool_minimum_lane(&intent.tool_name, workflow_key) {
        reasons.push(format!(
            "Tool {} requires minimum {}",
            intent.tool_name,
            lane_label(minimum)
        ));
        match minimum {
            ManLane::Blocked => {
                return RiskTriageResult::new(ManLane::Blocked, score.max(1.0), reasons);
            }
            ManLane::Red => {
                score = score.max(0.80);
                return RiskTriageResult::new(ManLane::Red, score, reasons);
            }
            ManLane::Yellow => {
                if score < 0.50 {
                    score = 0.50;
                }
            }
            ManLane::Green => {}
        }

        let thresholds = policy.effective_thresholds(workflow_key);
        let mut lane = lane_for_score(score, &thresholds);
        lane = lane.promote(minimum);
        return RiskTriageResult::new(lane, score, reasons);
    }

    let thresholds = policy.effective_thresholds(workflow_key);
    let lane = lane_for_score(score, &thresholds);
    RiskTriageResult::new(lane, score, reasons)
}

fn lane_label(lane: ManLane) -> &'static str {
    match lane {
        ManLane::Green => "GREEN",
        ManLane::Yellow => "YELLOW",
        ManLane::Red => "RED",
        ManLane::Blocked => "BLOCKED",
    }
}

fn lane_for_score(score: f64, thresholds: &man_types::GlobalThresholds) -> ManLane {
    if score >= thresholds.red {
        ManLane::Red
    } else if score >= thresholds.yellow {
        ManLane::Yellow
    } else {
        ManLane::Green
    }
}
