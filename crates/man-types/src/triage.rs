use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::lane::ManLane;

/// Result of a deterministic risk assessment. Equal inputs to the policy
/// engine must byte-equal-produce this (same lane, same score, same reasons
/// in the same order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskTriageResult {
    pub lane: ManLane,
    pub risk_score: f64,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RiskTriageResult {
    pub fn new(lane: ManLane, risk_score: f64, reasons: Vec<String>) -> Self {
        Self {
            lane,
            risk_score,
            reasons,
            metadata: Map::new(),
        }
    }
}
