use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::lane::ManLane;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalThresholds {
    pub red: f64,
    pub yellow: f64,
}

impl Default for GlobalThresholds {
    fn default() -> Self {
        Self {
            red: 0.8,
            yellow: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardTriggers {
    #[serde(default)]
    pub tools: BTreeSet<String>,
    #[serde(default)]
    pub params: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub workflows: BTreeSet<String>,
}

/// Partial policy applied on top of the global policy for a specific
/// `(tenant, workflow)` key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOverride {
    #[serde(default)]
    pub thresholds: Option<GlobalThresholds>,
    #[serde(default)]
    pub tool_minimum_lanes: HashMap<String, ManLane>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradeBehavior {
    BlockNew,
    ForcePause,
    AutoDeny,
}

impl Default for DegradeBehavior {
    fn default() -> Self {
        DegradeBehavior::BlockNew
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManPolicy {
    #[serde(default)]
    pub global_thresholds: GlobalThresholds,
    #[serde(default)]
    pub tool_minimum_lanes: HashMap<String, ManLane>,
    #[serde(default)]
    pub hard_triggers: HardTriggers,
    #[serde(default)]
    pub per_workflow_overrides: HashMap<String, WorkflowOverride>,
    #[serde(default = "default_max_pending")]
    pub max_pending_per_tenant: u32,
    #[serde(default = "default_ttl_minutes")]
    pub task_ttl_minutes: u32,
    #[serde(default)]
    pub degrade_behavior: DegradeBehavior,
}

fn default_max_pending() -> u32 {
    50
}

fn default_ttl_minutes() -> u32 {
    1440
}

impl Default for ManPolicy {
    fn default() -> Self {
        Self {
            global_thresholds: GlobalThresholds::default(),
            tool_minimum_lanes: HashMap::new(),
            hard_triggers: HardTriggers::default(),
            per_workflow_overrides: HashMap::new(),
            max_pending_per_tenant: default_max_pending(),
            task_ttl_minutes: default_ttl_minutes(),
            degrade_behavior: DegradeBehavior::default(),
        }
    }
}

impl ManPolicy {
    /// `yellow <= red` invariant; callers should not persist a policy that
    /// violates this.
    pub fn thresholds_valid(&self) -> bool {
        self.global_thresholds.yellow <= self.global_thresholds.red
    }

    /// Effective thresholds for `workflow_key`, with the per-workflow override
    /// merged over the global thresholds.
    pub fn effective_thresholds(&self, workflow_key: Option<&str>) -> GlobalThresholds {
        workflow_key
            .and_then(|key| self.per_workflow_overrides.get(key))
            .and_then(|o| o.thresholds.clone())
            .unwrap_or_else(|| self.global_thresholds.clone())
    }

    /// Minimum lane for `tool_name`, preferring the workflow override over
    /// the global mapping.
    pub fn tool_minimum_lane(&self, tool_name: &str, workflow_key: Option<&str>) -> Option<ManLane> {
        if let Some(key) = workflow_key {
            if let Some(over) = self.per_workflow_overrides.get(key) {
                if let Some(lane) = over.tool_minimum_lanes.get(tool_name) {
                    return Some(*lane);
                }
            }
        }
        self.tool_minimum_lanes.get(tool_name).copied()
    }

    pub fn task_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.task_ttl_minutes as i64)
    }
}
