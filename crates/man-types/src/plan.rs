use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ManError, ManErrorKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub tool: String,
    pub input: BTreeMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub compensation: Option<String>,
    /// Values of the form `"{result.FIELD}"` are substituted from the step's
    /// own tool result at rollback time; any other string passes through.
    #[serde(default)]
    pub compensation_input: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validate that `depends_on` references exist within the plan and that
    /// the dependency graph is acyclic. Returns the missing/cyclic step id on
    /// failure.
    pub fn validate(&self) -> Result<(), ManError> {
        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(ManError::new(
                        ManErrorKind::DagCycleOrMissingDependency,
                        false,
                        format!("step '{}' depends on unknown step '{}'", step.id, dep),
                    ));
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            in_degree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.depends_on {
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(&step.id);
            }
        }

        let mut frontier: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = frontier.pop() {
            visited += 1;
            if let Some(deps) = dependents.get(id) {
                for d in deps {
                    let entry = in_degree.get_mut(d).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        frontier.push(d);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(ManError::new(
                ManErrorKind::DagCycleOrMissingDependency,
                false,
                "plan contains a dependency cycle".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            tool: "noop".to_string(),
            input: BTreeMap::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            compensation: None,
            compensation_input: BTreeMap::new(),
        }
    }

    #[test]
    fn detects_missing_dependency() {
        let plan = Plan {
            id: "p1".to_string(),
            steps: vec![step("a", &["ghost"])],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn detects_cycle() {
        let plan = Plan {
            id: "p1".to_string(),
            steps: vec![step("a", &["b"]), step("b", &["a"])],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn accepts_valid_dag() {
        let plan = Plan {
            id: "p1".to_string(),
            steps: vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])],
        };
        assert!(plan.validate().is_ok());
    }
}
