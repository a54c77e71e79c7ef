use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds named by what they mean to the coordinator, not by the Rust
/// type that carries them (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManErrorKind {
    PolicyBlocked,
    Denied,
    Cancelled,
    BacklogOverloaded,
    DecisionExpired,
    DagCycleOrMissingDependency,
    ToolTransientFailure,
    ToolFatal,
    CompensationFailed,
    StoreTransient,
}

impl ManErrorKind {
    /// Whether the durable executor should retry an activity raising this
    /// error, per the retry policy in spec.md §5/§7.
    pub fn retryable_by_default(self) -> bool {
        matches!(self, ManErrorKind::ToolTransientFailure | ManErrorKind::StoreTransient)
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[error("{kind:?}: {details}")]
pub struct ManError {
    pub kind: ManErrorKind,
    pub retryable: bool,
    pub details: String,
}

impl ManError {
    pub fn new(kind: ManErrorKind, retryable: bool, details: impl Into<String>) -> Self {
        Self {
            kind,
            retryable,
            details: details.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.retryable
    }
}
