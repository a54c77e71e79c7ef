use serde::{Deserialize, Serialize};

/// Risk classification lane. Ordered `GREEN < YELLOW < RED < BLOCKED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManLane {
    Green,
    Yellow,
    Red,
    Blocked,
}

impl ManLane {
    /// Promote `self` to `other` if `other` is strictly higher on the lane order.
    pub fn promote(self, other: ManLane) -> ManLane {
        self.max(other)
    }
}
