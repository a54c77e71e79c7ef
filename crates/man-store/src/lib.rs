pub mod decision_events;
pub mod policies;
pub mod store;
pub mod tasks;

pub use decision_events::{list_decision_events, record_decision_event, DecisionEventRecord};
pub use policies::{list_policy_rows, upsert_with_audit, StoreBackedPolicySource};
pub use store::*;
pub use tasks::*;
