pub mod error;
pub mod event;
pub mod intent;
pub mod lane;
pub mod plan;
pub mod policy;
pub mod task;
pub mod triage;

pub use error::*;
pub use event::*;
pub use intent::*;
pub use lane::*;
pub use plan::*;
pub use policy::*;
pub use task::*;
pub use triage::*;
