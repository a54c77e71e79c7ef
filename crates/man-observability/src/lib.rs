pub mod logging;
pub mod omnitrace;

pub use logging::*;
pub use omnitrace::*;
