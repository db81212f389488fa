pub mod project;
pub mod proxy;

pub use project::*;
pub use proxy::*;
