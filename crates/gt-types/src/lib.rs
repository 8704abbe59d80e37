pub mod config;
pub mod errors;
pub mod job;
pub mod registry;

pub use config::*;
pub use errors::*;
pub use job::*;
pub use registry::*;
