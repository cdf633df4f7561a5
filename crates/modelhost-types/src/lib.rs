//! Shared types for the model host: descriptors, load states, jobs and errors.

pub mod credit;
pub mod descriptor;
pub mod error;
pub mod job;
pub mod load_state;
pub mod logger;
pub mod memory;

pub use credit::*;
pub use descriptor::*;
pub use error::*;
pub use job::*;
pub use load_state::*;
pub use memory::*;

// Re-exported so the logging macros resolve `log` from any crate.
#[doc(hidden)]
pub use log as __log;

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;
