//! Model memory manager: catalog, memory budget, eviction, loading and the
//! resident-model cache that ties them together.

pub mod budget;
pub mod cache;
pub mod evictor;
pub mod loader;
pub mod registry;
pub mod source;

pub use budget::MemoryBudget;
pub use cache::{CacheEntry, ModelCache, ModelLease};
pub use evictor::{EvictionCandidate, Evictor};
pub use loader::{LoadedArtifact, Loader};
pub use registry::ModelRegistry;
pub use source::{AcquireMode, LoadedModel, ModelHandle, ModelSource, ProgressReporter, SyntheticModel};
