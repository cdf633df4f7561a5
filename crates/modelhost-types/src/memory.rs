use serde::{Deserialize, Serialize};

/// Snapshot returned by `get_memory_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub ceiling_bytes: u64,
    pub resident_count: usize,
    pub largest_model: Option<String>,
    pub above_warning: bool,
}
