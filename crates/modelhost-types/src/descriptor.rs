use serde::{Deserialize, Serialize};
use std::fmt;

use crate::MB;

/// Eviction tier of a model. `High` entries are never evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn is_evictable(self) -> bool {
        self != Priority::High
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// What kind of media a model works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Image,
    Audio,
    Video,
    Text,
}

/// Degraded stand-in used when real acquisition keeps failing.
///
/// Picked once per model when the registry is built, never inferred from
/// the model name at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Returns the input image untouched.
    IdentityImage,
    /// Produces silence of the requested length.
    SilentAudio,
    /// Repeats the nearest source frame.
    FrameRepeat,
    /// Echoes the prompt back.
    EchoText,
}

impl FallbackStrategy {
    pub fn for_category(category: ModelCategory) -> Self {
        match category {
            ModelCategory::Image => FallbackStrategy::IdentityImage,
            ModelCategory::Audio => FallbackStrategy::SilentAudio,
            ModelCategory::Video => FallbackStrategy::FrameRepeat,
            ModelCategory::Text => FallbackStrategy::EchoText,
        }
    }

    /// Rough resident size of the substitute when the handle cannot measure itself.
    pub fn estimated_bytes(self) -> u64 {
        match self {
            FallbackStrategy::IdentityImage => MB,
            FallbackStrategy::SilentAudio => MB / 4,
            FallbackStrategy::FrameRepeat => 8 * MB,
            FallbackStrategy::EchoText => MB / 16,
        }
    }
}

/// Immutable catalog entry for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub category: ModelCategory,
    pub footprint_bytes: u64,
    pub priority: Priority,
    pub required_memory_bytes: u64,
    pub max_concurrent_users: u32,
    pub fallback: Option<FallbackStrategy>,
    /// Chunk size for progressive loading; the loader default applies when unset.
    pub chunk_size_bytes: Option<u64>,
}

impl ModelDescriptor {
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}
