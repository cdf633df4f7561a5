use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage of a single load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStage {
    Downloading,
    Parsing,
    Initializing,
}

impl LoadStage {
    /// Progress band (start, end) each stage maps onto within 0-100.
    pub fn progress_band(self) -> (u8, u8) {
        match self {
            LoadStage::Downloading => (0, 70),
            LoadStage::Parsing => (70, 90),
            LoadStage::Initializing => (90, 100),
        }
    }
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStage::Downloading => write!(f, "downloading"),
            LoadStage::Parsing => write!(f, "parsing"),
            LoadStage::Initializing => write!(f, "initializing"),
        }
    }
}

/// Per-model load state, shared by every observer of that model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadState {
    NotLoaded,
    Loading {
        stage: LoadStage,
        progress: u8,
        bytes_loaded: u64,
        total_bytes: u64,
        started_at: DateTime<Utc>,
    },
    Ready,
    Failed {
        reason: String,
    },
}

impl LoadState {
    pub fn loading(total_bytes: u64) -> Self {
        LoadState::Loading {
            stage: LoadStage::Downloading,
            progress: 0,
            bytes_loaded: 0,
            total_bytes,
            started_at: Utc::now(),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading { .. })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LoadState::Ready)
    }

    pub fn progress(&self) -> u8 {
        match self {
            LoadState::Loading { progress, .. } => *progress,
            LoadState::Ready => 100,
            LoadState::NotLoaded | LoadState::Failed { .. } => 0,
        }
    }
}
