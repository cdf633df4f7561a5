//! Boundary with whatever actually fetches and builds model weights.

use futures_util::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use modelhost_types::{FallbackStrategy, LoadStage, LoadState, ModelDescriptor};

/// A resident model as handed out to operations.
pub trait LoadedModel: Send + Sync + fmt::Debug {
    fn model_name(&self) -> &str;

    /// Actual resident size if the implementation can measure it.
    fn measured_memory_bytes(&self) -> Option<u64> {
        None
    }

    /// Lets operation runners downcast to the concrete handle type.
    fn as_any(&self) -> &dyn Any;
}

pub type ModelHandle = Arc<dyn LoadedModel>;

/// How the source should fetch the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    SingleShot,
    /// Fetch in chunks, calling `ProgressReporter::bytes_loaded` after each.
    Chunked { chunk_size_bytes: u64 },
}

/// Writes progress into the model's shared `LoadState`.
#[derive(Clone)]
pub struct ProgressReporter {
    state: Arc<watch::Sender<LoadState>>,
    total_bytes: u64,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("total_bytes", &self.total_bytes)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(state: Arc<watch::Sender<LoadState>>, total_bytes: u64) -> Self {
        Self { state, total_bytes }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Move to `stage`, resetting progress to the start of its band.
    pub fn stage(&self, next: LoadStage) {
        let (band_start, _) = next.progress_band();
        self.state.send_modify(|state| {
            if let LoadState::Loading {
                stage,
                progress,
                bytes_loaded,
                ..
            } = state
            {
                if next == LoadStage::Downloading {
                    *bytes_loaded = 0;
                }
                *stage = next;
                *progress = band_start;
            }
        });
    }

    /// Report cumulative bytes fetched during `Downloading`.
    pub fn bytes_loaded(&self, loaded: u64) {
        let total = self.total_bytes;
        let loaded = loaded.min(total);
        let (band_start, band_end) = LoadStage::Downloading.progress_band();
        let span = u64::from(band_end - band_start);
        let scaled = if total == 0 {
            span
        } else {
            loaded.saturating_mul(span) / total
        };
        self.state.send_modify(|state| {
            if let LoadState::Loading {
                stage: LoadStage::Downloading,
                progress,
                bytes_loaded,
                ..
            } = state
            {
                *bytes_loaded = loaded;
                *progress = band_start + scaled as u8;
            }
        });
    }
}

/// Supplies real model handles and degraded substitutes.
pub trait ModelSource: Send + Sync {
    /// Fetch and parse the weights for `descriptor`.
    fn acquire<'a>(
        &'a self,
        descriptor: &'a ModelDescriptor,
        mode: AcquireMode,
        progress: ProgressReporter,
    ) -> BoxFuture<'a, Result<ModelHandle, String>>;

    /// Cheap substitute used once retries are exhausted. Must not fail.
    fn synthesize_fallback(
        &self,
        descriptor: &ModelDescriptor,
        strategy: FallbackStrategy,
    ) -> ModelHandle {
        Arc::new(SyntheticModel::new(descriptor, strategy))
    }
}

/// Default fallback handle: remembers which strategy it stands in for.
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    name: String,
    strategy: FallbackStrategy,
}

impl SyntheticModel {
    pub fn new(descriptor: &ModelDescriptor, strategy: FallbackStrategy) -> Self {
        Self {
            name: descriptor.name.clone(),
            strategy,
        }
    }

    pub fn strategy(&self) -> FallbackStrategy {
        self.strategy
    }
}

impl LoadedModel for SyntheticModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn measured_memory_bytes(&self) -> Option<u64> {
        Some(self.strategy.estimated_bytes())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
