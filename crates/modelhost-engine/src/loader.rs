//! Load attempts with retries, exponential backoff and fallback synthesis.

use std::sync::Arc;
use std::time::Duration;

use modelhost_config::LoaderConfig;
use modelhost_types::{log_error, log_info, log_warn, LoadStage, ModelDescriptor};

use crate::source::{AcquireMode, ModelHandle, ModelSource, ProgressReporter};

/// Result of a successful load, real or substitute.
#[derive(Debug, Clone)]
pub struct LoadedArtifact {
    pub handle: ModelHandle,
    pub is_fallback: bool,
    pub memory_bytes: u64,
}

#[derive(Clone)]
pub struct Loader {
    source: Arc<dyn ModelSource>,
    config: LoaderConfig,
}

impl Loader {
    pub fn new(source: Arc<dyn ModelSource>, config: LoaderConfig) -> Self {
        Self { source, config }
    }

    /// Single-shot below the progressive threshold, chunked at or above it.
    pub fn acquire_mode(&self, descriptor: &ModelDescriptor) -> AcquireMode {
        if descriptor.footprint_bytes < self.config.progressive_threshold_bytes {
            AcquireMode::SingleShot
        } else {
            AcquireMode::Chunked {
                chunk_size_bytes: descriptor
                    .chunk_size_bytes
                    .unwrap_or(self.config.default_chunk_size_bytes),
            }
        }
    }

    /// Wait before retry `attempt` (1-based): `backoff_unit * 2^attempt`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config.backoff_unit().saturating_mul(factor)
    }

    /// Run one full load: the first attempt, up to `max_retries` retries,
    /// then the fallback if the descriptor has one.
    pub async fn load(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressReporter,
    ) -> Result<LoadedArtifact, String> {
        let mode = self.acquire_mode(descriptor);
        let attempts = self.config.max_retries + 1;
        let mut last_error = String::from("no attempt made");

        log_info!(
            "loader",
            "Loading {} ({} bytes, {:?})",
            descriptor.name,
            descriptor.footprint_bytes,
            mode
        );

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry_delay(attempt);
                log_warn!(
                    "loader",
                    "Retrying {} in {}s (retry {}/{})",
                    descriptor.name,
                    delay.as_secs(),
                    attempt,
                    self.config.max_retries
                );
                tokio::time::sleep(delay).await;
            }

            progress.stage(LoadStage::Downloading);
            match self.attempt(descriptor, mode, &progress).await {
                Ok(artifact) => return Ok(artifact),
                Err(e) => {
                    log_warn!(
                        "loader",
                        "Attempt {} of {} for {} failed: {}",
                        attempt + 1,
                        attempts,
                        descriptor.name,
                        e
                    );
                    last_error = e;
                }
            }
        }

        if let Some(strategy) = descriptor.fallback {
            log_warn!(
                "loader",
                "Giving up on {} after {} attempts, using {:?} fallback",
                descriptor.name,
                attempts,
                strategy
            );
            let handle = self.source.synthesize_fallback(descriptor, strategy);
            let memory_bytes = handle
                .measured_memory_bytes()
                .unwrap_or_else(|| strategy.estimated_bytes());
            return Ok(LoadedArtifact {
                handle,
                is_fallback: true,
                memory_bytes,
            });
        }

        log_error!(
            "loader",
            "Failed to load {} after {} attempts: {}",
            descriptor.name,
            attempts,
            last_error
        );
        Err(format!(
            "failed after {attempts} attempts: {last_error}"
        ))
    }

    async fn attempt(
        &self,
        descriptor: &ModelDescriptor,
        mode: AcquireMode,
        progress: &ProgressReporter,
    ) -> Result<LoadedArtifact, String> {
        let handle = self
            .source
            .acquire(descriptor, mode, progress.clone())
            .await?;

        progress.stage(LoadStage::Parsing);
        if handle.model_name() != descriptor.name {
            return Err(format!(
                "source returned a handle for {} instead of {}",
                handle.model_name(),
                descriptor.name
            ));
        }

        progress.stage(LoadStage::Initializing);
        let memory_bytes = handle
            .measured_memory_bytes()
            .unwrap_or(descriptor.required_memory_bytes);

        Ok(LoadedArtifact {
            handle,
            is_fallback: false,
            memory_bytes,
        })
    }
}
