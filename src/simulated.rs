// Simulated model source and operation runner.
// Stand-ins for real weight storage and inference so the host can be driven
// end to end from the CLI and in tests.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use modelhost_engine::{
    AcquireMode, LoadedModel, ModelHandle, ModelLease, ModelSource, ProgressReporter,
    SyntheticModel,
};
use modelhost_queue::{JobProgress, OperationRunner};
use modelhost_types::{log_debug, JobKind, ModelDescriptor};

#[derive(Debug)]
pub struct SimulatedModel {
    name: String,
    bytes: u64,
}

impl LoadedModel for SimulatedModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn measured_memory_bytes(&self) -> Option<u64> {
        Some(self.bytes)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Pretends to fetch weights, taking `latency` per chunk (or once for a
/// single-shot acquisition). Models registered with `failing` fail that
/// many attempts before succeeding; `u32::MAX` means never.
pub struct SimulatedSource {
    latency: Duration,
    failures: Mutex<HashMap<String, u32>>,
    acquisitions: AtomicU32,
}

impl SimulatedSource {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            failures: Mutex::new(HashMap::new()),
            acquisitions: AtomicU32::new(0),
        }
    }

    pub fn failing(self, model: &str, attempts: u32) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(model.to_string(), attempts);
        self
    }

    /// Total `acquire` calls so far, failed ones included.
    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    fn should_fail(&self, model: &str) -> bool {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match failures.get_mut(model) {
            Some(&mut 0) | None => false,
            Some(&mut u32::MAX) => true,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
        }
    }
}

impl ModelSource for SimulatedSource {
    fn acquire<'a>(
        &'a self,
        descriptor: &'a ModelDescriptor,
        mode: AcquireMode,
        progress: ProgressReporter,
    ) -> BoxFuture<'a, Result<ModelHandle, String>> {
        async move {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            match mode {
                AcquireMode::SingleShot => tokio::time::sleep(self.latency).await,
                AcquireMode::Chunked { chunk_size_bytes } => {
                    let total = progress.total_bytes();
                    let mut loaded = 0;
                    while loaded < total {
                        tokio::time::sleep(self.latency).await;
                        loaded = loaded.saturating_add(chunk_size_bytes).min(total);
                        progress.bytes_loaded(loaded);
                    }
                }
            }

            if self.should_fail(&descriptor.name) {
                return Err(format!("simulated fetch error for {}", descriptor.name));
            }
            log_debug!("simulated", "Acquired {}", descriptor.name);
            Ok(Arc::new(SimulatedModel {
                name: descriptor.name.clone(),
                bytes: descriptor.required_memory_bytes,
            }) as ModelHandle)
        }
        .boxed()
    }
}

/// Echoes its input after `latency`, reporting progress in quarters.
/// An input object with a `"fail"` string fails with that message.
pub struct SimulatedRunner {
    latency: Duration,
}

impl SimulatedRunner {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl OperationRunner for SimulatedRunner {
    fn run<'a>(
        &'a self,
        kind: &'a JobKind,
        model: &'a ModelLease,
        input: Value,
        progress: JobProgress,
    ) -> BoxFuture<'a, Result<Value, String>> {
        async move {
            let step = self.latency / 4;
            for percent in [25, 50, 75] {
                tokio::time::sleep(step).await;
                progress.report(percent);
            }
            tokio::time::sleep(step).await;

            if let Some(message) = input.get("fail").and_then(Value::as_str) {
                return Err(message.to_string());
            }

            let fallback = model
                .handle()
                .as_any()
                .downcast_ref::<SyntheticModel>()
                .map(|synthetic| format!("{:?}", synthetic.strategy()));
            Ok(json!({
                "operation": kind.operation,
                "model": model.name(),
                "fallback": fallback,
                "input": input,
            }))
        }
        .boxed()
    }
}
