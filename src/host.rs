//! Host facade: owns the registry, cache, ledger, queue and history
//! database, and exposes the operations clients call.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use modelhost_config::HostConfig;
use modelhost_db::{Database, SharedDatabase};
use modelhost_engine::{ModelCache, ModelRegistry, ModelSource};
use modelhost_queue::{CreditLedger, OperationRunner, SharedLedger, TaskQueue};
use modelhost_types::{
    log_info, HostError, HostResult, JobEvent, JobId, JobRequest, LoadState, MemoryStatus,
    ProcessingJob,
};

pub struct ModelHost {
    cache: ModelCache,
    ledger: SharedLedger,
    queue: TaskQueue,
    db: Option<SharedDatabase>,
    monitor: Option<JoinHandle<()>>,
}

impl ModelHost {
    /// Wire everything together. Must be called inside a tokio runtime: the
    /// queue worker and the memory monitor are spawned here.
    pub fn new(
        config: &HostConfig,
        source: Arc<dyn ModelSource>,
        runner: Arc<dyn OperationRunner>,
        db: Option<SharedDatabase>,
    ) -> HostResult<Self> {
        config.validate()?;
        let registry = Arc::new(ModelRegistry::from_config(&config.models)?);
        let cache = ModelCache::new(registry.clone(), source, config);

        let mut ledger = CreditLedger::new(&config.ledger);
        if let Some(db) = &db {
            ledger = ledger.with_database(db.clone());
        }
        let ledger = Arc::new(ledger);

        let queue = TaskQueue::spawn(
            cache.clone(),
            runner,
            ledger.clone(),
            &config.queue,
            db.clone(),
        );

        let monitor = if config.memory.monitor_interval_secs > 0 {
            Some(cache.spawn_memory_monitor(config.memory.monitor_interval()))
        } else {
            None
        };

        log_info!(
            "host",
            "Host ready: {} models, balance {}, ceiling {} bytes",
            registry.len(),
            ledger.balance(),
            config.memory.ceiling_bytes
        );

        Ok(Self {
            cache,
            ledger,
            queue,
            db,
            monitor,
        })
    }

    /// Like `new`, with the history database opened at `config.database_path`.
    pub fn open(
        config: &HostConfig,
        source: Arc<dyn ModelSource>,
        runner: Arc<dyn OperationRunner>,
    ) -> HostResult<Self> {
        let db = Database::new(&config.database_path).map_err(HostError::Storage)?;
        Self::new(config, source, runner, Some(Arc::new(db)))
    }

    pub fn submit_job(&self, request: JobRequest) -> HostResult<JobId> {
        self.queue.submit(request)
    }

    /// True only if the job was pending and is now cancelled.
    pub fn cancel_job(&self, id: &str) -> bool {
        self.queue.cancel(id)
    }

    pub fn get_job_status(&self, id: &str) -> Option<ProcessingJob> {
        self.queue.job_status(id)
    }

    pub fn get_memory_status(&self) -> MemoryStatus {
        self.cache.memory_status()
    }

    pub fn get_loading_progress(&self, model: &str) -> Option<LoadState> {
        self.cache.load_state(model)
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }

    pub fn watch_load(&self, model: &str) -> Option<watch::Receiver<LoadState>> {
        self.cache.watch_load(model)
    }

    /// Returns the amount actually credited after the tier cap.
    pub fn top_up(&self, amount: u64) -> u64 {
        self.ledger.top_up(amount)
    }

    pub fn balance(&self) -> u64 {
        self.ledger.balance()
    }

    pub fn unload_model(&self, model: &str) -> bool {
        self.cache.unload(model)
    }

    /// Forget a cached load failure so the next request tries again.
    pub fn retry_model(&self, model: &str) -> bool {
        self.cache.retry(model)
    }

    pub fn pin_model(&self, model: &str, pinned: bool) -> bool {
        self.cache.set_pinned(model, pinned)
    }

    /// Resolve once the job reaches a terminal state. `None` for an
    /// unknown id.
    pub async fn wait_for_job(&self, id: &str) -> Option<ProcessingJob> {
        let mut events = self.queue.subscribe();
        loop {
            let job = self.queue.job_status(id)?;
            if job.status.is_terminal() {
                return Some(job);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.queue.job_status(id),
            }
        }
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn database(&self) -> Option<&SharedDatabase> {
        self.db.as_ref()
    }
}

impl Drop for ModelHost {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::simulated::{SimulatedRunner, SimulatedSource};
    use modelhost_config::ModelConfig;
    use modelhost_types::{JobKind, JobStatus, ModelCategory, Priority, MB};

    fn model(name: &str, mb: u64, priority: Priority) -> ModelConfig {
        ModelConfig {
            name: name.to_string(),
            category: ModelCategory::Image,
            footprint_bytes: mb * MB,
            required_memory_bytes: None,
            priority,
            max_concurrent_users: 1,
            has_fallback: false,
            chunk_size_bytes: None,
        }
    }

    fn config(balance: u64, models: Vec<ModelConfig>) -> HostConfig {
        let mut config = HostConfig::default();
        config.memory.ceiling_bytes = 100 * MB;
        config.memory.warning_threshold = 1.0;
        config.memory.monitor_interval_secs = 0;
        config.ledger.initial_balance = balance;
        config.models = models;
        config
    }

    fn host(config: &HostConfig, source: SimulatedSource) -> ModelHost {
        host_with(config, Arc::new(source))
    }

    fn host_with(config: &HostConfig, source: Arc<SimulatedSource>) -> ModelHost {
        let db = Arc::new(Database::new(":memory:").unwrap());
        ModelHost::new(
            config,
            source,
            Arc::new(SimulatedRunner::new(Duration::from_millis(40))),
            Some(db),
        )
        .unwrap()
    }

    fn job(operation: &str, model: &str, cost: u64) -> JobRequest {
        JobRequest::new(JobKind::new(operation, model), cost)
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_request_evicts_low_priority_model() {
        let config = config(
            100,
            vec![
                model("modelA", 60, Priority::Low),
                model("modelB", 70, Priority::High),
            ],
        );
        let host = host(&config, SimulatedSource::new(Duration::from_millis(10)));

        let a = host.submit_job(job("denoise", "modelA", 1)).unwrap();
        let b = host.submit_job(job("upscale", "modelB", 1)).unwrap();
        assert_eq!(host.wait_for_job(&a).await.unwrap().status, JobStatus::Completed);
        assert_eq!(host.wait_for_job(&b).await.unwrap().status, JobStatus::Completed);

        assert_eq!(host.cache().resident_models(), vec!["modelB".to_string()]);
        let status = host.get_memory_status();
        assert_eq!(status.used_bytes, 70 * MB);
        assert_eq!(status.resident_count, 1);
        assert_eq!(status.largest_model.as_deref(), Some("modelB"));
        assert_eq!(host.get_loading_progress("modelA"), Some(LoadState::NotLoaded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_operation_returns_credits() {
        let config = config(15, vec![model("modelA", 10, Priority::Low)]);
        let host = host(&config, SimulatedSource::new(Duration::from_millis(10)));
        let mut events = host.subscribe_jobs();

        let id = host
            .submit_job(
                job("denoise", "modelA", 10).with_input(serde_json::json!({ "fail": "bad frame" })),
            )
            .unwrap();
        loop {
            let event = events.recv().await.unwrap();
            if event.job_id == id && event.status == JobStatus::Processing {
                break;
            }
        }
        assert_eq!(host.balance(), 5);

        let finished = host.wait_for_job(&id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Error);
        assert_eq!(finished.error_message.as_deref(), Some("bad frame"));
        assert_eq!(host.balance(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fall_back_to_synthetic_model() {
        let mut fallback = model("modelA", 10, Priority::Low);
        fallback.has_fallback = true;
        let config = config(100, vec![fallback]);
        let source =
            Arc::new(SimulatedSource::new(Duration::from_millis(10)).failing("modelA", u32::MAX));
        let host = host_with(&config, source.clone());

        let started = tokio::time::Instant::now();
        let id = host.submit_job(job("denoise", "modelA", 1)).unwrap();
        let finished = host.wait_for_job(&id).await.unwrap();

        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(
            finished.output.unwrap()["fallback"],
            serde_json::json!("IdentityImage")
        );
        // Backoff of 2 + 4 + 8 seconds between the four attempts.
        assert!(started.elapsed() >= Duration::from_secs(14));
        assert_eq!(source.acquisitions(), 4);
        assert!(host.cache().get("modelA").unwrap().is_fallback);
        assert_eq!(host.get_loading_progress("modelA"), Some(LoadState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_beyond_balance_is_rejected() {
        let config = config(5, vec![model("modelA", 10, Priority::Low)]);
        let host = host(&config, SimulatedSource::new(Duration::from_millis(10)));

        let err = host.submit_job(job("denoise", "modelA", 10)).unwrap_err();
        assert_eq!(
            err,
            HostError::InsufficientCredits {
                required: 10,
                available: 5
            }
        );
        assert_eq!(host.queue().pending_len(), 0);
        assert_eq!(host.balance(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_model_ends_job_in_error() {
        let config = config(20, vec![model("modelA", 10, Priority::Low)]);
        let host = host(&config, SimulatedSource::new(Duration::from_millis(10)));

        let id = host.submit_job(job("denoise", "ghost", 5)).unwrap();
        let finished = host.wait_for_job(&id).await.unwrap();

        assert_eq!(finished.status, JobStatus::Error);
        assert_eq!(
            finished.error_message.as_deref(),
            Some("model unavailable: ghost: unknown model: ghost")
        );
        assert_eq!(host.balance(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_jobs_are_recorded() {
        let config = config(20, vec![model("modelA", 10, Priority::Low)]);
        let host = host(&config, SimulatedSource::new(Duration::from_millis(10)));

        let id = host.submit_job(job("denoise", "modelA", 3)).unwrap();
        host.wait_for_job(&id).await.unwrap();

        let stored = host.database().unwrap().load_job(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.cost, 3);
        assert_eq!(host.balance(), 17);
        assert!(host.wait_for_job("missing").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_controls() {
        let config = config(20, vec![model("modelA", 10, Priority::Low)]);
        let host = host(&config, SimulatedSource::new(Duration::from_millis(10)));

        let id = host.submit_job(job("denoise", "modelA", 1)).unwrap();
        host.wait_for_job(&id).await.unwrap();

        assert!(host.pin_model("modelA", true));
        assert!(!host.pin_model("ghost", true));
        assert_eq!(host.top_up(500), 81);
        assert_eq!(host.balance(), 100);

        assert!(host.unload_model("modelA"));
        assert_eq!(host.get_memory_status().used_bytes, 0);
        assert!(!host.unload_model("modelA"));
    }
}
