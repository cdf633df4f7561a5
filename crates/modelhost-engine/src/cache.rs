//! Resident-model cache.
//!
//! Owns every resident handle, the memory budget, the per-model `LoadState`
//! and the table of in-flight loads. All of it sits behind one mutex, which
//! is never held across an `.await`. Concurrent `ensure_loaded` calls for a
//! model that is still loading attach to the same shared future, so a model
//! is fetched at most once at a time.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use modelhost_config::{HostConfig, OvercommitPolicy};
use modelhost_types::{
    log_debug, log_error, log_info, log_warn, HostError, HostResult, LoadState, MemoryStatus,
    ModelDescriptor, Priority, MB,
};

use crate::budget::MemoryBudget;
use crate::evictor::{EvictionCandidate, Evictor};
use crate::loader::{LoadedArtifact, Loader};
use crate::registry::ModelRegistry;
use crate::source::{ModelHandle, ModelSource, ProgressReporter};

/// Times a caller re-checks after the entry it waited for disappeared.
const MAX_LEASE_ATTEMPTS: usize = 3;

type LoadFuture = Shared<BoxFuture<'static, Result<(), String>>>;

/// A resident model plus its usage metadata.
#[derive(Clone)]
pub struct CacheEntry {
    pub handle: ModelHandle,
    pub priority: Priority,
    pub last_used_at: Instant,
    pub use_count: u64,
    pub memory_usage_bytes: u64,
    pub loaded_at: DateTime<Utc>,
    pub is_fallback: bool,
    /// Explicit "must keep" marker, set by callers.
    pub pinned: bool,
    users: Arc<Semaphore>,
    max_users: u32,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("model", &self.handle.model_name())
            .field("priority", &self.priority)
            .field("use_count", &self.use_count)
            .field("memory_usage_bytes", &self.memory_usage_bytes)
            .field("loaded_at", &self.loaded_at)
            .field("is_fallback", &self.is_fallback)
            .field("pinned", &self.pinned)
            .field("active_users", &self.active_users())
            .finish()
    }
}

impl CacheEntry {
    fn new(descriptor: &ModelDescriptor, artifact: LoadedArtifact) -> Self {
        Self {
            handle: artifact.handle,
            priority: descriptor.priority,
            last_used_at: Instant::now(),
            use_count: 0,
            memory_usage_bytes: artifact.memory_bytes,
            loaded_at: Utc::now(),
            is_fallback: artifact.is_fallback,
            pinned: false,
            users: Arc::new(Semaphore::new(descriptor.max_concurrent_users as usize)),
            max_users: descriptor.max_concurrent_users,
        }
    }

    fn touch(&mut self) {
        self.last_used_at = Instant::now();
        self.use_count += 1;
    }

    /// Number of outstanding leases.
    pub fn active_users(&self) -> u32 {
        let free = self.users.available_permits() as u32;
        self.max_users.saturating_sub(free)
    }

    pub fn in_use(&self) -> bool {
        self.active_users() > 0
    }

    fn candidate(&self, name: &str, epoch: Instant) -> EvictionCandidate {
        EvictionCandidate {
            name: name.to_string(),
            priority: self.priority,
            last_used_ms: self.last_used_at.saturating_duration_since(epoch).as_millis() as u64,
            use_count: self.use_count,
            memory_bytes: self.memory_usage_bytes,
            pinned: self.pinned,
            in_use: self.in_use(),
        }
    }
}

/// Proof that a model is resident. The entry cannot be evicted or unloaded
/// while a lease on it is alive.
pub struct ModelLease {
    name: String,
    handle: ModelHandle,
    is_fallback: bool,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLease")
            .field("name", &self.name)
            .field("is_fallback", &self.is_fallback)
            .finish()
    }
}

impl ModelLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    /// True when the loader gave up and a substitute is standing in.
    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }
}

struct LoadSlot {
    state: Arc<watch::Sender<LoadState>>,
    /// Set when the loader failed; cleared by a successful load or `retry`.
    failed_at: Option<Instant>,
}

impl LoadSlot {
    fn new() -> Self {
        let (tx, _) = watch::channel(LoadState::NotLoaded);
        Self {
            state: Arc::new(tx),
            failed_at: None,
        }
    }

    fn set(&self, state: LoadState) {
        self.state.send_replace(state);
    }
}

struct CacheState {
    budget: MemoryBudget,
    entries: HashMap<String, CacheEntry>,
    slots: HashMap<String, LoadSlot>,
    in_flight: HashMap<String, LoadFuture>,
}

impl CacheState {
    fn slot(&mut self, name: &str) -> &mut LoadSlot {
        self.slots
            .entry(name.to_string())
            .or_insert_with(LoadSlot::new)
    }
}

struct CacheInner {
    registry: Arc<ModelRegistry>,
    loader: Loader,
    evictor: Evictor,
    overcommit: OvercommitPolicy,
    failure_cooldown: Duration,
    epoch: Instant,
    state: Mutex<CacheState>,
}

enum Next {
    Resident(Arc<Semaphore>),
    Wait(LoadFuture),
}

/// Cheap to clone; all clones share the same cache.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<CacheInner>,
}

impl ModelCache {
    pub fn new(
        registry: Arc<ModelRegistry>,
        source: Arc<dyn ModelSource>,
        config: &HostConfig,
    ) -> Self {
        let state = CacheState {
            budget: MemoryBudget::from_config(&config.memory),
            entries: HashMap::new(),
            slots: HashMap::new(),
            in_flight: HashMap::new(),
        };
        Self {
            inner: Arc::new(CacheInner {
                registry,
                loader: Loader::new(source, config.loader.clone()),
                evictor: Evictor::new(config.eviction.use_count_weight_ms),
                overcommit: config.memory.overcommit,
                failure_cooldown: config.loader.failure_cooldown(),
                epoch: Instant::now(),
                state: Mutex::new(state),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// Look up a resident entry, recording the use. Never starts a load.
    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(name)?;
        entry.touch();
        Some(entry.clone())
    }

    pub fn is_resident(&self, name: &str) -> bool {
        self.lock().entries.contains_key(name)
    }

    pub fn resident_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current load state, or `None` for models the registry doesn't know.
    pub fn load_state(&self, name: &str) -> Option<LoadState> {
        if !self.inner.registry.contains(name) {
            return None;
        }
        let state = self.lock();
        Some(
            state
                .slots
                .get(name)
                .map(|slot| slot.state.borrow().clone())
                .unwrap_or(LoadState::NotLoaded),
        )
    }

    /// Subscribe to every change of a model's load state.
    pub fn watch_load(&self, name: &str) -> Option<watch::Receiver<LoadState>> {
        if !self.inner.registry.contains(name) {
            return None;
        }
        Some(self.lock().slot(name).state.subscribe())
    }

    /// Make `name` resident and lease it.
    ///
    /// Returns immediately for a resident model, joins the in-flight load if
    /// one exists, or starts a new one (evicting first if the budget is
    /// short). Waits for a free user slot when the model is at
    /// `max_concurrent_users`.
    pub async fn ensure_loaded(&self, name: &str) -> HostResult<ModelLease> {
        let descriptor = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| HostError::UnknownModel(name.to_string()))?;

        for _ in 0..MAX_LEASE_ATTEMPTS {
            let next = {
                let mut state = self.lock();
                if let Some(entry) = state.entries.get(name) {
                    Next::Resident(entry.users.clone())
                } else if let Some(load) = state.in_flight.get(name) {
                    log_debug!("cache", "Joining in-flight load of {}", name);
                    Next::Wait(load.clone())
                } else if let Some(reason) = self.cached_failure(&state, name) {
                    return Err(HostError::model_unavailable(name, reason));
                } else {
                    Next::Wait(self.start_load(&mut state, descriptor.clone())?)
                }
            };

            match next {
                Next::Wait(load) => {
                    load.await
                        .map_err(|reason| HostError::model_unavailable(name, reason))?;
                }
                Next::Resident(users) => {
                    let permit = users
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| HostError::model_unavailable(name, "entry closed"))?;

                    let mut state = self.lock();
                    // The entry may have been evicted (or reloaded) while we waited.
                    if let Some(entry) = state.entries.get_mut(name) {
                        if Arc::ptr_eq(&entry.users, &users) {
                            entry.touch();
                            return Ok(ModelLease {
                                name: name.to_string(),
                                handle: entry.handle.clone(),
                                is_fallback: entry.is_fallback,
                                _permit: permit,
                            });
                        }
                    }
                    log_debug!("cache", "{} changed while waiting for a lease, retrying", name);
                }
            }
        }

        Err(HostError::model_unavailable(
            name,
            "evicted before it could be used",
        ))
    }

    /// Reason of a recent loader failure still inside the cooldown window.
    fn cached_failure(&self, state: &CacheState, name: &str) -> Option<String> {
        let cooldown = self.inner.failure_cooldown;
        let slot = state.slots.get(name)?;
        let failed_at = slot.failed_at?;
        if failed_at.elapsed() >= cooldown {
            return None;
        }
        match &*slot.state.borrow() {
            LoadState::Failed { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Admit a load against the budget and spawn it. Caller holds the lock.
    fn start_load(
        &self,
        state: &mut CacheState,
        descriptor: Arc<ModelDescriptor>,
    ) -> HostResult<LoadFuture> {
        let name = descriptor.name.clone();
        let required = descriptor.required_memory_bytes;

        if !state.budget.try_reserve(required) {
            let shortfall = state.budget.shortfall(required);
            let freed = self.evict_locked(state, shortfall, None);
            log_info!(
                "cache",
                "Freed {} MB of {} MB needed for {}",
                freed / MB,
                shortfall / MB,
                name
            );
        }

        if !state.budget.fits_ceiling(required) {
            match self.inner.overcommit {
                OvercommitPolicy::Reject => {
                    let reason = format!(
                        "needs {} MB but only {} MB are free and nothing else can be evicted",
                        required / MB,
                        state.budget.available() / MB
                    );
                    log_warn!("cache", "Refusing to load {}: {}", name, reason);
                    state.slot(&name).set(LoadState::Failed {
                        reason: reason.clone(),
                    });
                    return Err(HostError::model_unavailable(&name, reason));
                }
                OvercommitPolicy::Allow => {
                    log_warn!(
                        "cache",
                        "Loading {} over the {} MB ceiling ({} MB free)",
                        name,
                        state.budget.ceiling() / MB,
                        state.budget.available() / MB
                    );
                }
            }
        }

        state.budget.hold(required);
        let slot = state.slot(&name);
        slot.failed_at = None;
        slot.set(LoadState::loading(descriptor.footprint_bytes));
        let progress = ProgressReporter::new(slot.state.clone(), descriptor.footprint_bytes);

        let cache = self.clone();
        let task = tokio::spawn(async move { cache.run_load(descriptor, progress).await });
        let load = async move {
            task.await
                .unwrap_or_else(|e| Err(format!("load task failed: {e}")))
        }
        .boxed()
        .shared();

        state.in_flight.insert(name, load.clone());
        Ok(load)
    }

    async fn run_load(
        self,
        descriptor: Arc<ModelDescriptor>,
        progress: ProgressReporter,
    ) -> Result<(), String> {
        let result = AssertUnwindSafe(self.inner.loader.load(&descriptor, progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(format!("load of {} panicked", descriptor.name)));
        let name = descriptor.name.as_str();

        let mut state = self.lock();
        state.budget.release_hold(descriptor.required_memory_bytes);
        state.in_flight.remove(name);

        match result {
            Ok(artifact) => {
                let memory = artifact.memory_bytes;
                let is_fallback = artifact.is_fallback;
                state.budget.commit(memory);
                if let Some(previous) = state
                    .entries
                    .insert(name.to_string(), CacheEntry::new(&descriptor, artifact))
                {
                    state.budget.release(previous.memory_usage_bytes);
                }
                let slot = state.slot(name);
                slot.failed_at = None;
                slot.set(LoadState::Ready);
                log_info!(
                    "cache",
                    "{} resident ({} MB{}), {} MB in use",
                    name,
                    memory / MB,
                    if is_fallback { ", fallback" } else { "" },
                    state.budget.used() / MB
                );

                if state.budget.is_above_warning() {
                    let excess = state.budget.excess_over_warning();
                    self.evict_locked(&mut state, excess, Some(name));
                }
                Ok(())
            }
            Err(reason) => {
                let slot = state.slot(name);
                slot.failed_at = Some(Instant::now());
                slot.set(LoadState::Failed {
                    reason: reason.clone(),
                });
                log_error!("cache", "Load of {} failed: {}", name, reason);
                Err(reason)
            }
        }
    }

    /// Free at least `required_bytes` by evicting Low/Medium entries that
    /// are neither pinned nor in use. Returns the bytes actually freed.
    pub fn evict_for(&self, required_bytes: u64) -> u64 {
        let mut state = self.lock();
        self.evict_locked(&mut state, required_bytes, None)
    }

    fn evict_locked(&self, state: &mut CacheState, required: u64, keep: Option<&str>) -> u64 {
        if required == 0 {
            return 0;
        }
        let epoch = self.inner.epoch;
        let candidates = state
            .entries
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != keep)
            .map(|(name, entry)| entry.candidate(name, epoch))
            .collect();

        let mut freed = 0;
        for victim in self.inner.evictor.select_victims(candidates, required) {
            if let Some(entry) = state.entries.remove(&victim.name) {
                state.budget.release(entry.memory_usage_bytes);
                state.slot(&victim.name).set(LoadState::NotLoaded);
                freed += entry.memory_usage_bytes;
                log_info!(
                    "cache",
                    "Evicted {} ({} MB, {} priority, used {} times)",
                    victim.name,
                    entry.memory_usage_bytes / MB,
                    entry.priority,
                    entry.use_count
                );
            }
        }
        freed
    }

    /// Evict down to the warning threshold. Returns the bytes freed.
    pub fn relieve_pressure(&self) -> u64 {
        let mut state = self.lock();
        let excess = state.budget.excess_over_warning();
        self.evict_locked(&mut state, excess, None)
    }

    /// Remove a resident model. Refused while a lease on it is alive.
    pub fn unload(&self, name: &str) -> bool {
        let mut state = self.lock();
        match state.entries.get(name) {
            None => return false,
            Some(entry) if entry.in_use() => {
                log_warn!("cache", "Not unloading {}: {} active users", name, entry.active_users());
                return false;
            }
            Some(_) => {}
        }
        let Some(entry) = state.entries.remove(name) else {
            return false;
        };
        state.budget.release(entry.memory_usage_bytes);
        state.slot(name).set(LoadState::NotLoaded);
        log_info!("cache", "Unloaded {} ({} MB)", name, entry.memory_usage_bytes / MB);
        true
    }

    /// Forget a cached failure so the next `ensure_loaded` starts a new load.
    pub fn retry(&self, name: &str) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(name) else {
            return false;
        };
        let failed = matches!(&*slot.state.borrow(), LoadState::Failed { .. });
        if failed {
            slot.failed_at = None;
            slot.set(LoadState::NotLoaded);
        }
        failed
    }

    /// Mark a resident entry as must-keep (or clear the mark).
    pub fn set_pinned(&self, name: &str, pinned: bool) -> bool {
        let mut state = self.lock();
        match state.entries.get_mut(name) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn memory_status(&self) -> MemoryStatus {
        let state = self.lock();
        let largest_model = state
            .entries
            .iter()
            .max_by(|a, b| {
                a.1.memory_usage_bytes
                    .cmp(&b.1.memory_usage_bytes)
                    .then_with(|| b.0.cmp(a.0))
            })
            .map(|(name, _)| name.clone());
        MemoryStatus {
            used_bytes: state.budget.used(),
            available_bytes: state.budget.available(),
            ceiling_bytes: state.budget.ceiling(),
            resident_count: state.entries.len(),
            largest_model,
            above_warning: state.budget.is_above_warning(),
        }
    }

    /// Periodically evict back under the warning threshold. The task ends
    /// once every clone of the cache has been dropped.
    pub fn spawn_memory_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = ModelCache { inner };
                let freed = cache.relieve_pressure();
                if freed > 0 {
                    log_info!("cache", "Memory monitor freed {} MB", freed / MB);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::source::{AcquireMode, LoadedModel};
    use modelhost_config::ModelConfig;
    use modelhost_types::ModelCategory;

    #[derive(Debug)]
    struct Weights {
        name: String,
        bytes: u64,
    }

    impl LoadedModel for Weights {
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

    /// Takes `delay` per acquisition; models in `broken` always fail.
    struct ScriptedSource {
        delay: Duration,
        broken: HashSet<String>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                broken: HashSet::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn broken(mut self, name: &str) -> Self {
            self.broken.insert(name.to_string());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ModelSource for ScriptedSource {
        fn acquire<'a>(
            &'a self,
            descriptor: &'a ModelDescriptor,
            _mode: AcquireMode,
            _progress: ProgressReporter,
        ) -> BoxFuture<'a, Result<ModelHandle, String>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                if self.broken.contains(&descriptor.name) {
                    return Err("weights corrupted".to_string());
                }
                Ok(Arc::new(Weights {
                    name: descriptor.name.clone(),
                    bytes: descriptor.required_memory_bytes,
                }) as ModelHandle)
            }
            .boxed()
        }
    }

    /// Panics on its first acquisition, then behaves.
    struct PanicOnceSource {
        calls: AtomicUsize,
    }

    impl ModelSource for PanicOnceSource {
        fn acquire<'a>(
            &'a self,
            descriptor: &'a ModelDescriptor,
            _mode: AcquireMode,
            _progress: ProgressReporter,
        ) -> BoxFuture<'a, Result<ModelHandle, String>> {
            async move {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("decoder blew up");
                }
                Ok(Arc::new(Weights {
                    name: descriptor.name.clone(),
                    bytes: descriptor.required_memory_bytes,
                }) as ModelHandle)
            }
            .boxed()
        }
    }

    fn model(name: &str, mb: u64, priority: Priority) -> ModelConfig {
        ModelConfig {
            name: name.to_string(),
            category: ModelCategory::Image,
            footprint_bytes: mb * MB,
            required_memory_bytes: None,
            priority,
            max_concurrent_users: 4,
            has_fallback: false,
            chunk_size_bytes: None,
        }
    }

    fn cache_with(
        models: Vec<ModelConfig>,
        source: Arc<dyn ModelSource>,
        tweak: impl FnOnce(&mut HostConfig),
    ) -> ModelCache {
        let mut config = HostConfig::default();
        config.memory.ceiling_bytes = 100 * MB;
        config.loader.max_retries = 0;
        tweak(&mut config);
        let registry = Arc::new(ModelRegistry::from_config(&models).unwrap());
        ModelCache::new(registry, source, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_load() {
        let source = Arc::new(ScriptedSource::new(Duration::from_secs(5)));
        let cache = cache_with(vec![model("x", 10, Priority::Low)], source.clone(), |_| {});

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.ensure_loaded("x").await.map(|lease| lease.name().to_string())
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "x");
        }

        assert_eq!(source.calls(), 1);
        assert_eq!(cache.load_state("x"), Some(LoadState::Ready));
        assert_eq!(cache.get("x").unwrap().use_count, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_failure() {
        let source = Arc::new(ScriptedSource::new(Duration::from_secs(5)).broken("x"));
        let cache = cache_with(vec![model("x", 10, Priority::Low)], source.clone(), |_| {});

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.ensure_loaded("x").await.map(|_| ()) }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, HostError::ModelUnavailable { .. }), "{err:?}");
        }

        assert_eq!(source.calls(), 1);
        assert!(matches!(cache.load_state("x"), Some(LoadState::Failed { .. })));
        let status = cache.memory_status();
        assert_eq!(status.used_bytes, 0);
        assert_eq!(status.available_bytes, 100 * MB);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_source_marks_model_failed() {
        let source = Arc::new(PanicOnceSource {
            calls: AtomicUsize::new(0),
        });
        let cache = cache_with(vec![model("x", 10, Priority::Low)], source.clone(), |_| {});

        let err = cache.ensure_loaded("x").await.map(|_| ()).unwrap_err();
        assert!(matches!(err, HostError::ModelUnavailable { .. }), "{err:?}");
        assert!(matches!(cache.load_state("x"), Some(LoadState::Failed { .. })));
        assert_eq!(cache.memory_status().available_bytes, 100 * MB);

        assert!(cache.retry("x"));
        assert!(cache.ensure_loaded("x").await.is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.load_state("x"), Some(LoadState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loading_state_visible_to_observers() {
        let source = Arc::new(ScriptedSource::new(Duration::from_secs(5)));
        let cache = cache_with(vec![model("x", 10, Priority::Low)], source, |_| {});
        let mut rx = cache.watch_load("x").unwrap();

        let loader = cache.clone();
        let handle = tokio::spawn(async move { loader.ensure_loaded("x").await.is_ok() });

        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_loading());
        assert!(cache.load_state("x").unwrap().is_loading());

        assert!(handle.await.unwrap());
        assert_eq!(*rx.borrow(), LoadState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_priority_evicted_for_high_priority() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(10)));
        let cache = cache_with(
            vec![
                model("model_a", 60, Priority::Low),
                model("model_b", 70, Priority::High),
            ],
            source,
            |_| {},
        );

        drop(cache.ensure_loaded("model_a").await.unwrap());
        drop(cache.ensure_loaded("model_b").await.unwrap());

        assert_eq!(cache.resident_models(), vec!["model_b".to_string()]);
        let status = cache.memory_status();
        assert_eq!(status.used_bytes, 70 * MB);
        assert_eq!(status.resident_count, 1);
        assert_eq!(status.largest_model.as_deref(), Some("model_b"));
        assert_eq!(cache.load_state("model_a"), Some(LoadState::NotLoaded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_never_evicted() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(10)));
        let cache = cache_with(
            vec![
                model("keeper", 60, Priority::High),
                model("newcomer", 70, Priority::Low),
            ],
            source,
            |_| {},
        );

        drop(cache.ensure_loaded("keeper").await.unwrap());
        tokio::time::advance(Duration::from_secs(3600)).await;

        let err = cache.ensure_loaded("newcomer").await.unwrap_err();
        assert!(matches!(err, HostError::ModelUnavailable { ref model, .. } if model == "newcomer"));
        assert!(cache.is_resident("keeper"));
        assert_eq!(cache.evict_for(100 * MB), 0);
        assert!(cache.is_resident("keeper"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overcommit_allowed_when_configured() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(10)));
        let cache = cache_with(
            vec![
                model("keeper", 60, Priority::High),
                model("newcomer", 70, Priority::Low),
            ],
            source,
            |config| config.memory.overcommit = OvercommitPolicy::Allow,
        );

        drop(cache.ensure_loaded("keeper").await.unwrap());
        drop(cache.ensure_loaded("newcomer").await.unwrap());

        let status = cache.memory_status();
        assert_eq!(status.used_bytes, 130 * MB);
        assert!(status.above_warning);
        assert_eq!(status.available_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leased_entry_survives_eviction_and_unload() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(10)));
        let cache = cache_with(vec![model("busy", 50, Priority::Low)], source, |_| {});

        let lease = cache.ensure_loaded("busy").await.unwrap();
        assert_eq!(cache.evict_for(50 * MB), 0);
        assert!(!cache.unload("busy"));

        drop(lease);
        assert!(cache.unload("busy"));
        assert_eq!(cache.memory_status().used_bytes, 0);
        assert!(!cache.unload("busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_entry_not_evicted() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(10)));
        let cache = cache_with(vec![model("pinned", 50, Priority::Low)], source, |_| {});

        drop(cache.ensure_loaded("pinned").await.unwrap());
        assert!(cache.set_pinned("pinned", true));
        assert_eq!(cache.evict_for(10 * MB), 0);

        assert!(cache.set_pinned("pinned", false));
        assert_eq!(cache.evict_for(10 * MB), 50 * MB);
        assert!(!cache.set_pinned("pinned", true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_cached_until_retry() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(10)).broken("bad"));
        let cache = cache_with(vec![model("bad", 10, Priority::Low)], source.clone(), |_| {});

        assert!(cache.ensure_loaded("bad").await.is_err());
        assert!(matches!(cache.load_state("bad"), Some(LoadState::Failed { .. })));
        assert!(cache.ensure_loaded("bad").await.is_err());
        assert_eq!(source.calls(), 1);
        assert_eq!(cache.memory_status().used_bytes, 0);

        assert!(cache.retry("bad"));
        assert_eq!(cache.load_state("bad"), Some(LoadState::NotLoaded));
        assert!(cache.ensure_loaded("bad").await.is_err());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_expires_after_cooldown() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(10)).broken("bad"));
        let cache = cache_with(vec![model("bad", 10, Priority::Low)], source.clone(), |_| {});

        assert!(cache.ensure_loaded("bad").await.is_err());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.ensure_loaded("bad").await.is_err());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let source = Arc::new(ScriptedSource::new(Duration::ZERO));
        let cache = cache_with(Vec::new(), source, |_| {});
        assert_eq!(
            cache.ensure_loaded("ghost").await.unwrap_err(),
            HostError::UnknownModel("ghost".into())
        );
        assert!(cache.load_state("ghost").is_none());
        assert!(cache.get("ghost").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relieve_pressure_prefers_stale_entries() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(10)));
        let cache = cache_with(
            vec![
                model("stale", 40, Priority::Low),
                model("fresh", 40, Priority::Medium),
                model("core", 10, Priority::High),
            ],
            source,
            |_| {},
        );

        drop(cache.ensure_loaded("stale").await.unwrap());
        tokio::time::advance(Duration::from_secs(600)).await;
        drop(cache.ensure_loaded("fresh").await.unwrap());
        drop(cache.ensure_loaded("core").await.unwrap());

        // Admitting core would pass the 85 MB soft limit; the stale entry goes.
        assert_eq!(cache.memory_status().used_bytes, 50 * MB);
        assert_eq!(
            cache.resident_models(),
            vec!["core".to_string(), "fresh".to_string()]
        );
        assert_eq!(cache.relieve_pressure(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_monitor_stops_with_cache() {
        let source = Arc::new(ScriptedSource::new(Duration::ZERO));
        let cache = cache_with(vec![model("x", 10, Priority::Low)], source, |_| {});
        let monitor = cache.spawn_memory_monitor(Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!monitor.is_finished());

        drop(cache);
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        monitor.await.unwrap();
    }
}
