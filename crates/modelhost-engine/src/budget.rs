//! Running total of bytes committed to resident models.
//!
//! Plain data: the cache keeps it behind the same mutex as its entry map so
//! that inserting or removing an entry and adjusting the total happen together.

use modelhost_config::MemoryConfig;

#[derive(Debug, Clone)]
pub struct MemoryBudget {
    ceiling: u64,
    warning_threshold: f64,
    committed: u64,
    /// Bytes set aside for loads that have not finished yet.
    held: u64,
}

impl MemoryBudget {
    pub fn new(ceiling: u64, warning_threshold: f64) -> Self {
        Self {
            ceiling,
            warning_threshold: warning_threshold.clamp(0.0, 1.0),
            committed: 0,
            held: 0,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.ceiling_bytes, config.warning_threshold)
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Bytes committed to resident models.
    pub fn used(&self) -> u64 {
        self.committed
    }

    pub fn held(&self) -> u64 {
        self.held
    }

    /// The soft limit, `ceiling * warning_threshold`.
    pub fn warning_limit(&self) -> u64 {
        (self.ceiling as f64 * self.warning_threshold) as u64
    }

    fn outstanding(&self) -> u64 {
        self.committed.saturating_add(self.held)
    }

    pub fn available(&self) -> u64 {
        self.ceiling.saturating_sub(self.outstanding())
    }

    /// Whether `bytes` more would stay under the soft limit. Does not reserve.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        self.outstanding().saturating_add(bytes) <= self.warning_limit()
    }

    /// Whether `bytes` more would stay under the hard ceiling.
    pub fn fits_ceiling(&self, bytes: u64) -> bool {
        self.outstanding().saturating_add(bytes) <= self.ceiling
    }

    /// How much must be freed for `bytes` more to fit under the soft limit.
    pub fn shortfall(&self, bytes: u64) -> u64 {
        self.outstanding()
            .saturating_add(bytes)
            .saturating_sub(self.warning_limit())
    }

    pub fn is_above_warning(&self) -> bool {
        self.outstanding() > self.warning_limit()
    }

    pub fn excess_over_warning(&self) -> u64 {
        self.outstanding().saturating_sub(self.warning_limit())
    }

    pub fn hold(&mut self, bytes: u64) {
        self.held = self.held.saturating_add(bytes);
    }

    pub fn release_hold(&mut self, bytes: u64) {
        self.held = self.held.saturating_sub(bytes);
    }

    pub fn commit(&mut self, bytes: u64) {
        self.committed = self.committed.saturating_add(bytes);
    }

    pub fn release(&mut self, bytes: u64) {
        self.committed = self.committed.saturating_sub(bytes);
    }
}
