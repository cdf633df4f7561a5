//! Victim selection for memory shortfalls.

use modelhost_types::Priority;

/// Eviction-relevant view of one resident entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub name: String,
    pub priority: Priority,
    /// Milliseconds since the cache epoch at the last use.
    pub last_used_ms: u64,
    pub use_count: u64,
    pub memory_bytes: u64,
    pub pinned: bool,
    pub in_use: bool,
}

impl EvictionCandidate {
    /// High priority, pinned and in-use entries are never touched.
    pub fn is_evictable(&self) -> bool {
        self.priority.is_evictable() && !self.pinned && !self.in_use
    }

    /// Lower scores go first: older and less used.
    pub fn score(&self, use_count_weight_ms: u64) -> u64 {
        self.last_used_ms
            .saturating_add(self.use_count.saturating_mul(use_count_weight_ms))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Evictor {
    use_count_weight_ms: u64,
}

impl Evictor {
    pub fn new(use_count_weight_ms: u64) -> Self {
        Self {
            use_count_weight_ms,
        }
    }

    /// Pick entries to remove, lowest score first, until their memory covers
    /// `required_bytes` or nothing evictable remains.
    pub fn select_victims(
        &self,
        candidates: Vec<EvictionCandidate>,
        required_bytes: u64,
    ) -> Vec<EvictionCandidate> {
        if required_bytes == 0 {
            return Vec::new();
        }

        let mut evictable: Vec<EvictionCandidate> =
            candidates.into_iter().filter(|c| c.is_evictable()).collect();
        evictable.sort_by(|a, b| {
            a.score(self.use_count_weight_ms)
                .cmp(&b.score(self.use_count_weight_ms))
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for candidate in evictable {
            if freed >= required_bytes {
                break;
            }
            freed = freed.saturating_add(candidate.memory_bytes);
            victims.push(candidate);
        }
        victims
    }
}
