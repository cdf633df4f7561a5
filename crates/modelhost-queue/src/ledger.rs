//! Credit accounting for queued jobs.
//!
//! A job's cost is held at submission, debited when it starts, and then
//! either settled (completed) or refunded (error). A job cancelled while
//! pending only has its hold released. Holds and debits are keyed by job id,
//! so repeating any of these calls for the same job is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use modelhost_config::LedgerConfig;
use modelhost_db::{JournalEntry, JournalKind, SharedDatabase};
use modelhost_types::{log_info, log_warn, HostError, HostResult, JobId, SubscriptionTier};

struct LedgerState {
    balance: u64,
    tier: SubscriptionTier,
    holds: HashMap<JobId, u64>,
    debits: HashMap<JobId, u64>,
}

impl LedgerState {
    fn held(&self) -> u64 {
        self.holds.values().sum()
    }

    fn spendable(&self) -> u64 {
        self.balance.saturating_sub(self.held())
    }
}

pub struct CreditLedger {
    state: Mutex<LedgerState>,
    tier_limits: BTreeMap<SubscriptionTier, u64>,
    db: Option<SharedDatabase>,
}

pub type SharedLedger = Arc<CreditLedger>;

impl CreditLedger {
    pub fn new(config: &LedgerConfig) -> Self {
        let limit = config
            .tier_limits
            .get(&config.tier)
            .copied()
            .unwrap_or(u64::MAX);
        Self {
            state: Mutex::new(LedgerState {
                balance: config.initial_balance.min(limit),
                tier: config.tier,
                holds: HashMap::new(),
                debits: HashMap::new(),
            }),
            tier_limits: config.tier_limits.clone(),
            db: None,
        }
    }

    /// Journal every movement into `ledger_journal`.
    pub fn with_database(mut self, db: SharedDatabase) -> Self {
        self.db = Some(db);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn journal(&self, job_id: Option<&str>, kind: JournalKind, amount: u64, balance_after: u64) {
        let Some(db) = &self.db else {
            return;
        };
        let entry = JournalEntry {
            job_id: job_id.map(str::to_string),
            kind,
            amount,
            balance_after,
        };
        if let Err(e) = db.append_journal(&entry) {
            log_warn!("ledger", "Failed to journal {}: {}", kind.as_str(), e);
        }
    }

    /// Credits not yet debited, including amounts held for pending jobs.
    pub fn balance(&self) -> u64 {
        self.lock().balance
    }

    /// Sum of holds for jobs that have not started.
    pub fn held(&self) -> u64 {
        self.lock().held()
    }

    /// What a new submission may still claim.
    pub fn spendable(&self) -> u64 {
        self.lock().spendable()
    }

    pub fn tier(&self) -> SubscriptionTier {
        self.lock().tier
    }

    pub fn tier_limit(&self, tier: SubscriptionTier) -> u64 {
        self.tier_limits.get(&tier).copied().unwrap_or(u64::MAX)
    }

    /// Change tier. The balance is not reduced; the new limit applies to top-ups.
    pub fn set_tier(&self, tier: SubscriptionTier) {
        let mut state = self.lock();
        if state.tier != tier {
            log_info!("ledger", "Tier changed from {} to {}", state.tier, tier);
            state.tier = tier;
        }
    }

    /// Add credits up to the tier limit. Returns the amount actually credited.
    pub fn top_up(&self, amount: u64) -> u64 {
        let (credited, balance_after) = {
            let mut state = self.lock();
            let limit = self.tier_limit(state.tier);
            let target = state.balance.saturating_add(amount).min(limit);
            let credited = target.saturating_sub(state.balance);
            state.balance += credited;
            (credited, state.balance)
        };
        if credited < amount {
            log_info!(
                "ledger",
                "Top-up of {} capped at {} by the tier limit",
                amount,
                credited
            );
        }
        if credited > 0 {
            self.journal(None, JournalKind::TopUp, credited, balance_after);
        }
        credited
    }

    /// Reserve `cost` for a job about to be enqueued.
    pub fn hold(&self, job_id: &str, cost: u64) -> HostResult<()> {
        let balance_after = {
            let mut state = self.lock();
            if state.holds.contains_key(job_id) || state.debits.contains_key(job_id) {
                return Ok(());
            }
            let available = state.spendable();
            if cost > available {
                return Err(HostError::InsufficientCredits {
                    required: cost,
                    available,
                });
            }
            state.holds.insert(job_id.to_string(), cost);
            state.balance
        };
        self.journal(Some(job_id), JournalKind::Hold, cost, balance_after);
        Ok(())
    }

    /// Drop the hold of a job that never started.
    pub fn release(&self, job_id: &str) -> bool {
        let (cost, balance_after) = {
            let mut state = self.lock();
            let Some(cost) = state.holds.remove(job_id) else {
                return false;
            };
            (cost, state.balance)
        };
        self.journal(Some(job_id), JournalKind::Release, cost, balance_after);
        true
    }

    /// Turn a hold into a debit as the job starts.
    pub fn debit(&self, job_id: &str) -> bool {
        let (cost, balance_after) = {
            let mut state = self.lock();
            let Some(cost) = state.holds.remove(job_id) else {
                return false;
            };
            state.balance = state.balance.saturating_sub(cost);
            state.debits.insert(job_id.to_string(), cost);
            (cost, state.balance)
        };
        self.journal(Some(job_id), JournalKind::Debit, cost, balance_after);
        true
    }

    /// Return a debited cost after the job failed.
    pub fn refund(&self, job_id: &str) -> bool {
        let (cost, balance_after) = {
            let mut state = self.lock();
            let Some(cost) = state.debits.remove(job_id) else {
                return false;
            };
            state.balance = state.balance.saturating_add(cost);
            (cost, state.balance)
        };
        self.journal(Some(job_id), JournalKind::Refund, cost, balance_after);
        true
    }

    /// Close the books on a completed job; its cost stays spent.
    pub fn settle(&self, job_id: &str) -> bool {
        self.lock().debits.remove(job_id).is_some()
    }
}
