//! Single-consumer job queue with credit accounting.

pub mod ledger;
pub mod operation;
pub mod task_queue;

pub use ledger::{CreditLedger, SharedLedger};
pub use operation::OperationRunner;
pub use task_queue::{JobProgress, TaskQueue};
