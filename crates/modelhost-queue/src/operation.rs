use futures_util::future::BoxFuture;

use modelhost_engine::ModelLease;
use modelhost_types::JobKind;

use crate::task_queue::JobProgress;

/// The opaque unit of work a job performs once its model is resident.
pub trait OperationRunner: Send + Sync {
    /// Run `kind.operation` against the leased model. An `Err` message ends
    /// the job in `Error` with that message and refunds its cost.
    fn run<'a>(
        &'a self,
        kind: &'a JobKind,
        model: &'a ModelLease,
        input: serde_json::Value,
        progress: JobProgress,
    ) -> BoxFuture<'a, Result<serde_json::Value, String>>;
}
