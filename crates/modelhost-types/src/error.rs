use thiserror::Error;

use crate::job::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("insufficient credits: job costs {required}, {available} available")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("model unavailable: {model}: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("{0}")]
    OperationFailed(String),

    #[error("job {id} cannot be cancelled while {status}")]
    NotCancellable { id: String, status: JobStatus },

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("task queue closed")]
    QueueClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl HostError {
    pub fn model_unavailable(model: &str, reason: impl Into<String>) -> Self {
        HostError::ModelUnavailable {
            model: model.to_string(),
            reason: reason.into(),
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
