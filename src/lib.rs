//! modelhost: a memory-bounded model cache feeding a credit-metered,
//! single-consumer job queue.

pub mod host;
pub mod simulated;

pub use host::ModelHost;

pub use modelhost_config as config;
pub use modelhost_db as db;
pub use modelhost_engine as engine;
pub use modelhost_queue as queue;
pub use modelhost_types as types;
