//! Category-tagged logging macros.
//!
//! Every call names a category ("cache", "loader", "queue", ...) which
//! becomes the `log` target, so a log4rs config can route or filter by
//! subsystem. The binary decides where the records end up.

#[macro_export]
macro_rules! log_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::__log::debug!(target: $category, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::__log::info!(target: $category, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::__log::warn!(target: $category, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::__log::error!(target: $category, $($arg)*)
    };
}
