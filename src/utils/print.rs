//! Logging macros that prefix every line with the node it concerns.
//!
//! A server process sets `ME` once at startup. Several nodes may also share
//! one process (in-process clusters), in which case each connection task
//! runs inside a `NODE_ID` scope and that ID takes precedence.

use std::sync::OnceLock;

use crate::server::ReplicaId;

use env_logger::Env;

/// Process-wide node identity used as logging prefix.
pub static ME: OnceLock<String> = OnceLock::new();

tokio::task_local! {
    /// Node the current task works for.
    pub static NODE_ID: ReplicaId;
}

/// Prefix for log lines emitted from the current task.
pub fn log_prefix() -> String {
    NODE_ID.try_with(|id| id.to_string()).unwrap_or_else(|_| {
        ME.get().cloned().unwrap_or_else(|| String::from("-"))
    })
}

#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:ident, $($fmt_args:tt)*) => {
        log::$level!(
            "({}) {}",
            $crate::log_prefix(),
            format_args!($($fmt_args)*)
        )
    };
}

/// Log TRACE message with node prefix.
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => { $crate::pf_log!(trace, $($fmt_args)*) };
}

/// Log DEBUG message with node prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => { $crate::pf_log!(debug, $($fmt_args)*) };
}

/// Log INFO message with node prefix.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => { $crate::pf_log!(info, $($fmt_args)*) };
}

/// Log WARN message with node prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => { $crate::pf_log!(warn, $($fmt_args)*) };
}

/// Log ERROR message with node prefix.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => { $crate::pf_log!(error, $($fmt_args)*) };
}

/// Initialize `env_logger` if haven't. Filter comes from `METASYNC_LOG`,
/// defaulting to `info`.
pub fn logger_init() {
    let env = Env::default()
        .filter_or("METASYNC_LOG", "info")
        .write_style("METASYNC_LOG_STYLE");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false)
        .try_init();
}

/// Log an error string and then return it as `Err(MetasyncError)`.
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::MetasyncError::msg(format!($($fmt_args)*)))
        }
    };
}
