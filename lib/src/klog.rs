//! Logging macros.
//!
//! All diagnostics funnel through the `log` facade so the embedder decides
//! where output goes. The macros exist so call sites stay stable if the
//! backend ever changes again; they add nothing else.

/// Log an unrecoverable-but-survivable condition.
#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => { $crate::log::error!($($arg)*) };
}

/// Log a suspicious condition the core repaired or worked around.
#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => { $crate::log::warn!($($arg)*) };
}

/// Log a notable state change (device registered, discipline grafted).
#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => { $crate::log::info!($($arg)*) };
}

/// Log data-path tracing; compiled out by most embedders via `log` features.
#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => { $crate::log::debug!($($arg)*) };
}
