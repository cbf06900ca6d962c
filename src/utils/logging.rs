//! Conditional logging macros gated on a module-level `ENABLE_LOGS` flag,
//! so chatty modules can be silenced without touching call sites.
//!
//! Each module that uses them declares the flag first:
//! ```rust
//! const ENABLE_LOGS: bool = true;
//! ```
//! and then pulls the macros from the crate root:
//! ```rust
//! use stagesync::{log_info, log_warn, log_error};
//! ```

/// Initializes the `log` facade for binaries and examples. Reads `RUST_LOG`,
/// defaulting to info level.
pub fn init() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
