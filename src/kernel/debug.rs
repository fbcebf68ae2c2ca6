// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Logging
//!
//! The pmap logs through the `log` facade so that whatever logger the kernel
//! installs (early UART, ring buffer, host test logger) receives its records.
//! Callers use the `log_*!` macros below instead of naming `log` directly; the
//! crate still builds with the `log` feature disabled, in which case every
//! record is discarded.
//!
//! # Usage
//!
//! ```ignore
//! log_info!("pmap: bootstrap, {} kernel L2 tables", count);
//! log_trace_if!(LOCAL_TRACE, "enter va {:#x}", va);
//! ```

use core::fmt;

/// Target string attached to every record emitted by this crate
pub const LOG_TARGET: &str = "pmap";

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace-level logging (very verbose)
    Trace = 0,

    /// Debug-level logging (verbose)
    Debug = 1,

    /// Informational logging
    Info = 2,

    /// Warning-level logging
    Warning = 3,

    /// Error-level logging
    Error = 4,
}

impl LogLevel {
    /// Get the log level name as a string
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[cfg(feature = "log")]
impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// Emit one log record
///
/// This is the single sink used by the logging macros.
#[inline]
pub fn log_print(level: LogLevel, args: fmt::Arguments) {
    #[cfg(feature = "log")]
    log::log!(target: LOG_TARGET, level.into(), "{}", args);

    #[cfg(not(feature = "log"))]
    let _ = (level, args);
}

/// Log a trace message
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Trace, format_args!($($arg)*));
    };
}

/// Log a trace message if condition is true
#[macro_export]
macro_rules! log_trace_if {
    ($cond:expr, $($arg:tt)*) => {
        if $cond {
            $crate::log_trace!($($arg)*);
        }
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Debug, format_args!($($arg)*));
    };
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Info, format_args!($($arg)*));
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Warning, format_args!($($arg)*));
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::kernel::debug::log_print($crate::kernel::debug::LogLevel::Error, format_args!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert_eq!(LogLevel::Warning.as_str(), "WARN");
    }

    #[test]
    fn test_log_macros_without_logger() {
        // No logger is installed under the test harness; records are dropped.
        crate::log_info!("pmap test {}", 1);
        crate::log_trace_if!(false, "never {}", 2);
    }
}
