// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Trace Support
//!
//! Trace macros built on the logging macros from [`crate::kernel::debug`].
//! A module opts in by declaring `const LOCAL_TRACE: bool` and the whole
//! facility is compiled out unless the `kernel-debug` feature is enabled.

/// Function trace, printed when the calling module's `LOCAL_TRACE` is set
#[macro_export]
macro_rules! LTRACEF {
    ($($arg:tt)*) => {
        #[cfg(feature = "kernel-debug")]
        {
            if LOCAL_TRACE {
                $crate::log_debug!($($arg)*);
            }
        }
    };
}
