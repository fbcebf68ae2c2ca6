// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux Kernel - Physical Map Subsystem
//!
//! Only the pieces of the kernel the ARM pmap depends on live here: the
//! logging facade, the VM address layout and error type, the physical frame
//! supply and the ARM architecture layer itself.

pub mod arch;
pub mod debug;
pub mod pmm;
pub mod vm;

// Common type aliases for kernel convenience
pub use crate::kernel::vm::{Result as VmResult, VmError};
