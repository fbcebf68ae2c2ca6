// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Architecture Abstraction Layer (AAL)
//!
//! The ARM layer is built on every host so that the pmap can be exercised by
//! unit tests; only the barrier primitives differ per target.

pub mod arm;

// Re-export commonly used constants from vm::layout
pub use crate::kernel::vm::layout::{PAGE_MASK, PAGE_SIZE, PAGE_SIZE_SHIFT};
