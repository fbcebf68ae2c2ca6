// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! ARM (32-bit, short-descriptor) Architecture Support
//!
//! # Organization
//!
//! - [`pte`] - L1/L2 descriptor encodings per MMU variant
//! - [`cpufunc`] - Cache, TLB and MMU register operations
//! - [`pmap`] - Physical map: address spaces and mapping operations

pub mod cpufunc;
pub mod pmap;
pub mod pte;
