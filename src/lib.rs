// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux ARM Physical Map
//!
//! This crate is the machine-dependent half of the Rustux virtual memory
//! system for ARMv4 through ARMv7 processors using the short-descriptor
//! translation table format. It owns the hardware page tables of every
//! address space, keeps the reverse mappings of every managed physical page,
//! and performs the cache and TLB maintenance each mapping change requires.
//!
//! # Organization
//!
//! - [`kernel::vm`] - Address layout, protection flags and the VM error type
//! - [`kernel::pmm`] - Physical frame supply for page tables
//! - [`kernel::arch::arm::pte`] - Descriptor encoding for each MMU variant
//! - [`kernel::arch::arm::cpufunc`] - Cache/TLB/MMU register operations
//! - [`kernel::arch::arm::pmap`] - Address spaces and mapping operations
//!
//! The crate is `no_std` and only needs `alloc`. Unit tests run on the host
//! against the software CPU model in [`kernel::arch::arm::cpufunc::SoftCpu`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Trace macros
pub mod trace;

// Kernel modules
pub mod kernel;

pub use kernel::arch::arm::cpufunc::{CpuFuncs, SoftCpu};
pub use kernel::arch::arm::pmap::{
    BootTables, CacheState, DevMap, EnterFlags, Pmap, PmapActivation, PmapConfig, PmapContext,
    PmapStats,
};
pub use kernel::arch::arm::pte::{CacheMode, Granularity, MmuVariant, PteKind, PteTemplates};
pub use kernel::pmm::{FrameArena, PageAllocator};
pub use kernel::vm::{PAddr, Result, VAddr, VmError, VmProt};
