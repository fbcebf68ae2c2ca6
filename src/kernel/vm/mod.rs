// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual Memory Subsystem
//!
//! Machine-independent definitions shared between the VM system and the
//! machine-dependent physical map: address types and layout, protection
//! flags, and the error type of the mapping interface.
//!
//! # Organization
//!
//! - [`layout`] - Virtual address layout and table index arithmetic

pub mod layout;

// Re-exports for convenience
pub use layout::{
    is_kernel_vaddr, is_page_aligned, is_user_vaddr, page_align_down, page_align_up, PAddr,
    PhysRange, VAddr, KERNEL_BASE, PAGE_MASK, PAGE_SIZE, PAGE_SIZE_SHIFT,
};

/// Virtual memory errors
///
/// Table allocation is the only recoverable failure of the mapping
/// interface; every other broken precondition is a kernel bug and panics.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Out of memory
    NoMemory = 2,
}

impl VmError {
    /// Convert to raw status code
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::NoMemory => f.write_str("out of memory"),
        }
    }
}

/// Result type for VM operations
pub type Result<T = ()> = core::result::Result<T, VmError>;

bitflags::bitflags! {
    /// Generic protection of a mapping
    ///
    /// Also used as the access type of a fault or of an `enter` call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        /// Readable
        const READ = 1 << 0;

        /// Writable
        const WRITE = 1 << 1;

        /// Executable
        const EXECUTE = 1 << 2;

        /// Read and write
        const RW = Self::READ.bits() | Self::WRITE.bits();

        /// Everything
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl VmProt {
    /// Check if the protection allows reads
    pub const fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    /// Check if the protection allows writes
    pub const fn can_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Check if the protection allows execution
    pub const fn can_execute(self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

/// Calculate number of pages needed for a given size
pub const fn bytes_to_pages(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}
