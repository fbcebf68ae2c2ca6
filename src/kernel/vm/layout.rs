// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual Address Layout
//!
//! Address types, page geometry and the fixed split of the 32-bit ARM
//! virtual address space, together with the index arithmetic that maps a
//! virtual address onto the L1 table, the per-pmap `l2_dtable` array and the
//! L2 descriptor tables.
//!
//! # Address Space Split
//!
//! ```text
//! 0x0000_0000 .. KERNEL_BASE        user space (per process)
//! KERNEL_BASE .. KERNEL_VM_BASE     kernel image and static mappings
//! KERNEL_VM_BASE .. KERNEL_VM_END   growable kernel VA (pmap_growkernel)
//! KERNEL_VM_END .. 4GB              device maps, vectors
//! ```
//!
//! # Table Geometry
//!
//! The L1 table has 4096 entries of 1MB each. Every 1MB region can point at
//! one coarse L2 table of 256 entries. L2 tables are grouped sixteen at a
//! time into an `l2_dtable`, so one pmap needs at most 256 of those.

/// Virtual address type
pub type VAddr = usize;

/// Physical address type
pub type PAddr = usize;

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Page size shift
pub const PAGE_SIZE_SHIFT: usize = 12;

/// Mask for the offset within a page
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

// ============================================================================
// Address Space Split
// ============================================================================

/// First kernel virtual address; everything below belongs to user space
pub const KERNEL_BASE: VAddr = 0xc000_0000;

/// Start of the dynamically grown kernel VA range
pub const KERNEL_VM_BASE: VAddr = KERNEL_BASE + 0x0100_0000;

/// Size of the dynamically grown kernel VA range
pub const KERNEL_VM_SIZE: usize = 0x0c00_0000;

/// End of the dynamically grown kernel VA range
pub const KERNEL_VM_END: VAddr = KERNEL_VM_BASE + KERNEL_VM_SIZE;

/// Highest user address (exclusive)
pub const USER_ASPACE_TOP: VAddr = KERNEL_BASE;

// ============================================================================
// L1 Geometry
// ============================================================================

/// Shift of the L1 index in a virtual address
pub const L1_S_SHIFT: usize = 20;

/// Size covered by one L1 entry (a section)
pub const L1_S_SIZE: usize = 1 << L1_S_SHIFT;

/// Offset within a section
pub const L1_S_OFFSET: usize = L1_S_SIZE - 1;

/// Section frame mask
pub const L1_S_FRAME: usize = !L1_S_OFFSET;

/// Number of L1 entries
pub const L1_ENTRIES: usize = 4096;

/// Size of the L1 translation table in bytes (16KB, naturally aligned)
pub const L1_TABLE_SIZE: usize = L1_ENTRIES * 4;

// ============================================================================
// L2 Geometry
// ============================================================================

/// Large page size (64KB)
pub const L2_L_SIZE: usize = 0x0001_0000;

/// Offset within a large page
pub const L2_L_OFFSET: usize = L2_L_SIZE - 1;

/// Large page frame mask
pub const L2_L_FRAME: usize = !L2_L_OFFSET;

/// Shift of a small page
pub const L2_S_SHIFT: usize = 12;

/// Small page size (4KB)
pub const L2_S_SIZE: usize = 1 << L2_S_SHIFT;

/// Offset within a small page
pub const L2_S_OFFSET: usize = L2_S_SIZE - 1;

/// Small page frame mask
pub const L2_S_FRAME: usize = !L2_S_OFFSET;

/// Number of entries in one coarse L2 table
pub const L2_ENTRIES: usize = 256;

/// Real size of a coarse L2 table in memory
pub const L2_TABLE_SIZE_REAL: usize = L2_ENTRIES * 4;

/// Number of large-page replicas in an L2 table
pub const L2_L_REPLICAS: usize = L2_L_SIZE / L2_S_SIZE;

/// log2 of the number of L2 tables grouped in one `l2_dtable`
pub const L2_BUCKET_LOG2: usize = 4;

/// Number of L2 tables grouped in one `l2_dtable`
pub const L2_BUCKET_SIZE: usize = 1 << L2_BUCKET_LOG2;

/// Number of `l2_dtable` slots per pmap
pub const L2_SIZE: usize = 1 << (32 - L1_S_SHIFT - L2_BUCKET_LOG2);

// Layout validation at compile time
const _: () = assert!(L1_TABLE_SIZE == 0x4000);
const _: () = assert!(L2_TABLE_SIZE_REAL == 0x400);
const _: () = assert!(L2_SIZE * L2_BUCKET_SIZE == L1_ENTRIES);
const _: () = assert!(KERNEL_BASE & L1_S_OFFSET == 0);
const _: () = assert!(KERNEL_VM_END > KERNEL_VM_BASE);

// ============================================================================
// Index Arithmetic
// ============================================================================

/// Index of the L1 entry mapping `va`
#[inline]
pub const fn l1_idx(va: VAddr) -> usize {
    (va >> L1_S_SHIFT) & (L1_ENTRIES - 1)
}

/// Index into the pmap's `l2_dtable` array for an L1 index
#[inline]
pub const fn l2_idx(l1idx: usize) -> usize {
    (l1idx >> L2_BUCKET_LOG2) & (L2_SIZE - 1)
}

/// Index of the bucket within an `l2_dtable` for an L1 index
#[inline]
pub const fn l2_bucket(l1idx: usize) -> usize {
    l1idx & (L2_BUCKET_SIZE - 1)
}

/// First address of the next 1MB region, saturating at the top of memory
#[inline]
pub const fn l2_next_bucket(va: VAddr) -> VAddr {
    (va & L1_S_FRAME).saturating_add(L1_S_SIZE)
}

/// Index of the L2 entry mapping `va` within its table
#[inline]
pub const fn l2pte_index(va: VAddr) -> usize {
    (va >> L2_S_SHIFT) & (L2_ENTRIES - 1)
}

/// Check if an address is page-aligned
#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    (addr & PAGE_MASK) == 0
}

/// Align an address down to page boundary
#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Align an address up to page boundary
#[inline]
pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_MASK) & !PAGE_MASK
}

/// Check whether an address belongs to the kernel half
#[inline]
pub const fn is_kernel_vaddr(va: VAddr) -> bool {
    va >= KERNEL_BASE
}

/// Check whether an address belongs to user space
#[inline]
pub const fn is_user_vaddr(va: VAddr) -> bool {
    va < USER_ASPACE_TOP
}

/// A contiguous range of physical memory `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    /// First byte of the range
    pub start: PAddr,

    /// First byte past the range
    pub end: PAddr,
}

impl PhysRange {
    /// Create a new range
    pub const fn new(start: PAddr, end: PAddr) -> Self {
        Self { start, end }
    }

    /// Number of whole pages in the range
    pub const fn page_count(&self) -> usize {
        (self.end - self.start) / PAGE_SIZE
    }

    /// Check whether `pa` falls in the range
    pub const fn contains(&self, pa: PAddr) -> bool {
        pa >= self.start && pa < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_arithmetic() {
        let va = 0xc123_4000;
        assert_eq!(l1_idx(va), 0xc12);
        assert_eq!(l2_idx(l1_idx(va)), 0xc1);
        assert_eq!(l2_bucket(l1_idx(va)), 0x2);
        assert_eq!(l2pte_index(va), 0x34);
        assert_eq!(l2_next_bucket(va), 0xc130_0000);
    }

    #[test]
    fn test_next_bucket_saturates() {
        assert_eq!(l2_next_bucket(0x0000_1000), 0x0010_0000);
        assert!(l2_next_bucket(0xfff0_0000) >= 0xfff0_0000);
    }

    #[test]
    fn test_page_alignment() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert!(is_page_aligned(0x2000));
        assert!(!is_page_aligned(0x2004));
    }

    #[test]
    fn test_address_split() {
        assert!(is_user_vaddr(0x1000));
        assert!(!is_user_vaddr(KERNEL_BASE));
        assert!(is_kernel_vaddr(KERNEL_VM_BASE));
    }

    #[test]
    fn test_phys_range() {
        let r = PhysRange::new(0x10_0000, 0x20_0000);
        assert_eq!(r.page_count(), 256);
        assert!(r.contains(0x10_0000));
        assert!(!r.contains(0x20_0000));
    }
}
