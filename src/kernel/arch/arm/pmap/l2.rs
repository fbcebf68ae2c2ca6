// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! L2 Descriptor Tables
//!
//! Each pmap owns up to [`L2_SIZE`] [`L2Dtable`]s, each covering 16MB of
//! virtual space with sixteen [`L2Bucket`]s. A bucket is one 1KB coarse
//! table of 256 small-page entries plus the bookkeeping the pmap needs.
//!
//! Dtables and buckets are published through `spin::Once`: they are created
//! under the owning pmap's lock but looked up without any lock, which lets
//! the reverse-mapping code walk other pmaps' tables while holding only a
//! page lock. Once published a bucket stays where it is until the pmap is
//! destroyed.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use spin::Once;

use super::{Pmap, PmapContext, PmapInner};
use crate::kernel::pmm::PageAllocator;
use crate::kernel::vm::layout::{
    l1_idx, l2_bucket, l2_idx, l2pte_index, PAddr, VAddr, L1_S_SHIFT, L2_BUCKET_SIZE,
    L2_ENTRIES, L2_TABLE_SIZE_REAL, PAGE_SIZE,
};
use crate::kernel::vm::{Result, VmError};

#[allow(dead_code)]
const LOCAL_TRACE: bool = false;

/// One coarse L2 table and its occupancy
pub struct L2Bucket {
    /// Physical address of the table
    phys: PAddr,

    /// L1 slot this table is linked from
    l1idx: usize,

    /// Descriptors
    ptes: Box<[AtomicU32]>,

    /// Number of non-zero descriptors
    occupancy: AtomicU16,

    /// Wired bits of entries with no reverse mapping to carry them
    wired_bits: Box<[AtomicU32]>,
}

impl L2Bucket {
    /// Create an empty table at `phys`
    pub(crate) fn new(phys: PAddr, l1idx: usize) -> Self {
        Self::from_table(phys, l1idx, zeroed_table(L2_ENTRIES), 0)
    }

    /// Adopt an already populated table (boot tables)
    pub(crate) fn from_table(
        phys: PAddr,
        l1idx: usize,
        ptes: Box<[AtomicU32]>,
        occupancy: u16,
    ) -> Self {
        debug_assert_eq!(ptes.len(), L2_ENTRIES);
        Self {
            phys,
            l1idx,
            ptes,
            occupancy: AtomicU16::new(occupancy),
            wired_bits: zeroed_table(L2_ENTRIES / 32),
        }
    }

    /// Physical address of the table
    pub fn phys(&self) -> PAddr {
        self.phys
    }

    /// L1 index this table serves
    pub fn l1idx(&self) -> usize {
        self.l1idx
    }

    /// First virtual address covered by this table
    pub fn base_va(&self) -> VAddr {
        self.l1idx << L1_S_SHIFT
    }

    /// Number of non-zero descriptors
    pub fn occupancy(&self) -> u16 {
        self.occupancy.load(Ordering::Relaxed)
    }

    /// Read the descriptor for `va`
    #[inline]
    pub fn pte(&self, va: VAddr) -> u32 {
        self.ptes[l2pte_index(va)].load(Ordering::Acquire)
    }

    /// Write the descriptor for `va`
    #[inline]
    pub(crate) fn set_pte(&self, va: VAddr, pte: u32) {
        self.ptes[l2pte_index(va)].store(pte, Ordering::Release);
    }

    /// Address of the descriptor for `va`, for cache maintenance
    #[inline]
    pub(crate) fn pte_addr(&self, va: VAddr) -> VAddr {
        &self.ptes[l2pte_index(va)] as *const AtomicU32 as VAddr
    }

    /// Address of the table itself
    pub(crate) fn table_addr(&self) -> VAddr {
        self.ptes.as_ptr() as VAddr
    }

    pub(crate) fn inc_occupancy(&self) {
        self.occupancy.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_occupancy(&self, count: u16) {
        let old = self.occupancy.fetch_sub(count, Ordering::Relaxed);
        debug_assert!(old >= count, "L2 bucket occupancy underflow");
    }

    /// Whether the unmanaged entry for `va` is wired
    pub fn unmanaged_wired(&self, va: VAddr) -> bool {
        let idx = l2pte_index(va);
        self.wired_bits[idx / 32].load(Ordering::Relaxed) & (1 << (idx % 32)) != 0
    }

    /// Set the wired bit of the unmanaged entry for `va`; returns the old one
    pub(crate) fn set_unmanaged_wired(&self, va: VAddr, wired: bool) -> bool {
        let idx = l2pte_index(va);
        let bit = 1u32 << (idx % 32);
        let word = &self.wired_bits[idx / 32];
        let old = if wired {
            word.fetch_or(bit, Ordering::Relaxed)
        } else {
            word.fetch_and(!bit, Ordering::Relaxed)
        };
        old & bit != 0
    }
}

/// Sixteen consecutive L2 tables (16MB of virtual space)
pub struct L2Dtable {
    /// Number of buckets allocated
    occupancy: AtomicU32,

    buckets: [Once<L2Bucket>; L2_BUCKET_SIZE],
}

impl L2Dtable {
    pub(crate) fn new() -> Self {
        Self {
            occupancy: AtomicU32::new(0),
            buckets: core::array::from_fn(|_| Once::new()),
        }
    }

    /// Number of buckets allocated
    pub fn occupancy(&self) -> u32 {
        self.occupancy.load(Ordering::Relaxed)
    }

    /// Bucket at `index`, if allocated
    pub fn bucket(&self, index: usize) -> Option<&L2Bucket> {
        self.buckets[index].get()
    }

    /// Publish a bucket; returns the bucket now in the slot
    pub(crate) fn install(&self, index: usize, bucket: L2Bucket) -> &L2Bucket {
        let b = self.buckets[index].call_once(|| bucket);
        self.occupancy.fetch_add(1, Ordering::Relaxed);
        b
    }

    /// Allocated buckets in address order
    pub fn iter(&self) -> impl Iterator<Item = &L2Bucket> {
        self.buckets.iter().filter_map(|slot| slot.get())
    }
}

/// Supply of 1KB L2 tables
///
/// Pages come from the [`PageAllocator`] and are carved into four tables;
/// tables released by destroyed pmaps are kept on a free list and handed out
/// again before another page is taken.
pub struct L2PtpPool {
    free: spin::Mutex<Vec<PAddr>>,
}

impl L2PtpPool {
    pub const fn new() -> Self {
        Self {
            free: spin::Mutex::new(Vec::new()),
        }
    }

    /// Allocate one table
    pub fn alloc(&self, allocator: &dyn PageAllocator) -> Option<PAddr> {
        let mut free = self.free.lock();
        if let Some(pa) = free.pop() {
            return Some(pa);
        }
        let page = allocator.alloc_page()?;
        for chunk in (1..PAGE_SIZE / L2_TABLE_SIZE_REAL).rev() {
            free.push(page + chunk * L2_TABLE_SIZE_REAL);
        }
        Some(page)
    }

    /// Return a table to the pool
    pub fn free(&self, pa: PAddr) {
        debug_assert_eq!(pa % L2_TABLE_SIZE_REAL, 0);
        self.free.lock().push(pa);
    }

    /// Number of tables ready for reuse
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for L2PtpPool {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn zeroed_table(entries: usize) -> Box<[AtomicU32]> {
    (0..entries).map(|_| AtomicU32::new(0)).collect()
}

impl PmapContext {
    /// Look up the L2 table mapping `va`
    ///
    /// Never allocates and never takes a lock.
    pub fn get_l2_bucket<'a>(&self, pm: &'a Pmap, va: VAddr) -> Option<&'a L2Bucket> {
        let l1idx = l1_idx(va);
        let dtable = pm.l2[l2_idx(l1idx)].get()?;
        dtable.bucket(l2_bucket(l1idx))
    }

    /// Look up the L2 table mapping `va`, allocating it if needed
    ///
    /// For a user pmap this also allocates its L1 table and domain on first
    /// use. Fails with [`VmError::NoMemory`] when no table memory is left.
    pub fn alloc_l2_bucket<'a>(&self, pm: &'a Pmap, va: VAddr) -> Result<&'a L2Bucket> {
        let mut inner = pm.inner.lock();
        if !pm.kernel {
            self.ensure_l1(pm, &mut inner)?;
        }
        self.alloc_l2_bucket_locked(pm, &inner, va)
    }

    /// Bucket allocation with the pmap lock held
    pub(super) fn alloc_l2_bucket_locked<'a>(
        &self,
        pm: &'a Pmap,
        inner: &PmapInner,
        va: VAddr,
    ) -> Result<&'a L2Bucket> {
        let l1idx = l1_idx(va);
        let dtable = pm.l2[l2_idx(l1idx)].call_once(|| Box::new(L2Dtable::new()));
        if let Some(l2b) = dtable.bucket(l2_bucket(l1idx)) {
            return Ok(l2b);
        }

        let phys = self.ptp_pool.alloc(&*self.allocator).ok_or_else(|| {
            crate::log_warn!("pmap {}: no memory for L2 table at va {:#x}", pm.id, va);
            VmError::NoMemory
        })?;
        let l2b = dtable.install(l2_bucket(l1idx), L2Bucket::new(phys, l1idx));
        self.pte_sync_range(l2b.table_addr(), L2_TABLE_SIZE_REAL);
        crate::LTRACEF!("pmap {} new L2 table pa {:#x} for l1idx {:#x}", pm.id, phys, l1idx);

        // Link the table right away if the pmap can already be addressed.
        if let (Some(l1), Some(domain)) = (inner.l1.as_ref(), pm.domain()) {
            l1.set_entry(l1idx, self.templates.l1_c_entry(phys, domain));
            self.pte_sync(l1.entry_addr(l1idx));
        }
        Ok(l2b)
    }

    /// Release every L2 table of a dying pmap to the pool
    pub(super) fn free_l2_tables(&self, pm: &Pmap) {
        for dtable in pm.l2.iter().filter_map(|slot| slot.get()) {
            for l2b in dtable.iter() {
                self.ptp_pool.free(l2b.phys());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::pmm::FrameArena;
    use crate::kernel::vm::layout::PhysRange;

    #[test]
    fn test_bucket_entries() {
        let b = L2Bucket::new(0x8000_0400, 0x123);
        assert_eq!(b.base_va(), 0x1230_0000);
        assert_eq!(b.pte(0x1234_5000), 0);

        b.set_pte(0x1234_5000, 0xabc);
        b.inc_occupancy();
        assert_eq!(b.pte(0x1234_5000), 0xabc);
        assert_eq!(b.occupancy(), 1);
        assert_eq!(
            b.pte_addr(0x1234_5000) - b.table_addr(),
            l2pte_index(0x1234_5000) * 4
        );

        b.dec_occupancy(1);
        assert_eq!(b.occupancy(), 0);
    }

    #[test]
    fn test_bucket_unmanaged_wired() {
        let b = L2Bucket::new(0x8000_0400, 0x123);
        let va = 0x1232_1000;
        assert!(!b.unmanaged_wired(va));

        assert!(!b.set_unmanaged_wired(va, true));
        assert!(b.unmanaged_wired(va));
        assert!(!b.unmanaged_wired(va + PAGE_SIZE));
        assert!(b.set_unmanaged_wired(va, true));

        assert!(b.set_unmanaged_wired(va, false));
        assert!(!b.unmanaged_wired(va));
    }

    #[test]
    fn test_dtable_install() {
        let d = L2Dtable::new();
        assert!(d.bucket(3).is_none());
        d.install(3, L2Bucket::new(0x8000_0000, 3));
        assert_eq!(d.occupancy(), 1);
        assert_eq!(d.bucket(3).map(|b| b.phys()), Some(0x8000_0000));
        assert_eq!(d.iter().count(), 1);
    }

    #[test]
    fn test_pool_carves_pages() {
        let arena = FrameArena::new(PhysRange::new(0x8000_0000, 0x8000_2000));
        let pool = L2PtpPool::new();

        let tables: Vec<PAddr> = (0..4).map(|_| pool.alloc(&arena).unwrap()).collect();
        assert_eq!(tables, vec![0x8000_0000, 0x8000_0400, 0x8000_0800, 0x8000_0c00]);
        assert_eq!(arena.free_count(), 1);

        // Fifth table needs a new page.
        assert_eq!(pool.alloc(&arena), Some(0x8000_1000));
        assert_eq!(arena.free_count(), 0);

        pool.free(0x8000_0800);
        assert_eq!(pool.alloc(&arena), Some(0x8000_0800));
    }

    #[test]
    fn test_pool_exhaustion() {
        let arena = FrameArena::new(PhysRange::new(0x8000_0000, 0x8000_1000));
        let pool = L2PtpPool::new();
        for _ in 0..4 {
            assert!(pool.alloc(&arena).is_some());
        }
        assert!(pool.alloc(&arena).is_none());
    }
}
