// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! ARM Physical Map
//!
//! The pmap owns the hardware translation tables of every address space and
//! keeps them coherent with the virtually indexed caches and the TLB.
//!
//! # Structure
//!
//! ```text
//! PmapContext
//!   ├── kernel Pmap ── kernel L1 (domain 15)
//!   ├── user Pmap ──── own L1 (allocated on first mapping), user domain 0..14
//!   │     └── l2[256] ── L2Dtable ── L2Bucket[16] ── 256 PTEs
//!   ├── L1Registry    every live L1, for kernel growth
//!   ├── DomainAllocator
//!   ├── L2PtpPool     1KB table supply
//!   └── PhysPageTable VmPage per managed page ── PvEntry list
//! ```
//!
//! # Cache and TLB State
//!
//! Each pmap carries a [`CacheState`] telling whether its mappings may be
//! present in the I/D caches and TLBs. Only the resident pmap (plus the
//! kernel) can have live cache lines; for every other pmap cache maintenance
//! is skipped and TLB invalidations are remembered and performed as one full
//! flush the next time it is activated.
//!
//! # Locking
//!
//! - `main_lock` read: operations going pmap -> page (`enter`, `remove`,
//!   `protect`, ...). Write: operations going page -> pmap (`clearbit`,
//!   `page_remove`).
//! - Per-pmap lock, then per-page lock.
//! - Domain allocator, registry, cache state and current-pmap locks are
//!   leaves.
//!
//! Descriptors are atomics and L2 tables never move, so walking another
//! pmap's tables under a page lock needs no pmap lock.

pub mod boot;
pub mod enter;
pub mod hook;
pub mod l1;
pub mod l2;
pub mod page;
pub mod pv;

#[cfg(test)]
mod tests;

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use spin::Once;

use crate::kernel::arch::arm::cpufunc::CpuFuncs;
use crate::kernel::arch::arm::pte::{
    domain_dacr, MmuVariant, PteTemplates, DOMAIN_CLIENT, PMAP_DOMAIN_KERNEL,
};
use crate::kernel::pmm::PageAllocator;
use crate::kernel::vm::layout::{
    l1_idx, l2_idx, l2_next_bucket, PAddr, VAddr, KERNEL_BASE, L1_TABLE_SIZE, L2_SIZE,
    PAGE_SIZE,
};
use crate::kernel::vm::{Result, VmError, VmProt};

pub use boot::{BootTables, DevMap};
pub use l1::{DomainAllocator, L1Registry, L1Table};
pub use l2::{L2Bucket, L2Dtable, L2PtpPool};
pub use page::{PageMd, PhysPageTable, PvEntry, PvFlags, VmPage};

#[allow(dead_code)]
const LOCAL_TRACE: bool = false;

/// Id meaning "no pmap"
const NO_PMAP: usize = 0;

/// Id of the kernel pmap
const KERNEL_PMAP_ID: usize = 1;

/// Domain value of a pmap that has none
pub(crate) const DOMAIN_NONE: u8 = 0xff;

/// DACR with only the kernel domain accessible
const KERNEL_DACR: u32 = DOMAIN_CLIENT << (PMAP_DOMAIN_KERNEL as u32 * 2);

// ============================================================================
// Configuration
// ============================================================================

/// Boot-time pmap configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapConfig {
    /// MMU variant of the running CPU
    pub variant: MmuVariant,

    /// Descriptor writes must be written back from the D-cache before the
    /// table walker sees them
    pub needs_pte_sync: bool,

    /// The D-cache is write-through
    pub dcache_write_through: bool,

    /// Request write-allocate for write-back memory
    pub write_allocate: bool,
}

impl PmapConfig {
    /// ARMv4/ARMv5 cores with a coherent table walker
    pub const fn generic() -> Self {
        Self {
            variant: MmuVariant::Generic,
            needs_pte_sync: false,
            dcache_write_through: false,
            write_allocate: false,
        }
    }

    /// StrongARM SA-1, whose table walker does not snoop the D-cache
    pub const fn sa1() -> Self {
        Self {
            needs_pte_sync: true,
            ..Self::generic()
        }
    }

    /// Intel XScale
    pub const fn xscale() -> Self {
        Self {
            variant: MmuVariant::XScale,
            needs_pte_sync: false,
            dcache_write_through: false,
            write_allocate: false,
        }
    }

    /// ARMv7 short-descriptor format
    pub const fn v7() -> Self {
        Self {
            variant: MmuVariant::V7,
            needs_pte_sync: false,
            dcache_write_through: false,
            write_allocate: true,
        }
    }

    /// Descriptor templates for this configuration
    pub fn templates(&self) -> PteTemplates {
        PteTemplates::new(self.variant, self.dcache_write_through, self.write_allocate)
    }
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self::generic()
    }
}

bitflags::bitflags! {
    /// Flags of an `enter` call
    ///
    /// The low bits carry the access that caused the call, if any; a
    /// mapping entered for an access starts out referenced (and modified
    /// for a write).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnterFlags: u32 {
        /// Entered for a read access
        const READ = 1 << 0;

        /// Entered for a write access
        const WRITE = 1 << 1;

        /// Entered for an instruction fetch
        const EXECUTE = 1 << 2;

        /// Mapping is wired
        const WIRED = 1 << 4;

        /// Access type bits
        const ACCESS = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl EnterFlags {
    /// Access type as a protection
    pub fn access(self) -> VmProt {
        VmProt::from_bits_truncate((self & Self::ACCESS).bits())
    }
}

// ============================================================================
// Cache State
// ============================================================================

/// Which caches and TLBs may hold a pmap's mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheState {
    /// I+D cache
    pub cache_id: bool,

    /// D-cache
    pub cache_d: bool,

    /// I+D TLB
    pub tlb_id: bool,

    /// D TLB
    pub tlb_d: bool,
}

impl CacheState {
    /// Nothing cached
    pub const NONE: Self = Self {
        cache_id: false,
        cache_d: false,
        tlb_id: false,
        tlb_d: false,
    };

    /// Everything may be cached
    pub const ALL: Self = Self {
        cache_id: true,
        cache_d: true,
        tlb_id: true,
        tlb_d: true,
    };

    /// Pack into the word layout read by the context switch code:
    /// one byte per flag, `cache_id` lowest
    pub const fn pack(self) -> u32 {
        (self.cache_id as u32)
            | (self.cache_d as u32) << 8
            | (self.tlb_id as u32) << 16
            | (self.tlb_d as u32) << 24
    }

    /// Inverse of [`CacheState::pack`]
    pub const fn unpack(word: u32) -> Self {
        Self {
            cache_id: word & 0xff != 0,
            cache_d: (word >> 8) & 0xff != 0,
            tlb_id: (word >> 16) & 0xff != 0,
            tlb_d: (word >> 24) & 0xff != 0,
        }
    }

    /// Any TLB may hold entries
    pub const fn any_tlb(self) -> bool {
        self.tlb_id || self.tlb_d
    }

    /// Any cache or TLB may hold entries
    pub const fn any(self) -> bool {
        self.cache_id || self.cache_d || self.tlb_id || self.tlb_d
    }
}

/// Values the context switch path loads for a pmap
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapActivation {
    /// Physical address of the L1 table
    pub pagedir: u32,

    /// Domain access control register
    pub dacr: u32,

    /// Packed [`CacheState`]
    pub cstate: u32,
}

/// Offset of `pagedir` for assembly consumers
pub const PMAP_ACTIVATION_PAGEDIR: usize = memoffset::offset_of!(PmapActivation, pagedir);

/// Offset of `dacr` for assembly consumers
pub const PMAP_ACTIVATION_DACR: usize = memoffset::offset_of!(PmapActivation, dacr);

/// Offset of `cstate` for assembly consumers
pub const PMAP_ACTIVATION_CSTATE: usize = memoffset::offset_of!(PmapActivation, cstate);

/// Mapping statistics of a pmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PmapStats {
    /// Installed mappings
    pub resident: u32,

    /// Wired mappings
    pub wired: u32,
}

// ============================================================================
// Pmap
// ============================================================================

/// An address space
pub struct Pmap {
    id: usize,
    kernel: bool,
    self_ref: Weak<Pmap>,

    /// Serializes mapping changes
    inner: spin::Mutex<PmapInner>,

    /// Lazily populated L2 metadata, one slot per 16MB
    l2: Box<[Once<Box<L2Dtable>>]>,

    domain: AtomicU8,
    cstate: spin::Mutex<CacheState>,

    resident: AtomicU32,
    wired: AtomicU32,
    refs: AtomicU32,

    /// A TLB invalidation was skipped while the pmap was not resident
    tlb_deferred: AtomicBool,

    destroyed: AtomicBool,
}

pub(crate) struct PmapInner {
    l1: Option<Arc<L1Table>>,

    /// TLB invalidation of removed mappings is deferred to `update`
    remove_all: bool,
}

impl Pmap {
    fn build(id: usize, kernel: bool, l1: Option<Arc<L1Table>>, self_ref: Weak<Pmap>) -> Self {
        Self {
            id,
            kernel,
            self_ref,
            inner: spin::Mutex::new(PmapInner {
                l1,
                remove_all: false,
            }),
            l2: (0..L2_SIZE).map(|_| Once::new()).collect(),
            domain: AtomicU8::new(if kernel { PMAP_DOMAIN_KERNEL } else { DOMAIN_NONE }),
            cstate: spin::Mutex::new(if kernel {
                CacheState::ALL
            } else {
                CacheState::NONE
            }),
            resident: AtomicU32::new(0),
            wired: AtomicU32::new(0),
            refs: AtomicU32::new(1),
            tlb_deferred: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn new_user(id: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self::build(id, false, None, weak.clone()))
    }

    pub(crate) fn new_kernel(l1: Arc<L1Table>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self::build(KERNEL_PMAP_ID, true, Some(l1), weak.clone()))
    }

    /// Unique id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Check if this is the kernel pmap
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Domain currently owned, if any
    pub fn domain(&self) -> Option<u8> {
        match self.domain.load(Ordering::Acquire) {
            DOMAIN_NONE => None,
            d => Some(d),
        }
    }

    /// Cache and TLB state
    pub fn cache_state(&self) -> CacheState {
        *self.cstate.lock()
    }

    pub(crate) fn set_cache_state(&self, state: CacheState) {
        *self.cstate.lock() = state;
    }

    /// Mapping statistics
    pub fn stats(&self) -> PmapStats {
        PmapStats {
            resident: self.resident.load(Ordering::Relaxed),
            wired: self.wired.load(Ordering::Relaxed),
        }
    }

    /// Physical address of the pmap's own L1 table
    pub fn l1_phys(&self) -> Option<PAddr> {
        self.inner.lock().l1.as_ref().map(|l1| l1.phys())
    }

    /// Live references
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    /// Check if a full TLB flush is owed at the next activation
    pub fn tlb_deferred(&self) -> bool {
        self.tlb_deferred.load(Ordering::Relaxed)
    }

    /// Populated L2 tables in address order
    pub fn l2_buckets(&self) -> impl Iterator<Item = &L2Bucket> {
        self.l2
            .iter()
            .filter_map(|slot| slot.get())
            .flat_map(|dtable| dtable.iter())
    }
}

impl core::fmt::Debug for Pmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("kernel", &self.kernel)
            .field("domain", &self.domain())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Context
// ============================================================================

/// The machine-dependent VM state of the system
///
/// Built once by [`PmapContext::bootstrap`]; every pmap operation goes
/// through it.
pub struct PmapContext {
    config: PmapConfig,
    templates: PteTemplates,
    cpu: Arc<dyn CpuFuncs>,
    allocator: Arc<dyn PageAllocator>,

    kernel_pmap: Arc<Pmap>,
    kernel_l1: Arc<L1Table>,
    l1_registry: L1Registry,
    domains: DomainAllocator,
    ptp_pool: L2PtpPool,
    pages: PhysPageTable,

    /// Orders pmap->page against page->pmap operations
    main_lock: spin::RwLock<()>,

    /// Resident user pmap
    current: spin::Mutex<Option<Arc<Pmap>>>,
    current_id: AtomicUsize,

    next_id: AtomicUsize,
    initialized: AtomicBool,

    /// End of the kernel VA that has L2 tables
    curmaxkvaddr: spin::Mutex<VAddr>,
    virtual_avail: VAddr,
    virtual_end: VAddr,

    /// Page copy/zero windows
    csrc_va: VAddr,
    cdst_va: VAddr,
    hook_lock: spin::Mutex<()>,

    devmap: spin::RwLock<Vec<DevMap>>,
}

impl PmapContext {
    /// Configuration the context was built with
    pub fn config(&self) -> &PmapConfig {
        &self.config
    }

    /// Descriptor templates
    pub fn templates(&self) -> &PteTemplates {
        &self.templates
    }

    /// CPU function table
    pub fn cpu(&self) -> &dyn CpuFuncs {
        &*self.cpu
    }

    /// The kernel pmap
    pub fn kernel_pmap(&self) -> &Arc<Pmap> {
        &self.kernel_pmap
    }

    /// The kernel L1 table
    pub fn kernel_l1(&self) -> &Arc<L1Table> {
        &self.kernel_l1
    }

    /// Resident user pmap
    pub fn current(&self) -> Option<Arc<Pmap>> {
        self.current.lock().clone()
    }

    /// Metadata of a managed page
    pub fn page(&self, pa: PAddr) -> Option<&VmPage> {
        self.pages.lookup(pa)
    }

    /// Number of registered L1 tables, the kernel's included
    pub fn l1_count(&self) -> usize {
        self.l1_registry.len()
    }

    /// Number of user domains in use
    pub fn domains_in_use(&self) -> usize {
        self.domains.in_use()
    }

    /// L2 tables ready for reuse
    pub fn l2_pool_free(&self) -> usize {
        self.ptp_pool.free_count()
    }

    /// Page metadata used by the mapping paths, once tracking is enabled
    fn managed_page(&self, pa: PAddr) -> Option<&VmPage> {
        if self.initialized.load(Ordering::Acquire) {
            self.pages.lookup(pa)
        } else {
            None
        }
    }

    fn current_id(&self) -> usize {
        self.current_id.load(Ordering::Acquire)
    }

    /// The pmap's mappings are in the loaded translation tables
    fn is_current(&self, pm: &Pmap) -> bool {
        pm.kernel || self.current_id() == pm.id
    }

    /// The pmap's mappings may be in the caches
    fn is_cached(&self, pm: &Pmap) -> bool {
        let cur = self.current_id();
        pm.kernel || cur == NO_PMAP || cur == pm.id
    }

    // ------------------------------------------------------------------------
    // Descriptor write-back
    // ------------------------------------------------------------------------

    fn pte_sync(&self, addr: VAddr) {
        if self.config.needs_pte_sync {
            self.cpu.dcache_wb_range(addr, 4);
        }
    }

    fn pte_sync_range(&self, addr: VAddr, len: usize) {
        if self.config.needs_pte_sync {
            self.cpu.dcache_wb_range(addr, len);
        }
    }

    fn pte_sync_current(&self, pm: &Pmap, addr: VAddr) {
        if self.config.needs_pte_sync && self.is_cached(pm) {
            self.cpu.dcache_wb_range(addr, 4);
        }
    }

    // ------------------------------------------------------------------------
    // Cache/TLB maintenance filtered by the pmap's cache state
    // ------------------------------------------------------------------------

    /// Owe a TLB flush to a pmap that skipped one
    ///
    /// Switching to the kernel does not flush the TLB, so a pmap that is
    /// not resident may still have live entries whatever its cache state.
    fn defer_tlb(&self, pm: &Pmap) {
        if !self.is_current(pm) {
            pm.tlb_deferred.store(true, Ordering::Relaxed);
        }
    }

    fn tlb_flush_id_se(&self, pm: &Pmap, va: VAddr) {
        if pm.cache_state().tlb_id {
            self.cpu.tlb_flush_id_se(va);
        } else {
            self.defer_tlb(pm);
        }
    }

    fn tlb_flush_d_se(&self, pm: &Pmap, va: VAddr) {
        if pm.cache_state().tlb_d {
            self.cpu.tlb_flush_d_se(va);
        } else {
            self.defer_tlb(pm);
        }
    }

    fn tlb_flush_id(&self, pm: &Pmap) {
        let mut cs = pm.cstate.lock();
        if cs.tlb_id {
            self.cpu.tlb_flush_id();
            if !pm.kernel {
                cs.tlb_id = false;
                cs.tlb_d = false;
            }
        } else {
            drop(cs);
            self.defer_tlb(pm);
        }
    }

    fn tlb_flush_d(&self, pm: &Pmap) {
        let mut cs = pm.cstate.lock();
        if cs.tlb_d {
            self.cpu.tlb_flush_d();
            if !pm.kernel {
                cs.tlb_d = false;
            }
        } else {
            drop(cs);
            self.defer_tlb(pm);
        }
    }

    fn idcache_wbinv_range(&self, pm: &Pmap, va: VAddr, len: usize) {
        if pm.cache_state().cache_id {
            self.cpu.idcache_wbinv_range(va, len);
        }
    }

    /// D-cache maintenance of a range
    ///
    /// `do_inv` invalidates as well; `rd_only` says the range was never
    /// writable, so invalidation alone is enough and write-back is pointless.
    fn dcache_wb_range(&self, pm: &Pmap, va: VAddr, len: usize, do_inv: bool, rd_only: bool) {
        if !pm.cache_state().cache_d {
            return;
        }
        if do_inv {
            if rd_only {
                self.cpu.dcache_inv_range(va, len);
            } else {
                self.cpu.dcache_wbinv_range(va, len);
            }
        } else if !rd_only {
            self.cpu.dcache_wb_range(va, len);
        }
    }

    fn idcache_wbinv_all(&self, pm: &Pmap) {
        let mut cs = pm.cstate.lock();
        if cs.cache_id {
            self.cpu.idcache_wbinv_all();
            if !pm.kernel {
                cs.cache_id = false;
                cs.cache_d = false;
            }
        }
    }

    fn dcache_wbinv_all(&self, pm: &Pmap) {
        let mut cs = pm.cstate.lock();
        if cs.cache_d {
            self.cpu.dcache_wbinv_all();
            if !pm.kernel {
                cs.cache_d = false;
            }
        }
    }

    // ------------------------------------------------------------------------
    // L1 and domain management
    // ------------------------------------------------------------------------

    /// Give a user pmap its L1 table and a domain
    fn ensure_l1(&self, pm: &Pmap, inner: &mut PmapInner) -> Result {
        if inner.l1.is_some() {
            return Ok(());
        }

        let phys = self
            .allocator
            .alloc_pages(L1_TABLE_SIZE / PAGE_SIZE, L1_TABLE_SIZE)
            .ok_or_else(|| {
                crate::log_warn!("pmap {}: no memory for L1 table", pm.id);
                VmError::NoMemory
            })?;
        let l1 = Arc::new(L1Table::new(phys));
        self.l1_registry.register(&l1, Some(&self.kernel_l1));
        self.pte_sync_range(l1.table_addr(), L1_TABLE_SIZE);

        let domain = self.domains.assign(pm, self.current_id(), &*self.cpu);
        self.install_user_l1_entries(pm, &l1, domain);
        crate::log_debug!("pmap {}: L1 at {:#x}, domain {}", pm.id, phys, domain);

        // Running on the kernel L1 until now.
        if self.is_current(pm) {
            self.cpu.set_dacr(domain_dacr(domain));
            self.cpu.setttb(phys);
            self.cpu.cpwait();
        }
        inner.l1 = Some(l1);
        Ok(())
    }

    /// Point every user coarse entry of `l1` at the pmap's tables in `domain`
    fn install_user_l1_entries(&self, pm: &Pmap, l1: &L1Table, domain: u8) {
        let user_slots = l2_idx(l1_idx(KERNEL_BASE));
        for dtable in pm.l2[..user_slots].iter().filter_map(|slot| slot.get()) {
            for l2b in dtable.iter() {
                l1.set_entry(l2b.l1idx(), self.templates.l1_c_entry(l2b.phys(), domain));
                self.pte_sync(l1.entry_addr(l2b.l1idx()));
            }
        }
    }

    fn free_l1(&self, l1: Arc<L1Table>) {
        if l1.release() == 0 {
            self.l1_registry.unregister(&l1);
            self.allocator.free_pages(l1.phys(), L1_TABLE_SIZE / PAGE_SIZE);
        }
    }

    /// TTB and DACR the pmap runs with
    fn context_regs(&self, pm: &Pmap, inner: &PmapInner) -> (PAddr, u32) {
        match (inner.l1.as_ref(), pm.domain()) {
            (Some(l1), Some(d)) if !pm.kernel => (l1.phys(), domain_dacr(d)),
            (Some(l1), _) => (l1.phys(), KERNEL_DACR),
            (None, _) => (self.kernel_l1.phys(), KERNEL_DACR),
        }
    }

    /// Flush the outgoing pmap's lines from a virtually indexed cache
    fn retire(&self, prev: &Pmap) {
        let mut cs = prev.cstate.lock();
        if self.config.variant.has_vivt_cache() && cs.cache_id {
            self.cpu.idcache_wbinv_all();
        }
        *cs = CacheState::NONE;
    }

    fn switch_to_kernel(&self) {
        let prev = self.current.lock().take();
        self.current_id.store(NO_PMAP, Ordering::Release);
        if let Some(prev) = prev {
            self.retire(&prev);
        }
        self.cpu.set_dacr(KERNEL_DACR);
        self.cpu.setttb(self.kernel_l1.phys());
        self.cpu.cpwait();
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create an empty user pmap
    ///
    /// No L1 table or domain is allocated until the first mapping.
    pub fn create(&self) -> Arc<Pmap> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        crate::LTRACEF!("create pmap {}", id);
        Pmap::new_user(id)
    }

    /// Add a reference
    pub fn reference(&self, pm: &Arc<Pmap>) {
        pm.refs.fetch_add(1, Ordering::Relaxed);
        if self.is_current(pm) {
            if let Some(d) = pm.domain() {
                self.domains.touch(d);
            }
        }
    }

    /// Drop a reference, tearing the pmap down when it was the last one
    ///
    /// # Panics
    ///
    /// Panics if the last reference goes while mappings are still installed.
    pub fn destroy(&self, pm: &Arc<Pmap>) {
        assert!(!pm.kernel, "destroy: kernel pmap");
        let mut inner = pm.inner.lock();

        if inner.remove_all {
            self.tlb_flush_id(pm);
            inner.remove_all = false;
        }

        if pm.refs.fetch_sub(1, Ordering::AcqRel) > 1 {
            if self.is_current(pm) {
                if let Some(d) = pm.domain() {
                    self.domains.touch(d);
                }
                pm.set_cache_state(CacheState::ALL);
            }
            return;
        }

        let resident = pm.resident.load(Ordering::Relaxed);
        assert!(
            resident == 0,
            "destroy: pmap {} still has {} resident mappings",
            pm.id,
            resident
        );

        if self.is_current(pm) {
            self.switch_to_kernel();
        }
        if let Some(d) = pm.domain() {
            self.domains.release(d, pm.id);
            pm.domain.store(DOMAIN_NONE, Ordering::Release);
        }
        self.free_l2_tables(pm);
        if let Some(l1) = inner.l1.take() {
            self.free_l1(l1);
        }
        pm.destroyed.store(true, Ordering::Release);
        crate::log_debug!("pmap {}: destroyed", pm.id);
    }

    /// Remove every user mapping of a pmap that is about to go away
    ///
    /// The cache is cleaned once up front and TLB invalidation is done as a
    /// single flush by the final [`update`](Self::update).
    pub fn remove_all(&self, pm: &Arc<Pmap>) {
        {
            let mut inner = pm.inner.lock();
            self.idcache_wbinv_all(pm);
            inner.remove_all = true;
        }

        let regions: Vec<VAddr> = pm.l2_buckets().map(|l2b| l2b.base_va()).collect();
        for va in regions {
            self.remove(pm, va, l2_next_bucket(va));
        }
        self.update(pm);
    }

    /// Make `pm` the resident address space
    pub fn activate(&self, pm: &Arc<Pmap>) {
        assert!(!pm.destroyed.load(Ordering::Acquire), "activate: pmap {} destroyed", pm.id);

        if pm.kernel {
            if self.current_id() != NO_PMAP
                || self.cpu.ttb() != self.kernel_l1.phys()
                || self.cpu.dacr() != KERNEL_DACR
            {
                self.switch_to_kernel();
            }
            return;
        }

        let inner = pm.inner.lock();
        let (ttb, dacr) = self.context_regs(pm, &inner);
        if self.current_id() == pm.id && self.cpu.ttb() == ttb && self.cpu.dacr() == dacr {
            return;
        }

        // Lost its domain to another pmap while descheduled.
        if let Some(l1) = inner.l1.as_ref() {
            if pm.domain().is_none() {
                let domain = self.domains.assign(pm, self.current_id(), &*self.cpu);
                self.install_user_l1_entries(pm, l1, domain);
            }
        }
        let (ttb, dacr) = self.context_regs(pm, &inner);

        let prev = self.current.lock().replace(pm.clone());
        self.current_id.store(pm.id, Ordering::Release);
        if let Some(prev) = prev {
            if prev.id != pm.id {
                self.retire(&prev);
            }
        }

        self.cpu.set_dacr(dacr);
        self.cpu.setttb(ttb);
        if pm.tlb_deferred.swap(false, Ordering::AcqRel) {
            self.cpu.tlb_flush_id();
        }
        pm.set_cache_state(CacheState::ALL);
        if let Some(d) = pm.domain() {
            self.domains.touch(d);
        }
        self.cpu.cpwait();
        crate::LTRACEF!("activate pmap {} ttb {:#x} dacr {:#x}", pm.id, ttb, dacr);
    }

    /// Counterpart of [`activate`](Self::activate); nothing to do on ARM
    pub fn deactivate(&self, _pm: &Arc<Pmap>) {}

    /// Complete deferred work after a batch of mapping changes
    pub fn update(&self, pm: &Arc<Pmap>) {
        let mut inner = pm.inner.lock();
        if inner.remove_all {
            self.tlb_flush_id(pm);
            inner.remove_all = false;
        }
        if self.is_current(pm) {
            if let Some(d) = pm.domain() {
                self.domains.touch(d);
            }
            pm.set_cache_state(CacheState::ALL);
        }
        self.cpu.cpwait();
    }

    /// Reclaim resources of an idle pmap; L2 tables are kept until destroy
    pub fn collect(&self, _pm: &Arc<Pmap>) {}

    /// Synchronize the I-cache after instructions were written to `pm`
    pub fn procwr(&self, pm: &Arc<Pmap>, va: VAddr, len: usize) {
        if self.is_current(pm) {
            self.cpu.icache_sync_range(va, len);
        }
    }

    /// Values the context switch path loads for `pm`
    pub fn activation_record(&self, pm: &Arc<Pmap>) -> PmapActivation {
        let inner = pm.inner.lock();
        let (ttb, dacr) = self.context_regs(pm, &inner);
        PmapActivation {
            pagedir: ttb as u32,
            dacr,
            cstate: pm.cache_state().pack(),
        }
    }

    /// Hook for unmapping holes in an address space being torn down
    pub fn remove_holes(&self, _pm: &Arc<Pmap>) {}

    /// Hook run after the last user mapping of a process is gone
    pub fn unuse_final(&self, _pm: &Arc<Pmap>) {}

    /// Mapping statistics
    pub fn stats(&self, pm: &Pmap) -> PmapStats {
        pm.stats()
    }
}
