// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Bootstrap and Kernel Growth
//!
//! Early platform code builds the kernel L1 with [`BootTables`] before any
//! allocator exists: it links statically allocated L2 tables, maps the
//! kernel image with sections and large pages where alignment allows, and
//! maps the static device regions. [`PmapContext::bootstrap`] then adopts
//! those tables, rebuilding the kernel pmap's L2 metadata from what it finds
//! in the L1.
//!
//! Later the kernel virtual space is extended 1MB at a time by
//! [`PmapContext::growkernel`], which copies each new coarse entry into
//! every L1 table in the system.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::l2::zeroed_table;
use super::{
    DomainAllocator, L1Registry, L1Table, L2Bucket, L2Dtable, L2PtpPool, PhysPageTable, Pmap,
    PmapConfig, PmapContext, KERNEL_PMAP_ID,
};
use crate::kernel::arch::arm::cpufunc::CpuFuncs;
use crate::kernel::arch::arm::pte::{
    l1_s_dom, l1pte_page_p, l1pte_section_p, l2pte_large_p, CacheMode, Granularity, PteKind,
    PteTemplates, L1_C_ADDR_MASK, L2_TYPE_INV, L2_TYPE_MASK, PMAP_DOMAIN_KERNEL,
};
use crate::kernel::pmm::PageAllocator;
use crate::kernel::vm::layout::{
    l1_idx, l2_bucket, l2_idx, l2pte_index, PAddr, PhysRange, VAddr, L1_ENTRIES, L1_S_OFFSET,
    L1_S_SHIFT, L1_S_SIZE, L1_TABLE_SIZE, L2_ENTRIES, L2_L_OFFSET, L2_L_REPLICAS, L2_L_SIZE,
    L2_TABLE_SIZE_REAL, PAGE_MASK, PAGE_SIZE,
};
use crate::kernel::vm::VmProt;

#[allow(dead_code)]
const LOCAL_TRACE: bool = false;

/// A statically mapped device region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevMap {
    /// Virtual base
    pub va: VAddr,

    /// Physical base
    pub pa: PAddr,

    /// Size in bytes
    pub size: usize,

    /// Protection
    pub prot: VmProt,

    /// Cache mode
    pub cache: CacheMode,
}

impl DevMap {
    fn covers_pa(&self, pa: PAddr, size: usize) -> bool {
        pa >= self.pa && pa + size <= self.pa + self.size
    }

    fn covers_va(&self, va: VAddr, size: usize) -> bool {
        va >= self.va && va + size <= self.va + self.size
    }
}

/// An L2 table linked during early boot
struct BootL2 {
    phys: PAddr,

    /// Kernel virtual address the table itself is mapped at
    va: VAddr,

    ptes: Option<Box<[AtomicU32]>>,
}

/// The kernel translation tables as built by early platform code
///
/// Descriptors written here are not cleaned from the D-cache;
/// [`PmapContext::bootstrap`] writes back the whole cache before the tables
/// are used.
pub struct BootTables {
    templates: PteTemplates,
    l1_phys: PAddr,
    l1_va: VAddr,
    l1: Box<[AtomicU32]>,
    l2: Vec<BootL2>,
    devmap: Vec<DevMap>,
}

impl BootTables {
    /// Start an empty kernel L1 at `l1_phys`, mapped at `l1_va`
    pub fn new(config: &PmapConfig, l1_phys: PAddr, l1_va: VAddr) -> Self {
        assert!(
            l1_phys % L1_TABLE_SIZE == 0,
            "boot: L1 at {:#x} not 16KB aligned",
            l1_phys
        );
        Self {
            templates: config.templates(),
            l1_phys,
            l1_va,
            l1: zeroed_table(L1_ENTRIES),
            l2: Vec::new(),
            devmap: Vec::new(),
        }
    }

    /// Physical address of the L1
    pub fn l1_phys(&self) -> PAddr {
        self.l1_phys
    }

    /// L1 descriptor at `idx`
    pub fn l1_entry(&self, idx: usize) -> u32 {
        self.l1[idx].load(Ordering::Relaxed)
    }

    /// L2 descriptor mapping `va`, if an L2 table is linked for it
    pub fn l2_entry(&self, va: VAddr) -> Option<u32> {
        self.l2_table(va)
            .map(|ptes| ptes[l2pte_index(va)].load(Ordering::Relaxed))
    }

    fn lookup_l2(&self, phys: PAddr) -> Option<&BootL2> {
        self.l2.iter().find(|t| t.phys == phys)
    }

    fn l2_table(&self, va: VAddr) -> Option<&[AtomicU32]> {
        let pde = self.l1_entry(l1_idx(va));
        if !l1pte_page_p(pde) {
            return None;
        }
        self.lookup_l2((pde & L1_C_ADDR_MASK) as PAddr)
            .and_then(|t| t.ptes.as_deref())
    }

    /// Link the L2 table at `l2_phys` (mapped at `l2_va`) into the L1 slot
    /// covering `va`
    pub fn link_l2pt(&mut self, va: VAddr, l2_phys: PAddr, l2_va: VAddr) {
        assert!(
            l2_phys % L2_TABLE_SIZE_REAL == 0,
            "link_l2pt: L2 at {:#x} not 1KB aligned",
            l2_phys
        );
        if self.lookup_l2(l2_phys).is_none() {
            self.l2.push(BootL2 {
                phys: l2_phys,
                va: l2_va,
                ptes: Some(zeroed_table(L2_ENTRIES)),
            });
        }
        self.l1[l1_idx(va)].store(
            self.templates.l1_c_entry(l2_phys, PMAP_DOMAIN_KERNEL),
            Ordering::Relaxed,
        );
    }

    fn section_entry(&self, pa: PAddr, prot: VmProt, cache: CacheMode) -> u32 {
        let t = &self.templates;
        let mut pde = t.l1_s_proto
            | (pa as u32)
            | t.protection_bits(PteKind::Kernel, prot.can_write(), Granularity::Section)
            | t.cache_bits(cache, Granularity::Section)
            | l1_s_dom(PMAP_DOMAIN_KERNEL);
        if !prot.can_execute() {
            pde |= t.execute_never(Granularity::Section);
        }
        pde
    }

    fn large_entry(&self, pa: PAddr, prot: VmProt, cache: CacheMode) -> u32 {
        let t = &self.templates;
        let mut pte = t.l2_l_proto
            | (pa as u32)
            | t.protection_bits(PteKind::Kernel, prot.can_write(), Granularity::LargePage)
            | t.cache_bits(cache, Granularity::LargePage);
        if !prot.can_execute() {
            pte |= t.execute_never(Granularity::LargePage);
        }
        pte
    }

    /// Map one 1MB section
    pub fn map_section(&mut self, va: VAddr, pa: PAddr, prot: VmProt, cache: CacheMode) {
        assert!(
            (va | pa) & L1_S_OFFSET == 0,
            "map_section: unaligned va {:#x} pa {:#x}",
            va,
            pa
        );
        let pde = self.section_entry(pa, prot, cache);
        self.l1[l1_idx(va)].store(pde, Ordering::Relaxed);
    }

    /// Map one 4KB page through an already linked L2 table
    pub fn map_entry(&mut self, va: VAddr, pa: PAddr, prot: VmProt, cache: CacheMode) {
        assert!(
            (va | pa) & PAGE_MASK == 0,
            "map_entry: unaligned va {:#x} pa {:#x}",
            va,
            pa
        );
        let pte = self.templates.l2_s_entry(pa, PteKind::Kernel, prot, cache);
        match self.l2_table(va) {
            Some(ptes) => ptes[l2pte_index(va)].store(pte, Ordering::Relaxed),
            None => panic!("map_entry: no L2 table for va {:#x}", va),
        }
    }

    /// Map `size` bytes with the largest entries alignment allows
    ///
    /// Sections are used where both addresses are 1MB aligned and at least
    /// 1MB remains, then 64KB large pages, then 4KB pages. Returns the number
    /// of bytes mapped (`size` rounded up to a page).
    pub fn map_chunk(
        &mut self,
        mut va: VAddr,
        mut pa: PAddr,
        size: usize,
        prot: VmProt,
        cache: CacheMode,
    ) -> usize {
        let mapped = (size + PAGE_MASK) & !PAGE_MASK;
        let mut resid = mapped;
        crate::LTRACEF!(
            "map_chunk pa {:#x} va {:#x} size {:#x} prot {:?} cache {:?}",
            pa,
            va,
            size,
            prot,
            cache
        );

        while resid > 0 {
            if (va | pa) & L1_S_OFFSET == 0 && resid >= L1_S_SIZE {
                let pde = self.section_entry(pa, prot, cache);
                self.l1[l1_idx(va)].store(pde, Ordering::Relaxed);
                va += L1_S_SIZE;
                pa += L1_S_SIZE;
                resid -= L1_S_SIZE;
                continue;
            }

            let step = if (va | pa) & L2_L_OFFSET == 0 && resid >= L2_L_SIZE {
                let pte = self.large_entry(pa, prot, cache);
                let ptes = match self.l2_table(va) {
                    Some(ptes) => ptes,
                    None => panic!("map_chunk: no L2 table for va {:#x}", va),
                };
                let first = l2pte_index(va);
                for slot in &ptes[first..first + L2_L_REPLICAS] {
                    slot.store(pte, Ordering::Relaxed);
                }
                L2_L_SIZE
            } else {
                let pte = self.templates.l2_s_entry(pa, PteKind::Kernel, prot, cache);
                match self.l2_table(va) {
                    Some(ptes) => ptes[l2pte_index(va)].store(pte, Ordering::Relaxed),
                    None => panic!("map_chunk: no L2 table for va {:#x}", va),
                }
                PAGE_SIZE
            };
            va += step;
            pa += step;
            resid -= step;
        }
        mapped
    }

    /// Map every region of `table` and remember it for later lookups
    pub fn devmap_bootstrap(&mut self, table: &[DevMap]) {
        for dm in table.iter().filter(|dm| dm.size != 0) {
            crate::log_debug!(
                "devmap: {:#x}-{:#x} at {:#x}",
                dm.pa,
                dm.pa + dm.size - 1,
                dm.va
            );
            self.map_chunk(dm.va, dm.pa, dm.size, dm.prot, dm.cache);
        }
        self.devmap = table.to_vec();
    }
}

impl PmapContext {
    /// Take over the boot translation tables
    ///
    /// `managed` lists the physical ranges whose pages get reverse-mapping
    /// metadata; tracking starts with [`init`](Self::init). Kernel virtual
    /// space handed to the VM system is `[vstart, vend)`, minus the page-hook
    /// windows reserved at its start.
    ///
    /// # Panics
    ///
    /// Panics if a coarse L1 entry points at a table that was never linked
    /// with [`BootTables::link_l2pt`], or if a page table's own mapping
    /// cannot be found.
    pub fn bootstrap(
        config: PmapConfig,
        cpu: Arc<dyn CpuFuncs>,
        allocator: Arc<dyn PageAllocator>,
        managed: &[PhysRange],
        boot: BootTables,
        vstart: VAddr,
        vend: VAddr,
    ) -> Self {
        let templates = config.templates();

        let BootTables {
            l1_phys,
            l1_va,
            l1,
            l2: mut boot_l2,
            devmap,
            ..
        } = boot;
        let kernel_l1 = Arc::new(L1Table::from_entries(l1_phys, l1));
        let kernel_pmap = Pmap::new_kernel(kernel_l1.clone());

        // Rebuild the kernel's L2 metadata from the coarse entries.
        let mut tables = 0;
        for l1idx in 0..L1_ENTRIES {
            let pde = kernel_l1.entry(l1idx);
            if !l1pte_page_p(pde) {
                continue;
            }
            let pa = (pde & L1_C_ADDR_MASK) as PAddr;
            let ptes = boot_l2
                .iter_mut()
                .find(|t| t.phys == pa)
                .and_then(|t| t.ptes.take());
            let ptes = match ptes {
                Some(ptes) => ptes,
                None => panic!(
                    "bootstrap: no L2 for va {:#x}, pa {:#x}",
                    l1idx << L1_S_SHIFT,
                    pa
                ),
            };
            let occupancy = ptes
                .iter()
                .filter(|pte| pte.load(Ordering::Relaxed) & L2_TYPE_MASK != L2_TYPE_INV)
                .count() as u16;

            let dtable = kernel_pmap.l2[l2_idx(l1idx)].call_once(|| Box::new(L2Dtable::new()));
            dtable.install(l2_bucket(l1idx), L2Bucket::from_table(pa, l1idx, ptes, occupancy));
            tables += 1;
        }

        let ctx = Self {
            config,
            templates,
            cpu,
            allocator,
            kernel_pmap,
            kernel_l1,
            l1_registry: L1Registry::new(),
            domains: DomainAllocator::new(),
            ptp_pool: L2PtpPool::new(),
            pages: PhysPageTable::new(managed),
            main_lock: spin::RwLock::new(()),
            current: spin::Mutex::new(None),
            current_id: AtomicUsize::new(super::NO_PMAP),
            next_id: AtomicUsize::new(KERNEL_PMAP_ID + 1),
            initialized: AtomicBool::new(false),
            curmaxkvaddr: spin::Mutex::new(vstart),
            virtual_avail: vstart + 2 * PAGE_SIZE,
            virtual_end: vend,
            csrc_va: vstart,
            cdst_va: vstart + PAGE_SIZE,
            hook_lock: spin::Mutex::new(()),
            devmap: spin::RwLock::new(devmap),
        };

        // The tables themselves must be mapped with the page-table cache mode.
        for t in boot_l2.iter() {
            if ctx.set_pt_cache_mode(t.va) {
                crate::log_warn!(
                    "bootstrap: wrong cache mode for L2 table {:#x} at va {:#x}",
                    t.phys,
                    t.va
                );
            }
        }
        for va in (l1_va..l1_va + L1_TABLE_SIZE).step_by(PAGE_SIZE) {
            if ctx.set_pt_cache_mode(va) {
                crate::log_warn!("bootstrap: wrong cache mode for kernel L1 at va {:#x}", va);
            }
        }

        ctx.cpu.dcache_wbinv_all();
        ctx.cpu.tlb_flush_id();
        ctx.cpu.cpwait();

        for va in [ctx.csrc_va, ctx.cdst_va] {
            if ctx.get_l2_bucket(&ctx.kernel_pmap, va).is_none() {
                panic!("bootstrap: no L2 table for page hook va {:#x}", va);
            }
        }

        // Kernel VA is usable up to the first 1MB without an L2 table.
        let mut maxkva = vstart & !L1_S_OFFSET;
        while maxkva < vend && ctx.get_l2_bucket(&ctx.kernel_pmap, maxkva).is_some() {
            maxkva += L1_S_SIZE;
        }
        *ctx.curmaxkvaddr.lock() = maxkva;

        ctx.l1_registry.register(&ctx.kernel_l1, None);

        crate::log_info!(
            "pmap: {:?} MMU, {} kernel L2 tables, kva {:#x}-{:#x} (L2 to {:#x})",
            ctx.config.variant,
            tables,
            ctx.virtual_avail,
            ctx.virtual_end,
            maxkva
        );
        ctx
    }

    /// Force the page-table cache mode on the kernel mapping of `va`
    ///
    /// Returns true if the mapping had to be fixed.
    fn set_pt_cache_mode(&self, va: VAddr) -> bool {
        let t = &self.templates;
        let l1idx = l1_idx(va);
        let pde = self.kernel_l1.entry(l1idx);

        if l1pte_section_p(pde) {
            if pde & t.l1_s_cache_mask == t.l1_s_cache_mode_pt {
                return false;
            }
            self.kernel_l1
                .set_entry(l1idx, (pde & !t.l1_s_cache_mask) | t.l1_s_cache_mode_pt);
            self.pte_sync(self.kernel_l1.entry_addr(l1idx));
            self.cpu.dcache_wbinv_range(self.kernel_l1.entry_addr(l1idx), 4);
            return true;
        }

        let l2b = match self.get_l2_bucket(&self.kernel_pmap, va) {
            Some(l2b) => l2b,
            None => panic!("bootstrap: no L2 for page table at va {:#x}", va),
        };
        let pte = l2b.pte(va);
        let (mask, mode) = if l2pte_large_p(pte) {
            (t.l2_l_cache_mask, t.l2_l_cache_mode_pt)
        } else {
            (t.l2_s_cache_mask, t.l2_s_cache_mode_pt)
        };
        if pte & mask == mode {
            return false;
        }
        l2b.set_pte(va, (pte & !mask) | mode);
        self.pte_sync(l2b.pte_addr(va));
        self.cpu.dcache_wbinv_range(l2b.pte_addr(va), 4);
        true
    }

    /// Start tracking managed pages
    ///
    /// Mappings entered before this call are treated as unmanaged.
    pub fn init(&self) {
        self.initialized.store(true, Ordering::Release);
        crate::log_info!("pmap: tracking {} managed pages", self.pages.page_count());
    }

    /// Kernel virtual range available to the VM system
    pub fn virtual_space(&self) -> (VAddr, VAddr) {
        (self.virtual_avail, self.virtual_end)
    }

    /// Current end of the kernel VA backed by L2 tables
    pub fn kernel_va_limit(&self) -> VAddr {
        *self.curmaxkvaddr.lock()
    }

    /// Make sure kernel L2 tables exist up to `maxkvaddr`
    ///
    /// Returns the new limit. It falls short of `maxkvaddr` only when table
    /// memory runs out.
    pub fn growkernel(&self, maxkvaddr: VAddr) -> VAddr {
        let kpm = &self.kernel_pmap;
        let mut curmax = self.curmaxkvaddr.lock();
        if maxkvaddr <= *curmax {
            return *curmax;
        }
        debug_assert!(maxkvaddr <= self.virtual_end);
        crate::log_debug!("growkernel: {:#x} -> {:#x}", *curmax, maxkvaddr);

        let inner = kpm.inner.lock();
        while *curmax < maxkvaddr {
            let l2b = match self.alloc_l2_bucket_locked(kpm, &inner, *curmax) {
                Ok(l2b) => l2b,
                Err(_) => {
                    crate::log_warn!("growkernel: out of L2 tables at {:#x}", *curmax);
                    break;
                }
            };

            // Every L1 shares the kernel half.
            let l1idx = l1_idx(*curmax);
            let pde = self.templates.l1_c_entry(l2b.phys(), PMAP_DOMAIN_KERNEL);
            self.l1_registry.for_each(|l1| {
                l1.set_entry(l1idx, pde);
                self.pte_sync(l1.entry_addr(l1idx));
            });
            *curmax += L1_S_SIZE;
        }
        drop(inner);

        self.cpu.dcache_wbinv_all();
        self.cpu.tlb_flush_d();
        self.cpu.cpwait();
        *curmax
    }

    // ------------------------------------------------------------------------
    // Static device maps
    // ------------------------------------------------------------------------

    /// Replace the device map table used for lookups
    pub fn devmap_register(&self, table: &[DevMap]) {
        *self.devmap.write() = table.iter().filter(|dm| dm.size != 0).copied().collect();
    }

    /// Device region containing `[pa, pa + size)`
    pub fn devmap_find_pa(&self, pa: PAddr, size: usize) -> Option<DevMap> {
        self.devmap.read().iter().find(|dm| dm.covers_pa(pa, size)).copied()
    }

    /// Device region containing `[va, va + size)`
    pub fn devmap_find_va(&self, va: VAddr, size: usize) -> Option<DevMap> {
        self.devmap.read().iter().find(|dm| dm.covers_va(va, size)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::arch::arm::pte::{l1pte_section_p, l2pte_large_p, L2_TYPE_S};

    const L1_PA: PAddr = 0x8000_4000;
    const L1_VA: VAddr = 0xc000_4000;

    fn boot() -> BootTables {
        BootTables::new(&PmapConfig::generic(), L1_PA, L1_VA)
    }

    #[test]
    fn test_link_l2pt() {
        let mut b = boot();
        b.link_l2pt(0xc100_0000, 0x8000_8400, 0xc000_8400);
        let pde = b.l1_entry(l1_idx(0xc100_0000));
        assert!(l1pte_page_p(pde));
        assert_eq!((pde & L1_C_ADDR_MASK) as PAddr, 0x8000_8400);
        assert_eq!(b.l2_entry(0xc100_0000), Some(0));
        assert_eq!(b.l2_entry(0xc200_0000), None);
    }

    #[test]
    fn test_map_chunk_granularity() {
        let mut b = boot();
        b.link_l2pt(0xc010_0000, 0x8000_8000, 0xc000_8000);

        // 1MB section, then 64KB large page, then one 4KB page.
        let size = L1_S_SIZE + L2_L_SIZE + PAGE_SIZE;
        let mapped = b.map_chunk(0xc000_0000, 0x8000_0000, size, VmProt::RW, CacheMode::WriteBack);
        assert_eq!(mapped, size);

        assert!(l1pte_section_p(b.l1_entry(l1_idx(0xc000_0000))));

        let large = b.l2_entry(0xc010_0000).unwrap();
        assert!(l2pte_large_p(large));
        assert_eq!(b.l2_entry(0xc010_f000), Some(large));

        let small = b.l2_entry(0xc011_0000).unwrap();
        assert_eq!(small & L2_TYPE_MASK, L2_TYPE_S);
        assert_eq!(small as PAddr & !PAGE_MASK, 0x8011_0000);
        assert_eq!(b.l2_entry(0xc011_1000), Some(0));
    }

    #[test]
    fn test_map_chunk_rounds_up() {
        let mut b = boot();
        b.link_l2pt(0xc000_0000, 0x8000_8000, 0xc000_8000);
        let mapped = b.map_chunk(0xc000_1000, 0x8000_1000, 100, VmProt::READ, CacheMode::Device);
        assert_eq!(mapped, PAGE_SIZE);
        assert_ne!(b.l2_entry(0xc000_1000), Some(0));
    }

    #[test]
    #[should_panic(expected = "map_chunk: no L2 table")]
    fn test_map_chunk_without_l2() {
        let mut b = boot();
        b.map_chunk(0xc000_1000, 0x8000_1000, PAGE_SIZE, VmProt::READ, CacheMode::WriteBack);
    }

    #[test]
    fn test_devmap_lookup() {
        let mut b = boot();
        let table = [DevMap {
            va: 0xfd00_0000,
            pa: 0x1000_0000,
            size: L1_S_SIZE,
            prot: VmProt::RW,
            cache: CacheMode::Device,
        }];
        b.devmap_bootstrap(&table);
        assert!(l1pte_section_p(b.l1_entry(l1_idx(0xfd00_0000))));
        assert_eq!(b.devmap.len(), 1);
        assert!(b.devmap[0].covers_pa(0x1000_1000, 0x100));
        assert!(!b.devmap[0].covers_pa(0x100f_ff00, 0x200));
        assert!(b.devmap[0].covers_va(0xfd0f_f000, PAGE_SIZE));
    }
}
