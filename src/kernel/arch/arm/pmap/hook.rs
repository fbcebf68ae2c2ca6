// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Page Zero and Copy Hooks
//!
//! Physical pages are zeroed and copied through two kernel windows reserved
//! at bootstrap. The source window is mapped read-only and the destination
//! read/write; both are flushed from the TLB before use and cleaned from the
//! data cache afterwards.
//!
//! XScale maps the windows through the mini-data cache so bulk copies do not
//! evict the main data cache; cleaning the mini-data cache replaces the
//! range flushes.

use super::PmapContext;
use crate::kernel::arch::arm::pte::{MmuVariant, PteKind};
use crate::kernel::vm::layout::{is_page_aligned, PAddr, VAddr, L2_S_FRAME, PAGE_SIZE};

#[allow(dead_code)]
const LOCAL_TRACE: bool = false;

impl PmapContext {
    /// Descriptor for a page hook window
    fn hook_pte(&self, pa: PAddr, writable: bool) -> u32 {
        let t = &self.templates;
        t.l2_s_proto
            | (pa as u32 & L2_S_FRAME as u32)
            | t.l2_s_prot(PteKind::Kernel, writable)
            | t.l2_s_hook_cache_mode()
    }

    /// Point a hook window at `pa`
    fn map_hook(&self, va: VAddr, pa: PAddr, writable: bool) {
        let l2b = match self.get_l2_bucket(&self.kernel_pmap, va) {
            Some(l2b) => l2b,
            None => panic!("page hook: no L2 table for va {:#x}", va),
        };
        l2b.set_pte(va, self.hook_pte(pa, writable));
        self.pte_sync(l2b.pte_addr(va));
    }

    /// Fill the physical page at `pa` with zeros
    pub fn zero_page(&self, pa: PAddr) {
        assert!(is_page_aligned(pa), "zero_page: unaligned pa {:#x}", pa);
        if let Some(pg) = self.pages.lookup(pa) {
            debug_assert!(pg.mapping_count() == 0, "zero_page: page has mappings");
        }

        let _hook = self.hook_lock.lock();
        let dst = self.cdst_va;

        self.map_hook(dst, pa, true);
        self.cpu.tlb_flush_d_se(dst);
        self.cpu.cpwait();
        self.cpu.zero_page(dst);

        match self.config.variant {
            MmuVariant::XScale => self.cpu.xscale_cache_clean_minidata(),
            _ => self.cpu.dcache_wbinv_range(dst, PAGE_SIZE),
        }
        crate::LTRACEF!("zero_page pa {:#x}", pa);
    }

    /// Copy the physical page at `src` to `dst`
    ///
    /// The source page lock is held across the copy so no new mapping can
    /// create an alias while the window is live.
    pub fn copy_page(&self, src: PAddr, dst: PAddr) {
        assert!(
            is_page_aligned(src) && is_page_aligned(dst),
            "copy_page: unaligned src {:#x} dst {:#x}",
            src,
            dst
        );
        if let Some(pg) = self.pages.lookup(dst) {
            debug_assert!(pg.mapping_count() == 0, "copy_page: dst page has mappings");
        }

        let src_md = self.pages.lookup(src).map(|pg| pg.lock());
        if let Some(md) = src_md.as_deref() {
            self.clean_page(md, true);
        }

        let _hook = self.hook_lock.lock();
        let (csrc, cdst) = (self.csrc_va, self.cdst_va);

        self.map_hook(csrc, src, false);
        self.map_hook(cdst, dst, true);
        self.cpu.tlb_flush_d_se(csrc);
        self.cpu.tlb_flush_d_se(cdst);
        self.cpu.cpwait();
        self.cpu.copy_page(csrc, cdst);

        match self.config.variant {
            MmuVariant::XScale => {
                drop(src_md);
                self.cpu.xscale_cache_clean_minidata();
            }
            _ => {
                self.cpu.dcache_inv_range(csrc, PAGE_SIZE);
                drop(src_md);
                self.cpu.dcache_wbinv_range(cdst, PAGE_SIZE);
            }
        }
        crate::LTRACEF!("copy_page {:#x} -> {:#x}", src, dst);
    }
}
