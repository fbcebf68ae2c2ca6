// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Mapping Operations
//!
//! Installing, removing, write-protecting and looking up mappings, the
//! referenced/modified emulation done from the fault path, and the wired
//! unmanaged kernel mappings used by drivers and the VM system.
//!
//! # Referenced/Modified Emulation
//!
//! ARMv4/v5 MMUs have no hardware referenced or dirty bits. A managed page
//! that has not been accessed yet is entered with an invalid descriptor type
//! and a page that has not been written is entered read-only; the resulting
//! faults land in [`PmapContext::fault_fixup`], which records the attribute
//! and upgrades the entry.
//!
//! # Ordering
//!
//! Every change writes the descriptor, writes it back from the D-cache when
//! the table walker needs that, invalidates the TLB entry and finally waits
//! for the coprocessor (`cpwait`).

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::l2::L2Bucket;
use super::page::PvFlags;
use super::{EnterFlags, Pmap, PmapContext};
use crate::kernel::arch::arm::pte::{
    l1pte_section_p, l2pte_large_p, l2pte_pa, l2pte_valid, CacheMode, PteKind, L1_S_ADDR_MASK,
    L2_TYPE_INV, L2_TYPE_MASK,
};
use crate::kernel::vm::layout::{
    is_page_aligned, is_user_vaddr, l1_idx, l2_next_bucket, PAddr, VAddr, L1_S_OFFSET,
    L2_L_FRAME, L2_L_OFFSET, L2_S_FRAME, L2_S_OFFSET, PAGE_SIZE,
};
use crate::kernel::vm::{Result, VmError, VmProt};

#[allow(dead_code)]
const LOCAL_TRACE: bool = false;

/// Entries cleaned one at a time by `remove` before it switches to a
/// whole-cache flush
const REMOVE_CLEAN_LIST_SIZE: usize = 3;

/// Ranges of at least this many pages are write-protected with one full TLB
/// flush
const PROTECT_FULL_FLUSH_PAGES: usize = 4;

impl PmapContext {
    /// Map `pa` at `va` in `pm` with protection `prot`
    ///
    /// An existing mapping at `va` is replaced. `flags` carries the access
    /// that caused the call (the mapping starts referenced, and modified for
    /// a write) and whether the mapping is wired.
    ///
    /// Fails with [`VmError::NoMemory`] if a table could not be allocated;
    /// nothing is changed in that case.
    pub fn enter(
        &self,
        pm: &Arc<Pmap>,
        va: VAddr,
        pa: PAddr,
        prot: VmProt,
        flags: EnterFlags,
    ) -> Result {
        assert!(
            is_page_aligned(va) && is_page_aligned(pa),
            "enter: unaligned va {:#x} pa {:#x}",
            va,
            pa
        );
        assert!(!pm.destroyed.load(Ordering::Acquire), "enter: pmap {} destroyed", pm.id);
        assert!(
            pm.kernel || is_user_vaddr(va),
            "enter: kernel va {:#x} in user pmap {}",
            va,
            pm.id
        );
        crate::LTRACEF!(
            "enter pmap {} va {:#x} pa {:#x} prot {:?} flags {:?}",
            pm.id,
            va,
            pa,
            prot,
            flags
        );

        let tmpl = &self.templates;
        let kind = if pm.kernel { PteKind::Kernel } else { PteKind::User };
        let access = flags.access();

        let _main = self.main_lock.read();
        let mut inner = pm.inner.lock();

        let l2b = if pm.kernel {
            // Kernel tables come from bootstrap and growkernel only.
            self.get_l2_bucket(pm, va).ok_or_else(|| {
                crate::log_warn!("enter: no kernel L2 table for va {:#x}", va);
                VmError::NoMemory
            })?
        } else {
            self.ensure_l1(pm, &mut inner)?;
            self.alloc_l2_bucket_locked(pm, &inner, va)?
        };

        let pg = self.managed_page(pa);

        // Managed pages carry their wiring in the reverse mapping.
        self.set_unmanaged_wiring(
            pm,
            l2b,
            va,
            pg.is_none() && flags.contains(EnterFlags::WIRED),
        );

        let mut nflags = PvFlags::empty();
        if prot.can_write() {
            nflags |= PvFlags::WRITE;
        }
        if prot.can_execute() {
            nflags |= PvFlags::EXEC;
        }
        if flags.contains(EnterFlags::WIRED) {
            nflags |= PvFlags::WIRED;
        }

        let opte = l2b.pte(va);
        let mut oflags = PvFlags::empty();

        let opg = if opte == 0 {
            None
        } else if l2pte_pa(opte) == pa {
            pg
        } else {
            self.managed_page(l2pte_pa(opte))
        };

        let npte = match pg {
            Some(pg) => {
                let attrs = pg.attrs();
                let referenced = !access.is_empty() || attrs.contains(PvFlags::REF);
                // Write access is only granted to a referenced mapping.
                let writable = referenced
                    && prot.can_write()
                    && (access.can_write() || attrs.contains(PvFlags::MOD));

                if referenced {
                    nflags |= PvFlags::REF;
                }
                if writable {
                    nflags |= PvFlags::MOD;
                }

                let kind_bits = if referenced {
                    tmpl.l2_s_proto_exec(prot.can_execute())
                } else {
                    // Reference emulation: fault on first access.
                    L2_TYPE_INV
                };

                let same_page = opg.map_or(false, |o| core::ptr::eq(o, pg));
                if same_page {
                    // Changing the protection or wiring of an existing mapping.
                    let mut md = pg.lock();
                    oflags = self.modify_pv(
                        &mut md,
                        pm,
                        va,
                        PvFlags::WRITE
                            | PvFlags::EXEC
                            | PvFlags::WIRED
                            | PvFlags::MOD
                            | PvFlags::REF,
                        nflags,
                    );
                    drop(md);

                    // Write-protecting a cached page: flush dirty lines.
                    if pm.cache_state().cache_d
                        && !oflags.intersects(PvFlags::NC)
                        && tmpl.l2_s_writable(opte)
                        && !prot.can_write()
                    {
                        self.cpu.dcache_wb_range(va, PAGE_SIZE);
                    }
                } else {
                    if let Some(opg) = opg {
                        oflags = self.unlink_old_mapping(pm, va, opte, opg);
                    }
                    let mut md = pg.lock();
                    self.enter_pv(&mut md, pm, va, nflags);
                }

                kind_bits
                    | (pa as u32 & L2_S_FRAME as u32)
                    | tmpl.l2_s_prot(kind, writable)
                    | tmpl.l2_s_cache_mode
            }
            None => {
                // Unmanaged memory: no emulation, no caching.
                if let Some(opg) = opg {
                    oflags = self.unlink_old_mapping(pm, va, opte, opg);
                }
                tmpl.l2_s_proto_exec(prot.can_execute())
                    | (pa as u32 & L2_S_FRAME as u32)
                    | tmpl.l2_s_prot(kind, prot.can_write())
            }
        };

        if opte == 0 {
            l2b.inc_occupancy();
            pm.resident.fetch_add(1, Ordering::Relaxed);
        }

        if npte != opte {
            let is_cached = self.is_cached(pm);
            l2b.set_pte(va, npte);
            if is_cached {
                self.pte_sync(l2b.pte_addr(va));

                // Make sure the L1 points at the table.
                if l2pte_valid(npte) {
                    if let (Some(l1), Some(domain)) = (inner.l1.as_ref(), pm.domain()) {
                        let l1idx = l1_idx(va);
                        let l1pd = tmpl.l1_c_entry(l2b.phys(), domain);
                        if l1.entry(l1idx) != l1pd {
                            l1.set_entry(l1idx, l1pd);
                            self.pte_sync(l1.entry_addr(l1idx));
                        }
                    }
                }
            }

            if oflags.been_execd() {
                self.tlb_flush_id_se(pm, va);
            } else if oflags.been_refd() {
                self.tlb_flush_d_se(pm, va);
            }

            if let Some(pg) = pg {
                let mut md = pg.lock();
                self.vac_me_harder(&mut md, pm, va);
            }
        }
        Ok(())
    }

    /// Drop the reverse mapping of a page being replaced at `va`
    ///
    /// Cleans its cache lines if the old entry was live; returns its flags.
    fn unlink_old_mapping(
        &self,
        pm: &Pmap,
        va: VAddr,
        opte: u32,
        opg: &super::page::VmPage,
    ) -> PvFlags {
        let mut md = opg.lock();
        let pve = match self.remove_pv(&mut md, pm, va) {
            Some(pve) => pve,
            None => panic!(
                "enter: no reverse mapping for pmap {} va {:#x} pa {:#x}",
                pm.id,
                va,
                opg.phys()
            ),
        };
        self.vac_me_harder(&mut md, pm, 0);
        drop(md);

        let oflags = pve.flags;
        if !oflags.intersects(PvFlags::NC) && l2pte_valid(opte) {
            if oflags.been_execd() {
                self.idcache_wbinv_range(pm, va, PAGE_SIZE);
            } else if oflags.been_refd() {
                let rd_only = !oflags.contains(PvFlags::WRITE);
                self.dcache_wb_range(pm, va, PAGE_SIZE, true, rd_only);
            }
        }
        oflags
    }

    /// Remove every mapping in `[sva, eva)`
    ///
    /// Unmapped addresses are skipped. Up to three live entries are cleaned
    /// from the cache one page at a time; beyond that the whole cache is
    /// flushed and TLB invalidation is left to [`update`](Self::update).
    pub fn remove(&self, pm: &Arc<Pmap>, mut sva: VAddr, eva: VAddr) {
        crate::LTRACEF!("remove pmap {} {:#x}-{:#x}", pm.id, sva, eva);

        let _main = self.main_lock.read();
        let mut inner = pm.inner.lock();

        // (va, was executed) of entries awaiting cleaning
        let mut cleanlist = [(0usize, false); REMOVE_CLEAN_LIST_SIZE];
        let mut cleanlist_idx;

        if inner.remove_all || !self.is_cached(pm) {
            cleanlist_idx = REMOVE_CLEAN_LIST_SIZE + 1;
            if !pm.cache_state().any_tlb() {
                inner.remove_all = true;
            }
        } else {
            cleanlist_idx = 0;
        }

        let mut total = 0;

        while sva < eva {
            let next_bucket = core::cmp::min(l2_next_bucket(sva), eva);

            let l2b = match self.get_l2_bucket(pm, sva) {
                Some(l2b) => l2b,
                None => {
                    sva = next_bucket;
                    continue;
                }
            };

            let mut mappings = 0u16;
            while sva < next_bucket {
                let pte = l2b.pte(sva);
                if pte == 0 {
                    sva += PAGE_SIZE;
                    continue;
                }

                pm.resident.fetch_sub(1, Ordering::Relaxed);
                self.set_unmanaged_wiring(pm, l2b, sva, false);
                let mut is_exec = false;
                let mut is_refd = true;

                if let Some(pg) = self.managed_page(l2pte_pa(pte)) {
                    let mut md = pg.lock();
                    let pve = self.remove_pv(&mut md, pm, sva);
                    self.vac_me_harder(&mut md, pm, 0);
                    if let Some(pve) = pve {
                        if !inner.remove_all {
                            is_exec = pve.flags.been_execd();
                            is_refd = pve.flags.been_refd();
                        }
                    }
                }

                if !l2pte_valid(pte) {
                    // Never reached the TLB or the cache.
                    l2b.set_pte(sva, 0);
                    self.pte_sync_current(pm, l2b.pte_addr(sva));
                    sva += PAGE_SIZE;
                    mappings += 1;
                    continue;
                }

                if cleanlist_idx < REMOVE_CLEAN_LIST_SIZE {
                    cleanlist[cleanlist_idx] = (sva, is_exec);
                    cleanlist_idx += 1;
                } else if cleanlist_idx == REMOVE_CLEAN_LIST_SIZE {
                    // Too many: flush everything and stop tracking.
                    self.idcache_wbinv_all(pm);
                    self.tlb_flush_id(pm);
                    for &(clva, _) in cleanlist.iter() {
                        l2b.set_pte(clva, 0);
                        self.pte_sync(l2b.pte_addr(clva));
                    }
                    l2b.set_pte(sva, 0);
                    self.pte_sync(l2b.pte_addr(sva));
                    cleanlist_idx += 1;
                    inner.remove_all = true;
                } else {
                    l2b.set_pte(sva, 0);
                    self.pte_sync(l2b.pte_addr(sva));
                    if !inner.remove_all {
                        if is_exec {
                            self.tlb_flush_id_se(pm, sva);
                        } else if is_refd {
                            self.tlb_flush_d_se(pm, sva);
                        }
                    }
                }

                sva += PAGE_SIZE;
                mappings += 1;
            }

            // Leftovers
            if cleanlist_idx <= REMOVE_CLEAN_LIST_SIZE {
                total += cleanlist_idx;
                for &(clva, exec) in cleanlist[..cleanlist_idx].iter() {
                    let cached = pm.cache_state().any();
                    // The TLB helpers record a debt when they cannot flush.
                    if exec {
                        if cached {
                            self.idcache_wbinv_range(pm, clva, PAGE_SIZE);
                        }
                        self.tlb_flush_id_se(pm, clva);
                    } else {
                        if cached {
                            self.dcache_wb_range(pm, clva, PAGE_SIZE, true, false);
                        }
                        self.tlb_flush_d_se(pm, clva);
                    }
                    l2b.set_pte(clva, 0);
                    self.pte_sync_current(pm, l2b.pte_addr(clva));
                }

                if total <= REMOVE_CLEAN_LIST_SIZE {
                    cleanlist_idx = 0;
                } else {
                    cleanlist_idx = REMOVE_CLEAN_LIST_SIZE + 1;
                    self.idcache_wbinv_all(pm);
                    inner.remove_all = true;
                }
            }

            l2b.dec_occupancy(mappings);
        }
    }

    /// Reduce the protection of `[sva, eva)` to `prot`
    ///
    /// Removing read access removes the mappings; adding write access is
    /// ignored (the fault path grants it). Everything else write-protects.
    pub fn protect(&self, pm: &Arc<Pmap>, mut sva: VAddr, eva: VAddr, prot: VmProt) {
        crate::LTRACEF!("protect pmap {} {:#x}-{:#x} {:?}", pm.id, sva, eva, prot);

        if !prot.can_read() {
            self.remove(pm, sva, eva);
            return;
        }
        if prot.can_write() {
            return;
        }

        let tmpl = &self.templates;
        {
            let _main = self.main_lock.read();
            let _inner = pm.inner.lock();

            self.dcache_wb_range(pm, sva, eva - sva, false, false);

            // None: flush per page. Some: count pages for one full flush.
            let mut batched: Option<usize> =
                (eva - sva >= PAGE_SIZE * PROTECT_FULL_FLUSH_PAGES).then_some(0);
            let mut flags = PvFlags::empty();

            while sva < eva {
                let next_bucket = core::cmp::min(l2_next_bucket(sva), eva);

                let l2b = match self.get_l2_bucket(pm, sva) {
                    Some(l2b) => l2b,
                    None => {
                        sva = next_bucket;
                        continue;
                    }
                };

                while sva < next_bucket {
                    let pte = l2b.pte(sva);
                    if pte != 0 && tmpl.l2_s_writable(pte) {
                        l2b.set_pte(sva, tmpl.l2_s_clear_writable(pte));
                        self.pte_sync(l2b.pte_addr(sva));

                        let f = match self.managed_page(l2pte_pa(pte)) {
                            Some(pg) => {
                                let mut md = pg.lock();
                                let f =
                                    self.modify_pv(&mut md, pm, sva, PvFlags::WRITE, PvFlags::empty());
                                self.vac_me_harder(&mut md, pm, sva);
                                f
                            }
                            None => PvFlags::REF | PvFlags::EXEC,
                        };

                        match batched.as_mut() {
                            Some(count) => {
                                *count += 1;
                                flags |= f;
                            }
                            None if f.been_execd() => self.tlb_flush_id_se(pm, sva),
                            None if f.been_refd() => self.tlb_flush_d_se(pm, sva),
                            None => {}
                        }
                    }
                    sva += PAGE_SIZE;
                }
            }

            if batched.map_or(false, |count| count > 0) {
                if flags.been_execd() {
                    self.tlb_flush_id(pm);
                } else if flags.been_refd() {
                    self.tlb_flush_d(pm);
                }
            }
        }
    }

    /// Translate `va` in `pm`
    pub fn extract(&self, pm: &Pmap, va: VAddr) -> Option<PAddr> {
        let inner = pm.inner.lock();

        if let Some(l1) = inner.l1.as_ref() {
            let l1pd = l1.entry_for(va);
            if l1pte_section_p(l1pd) {
                return Some((l1pd & L1_S_ADDR_MASK) as PAddr | (va & L1_S_OFFSET));
            }
        }

        // The L1 entry alone does not prove a mapping exists.
        let l2b = self.get_l2_bucket(pm, va)?;
        let pte = l2b.pte(va);
        if pte == 0 {
            return None;
        }
        let pa = if l2pte_large_p(pte) {
            (pte as PAddr & L2_L_FRAME) | (va & L2_L_OFFSET)
        } else {
            (pte as PAddr & L2_S_FRAME) | (va & L2_S_OFFSET)
        };
        Some(pa)
    }

    /// Resolve a fault the pmap can handle by itself
    ///
    /// Handles write faults on pages entered read-only for modify emulation,
    /// accesses to pages entered invalid for reference emulation, a missing
    /// L1 link and stale TLB entries. Returns false for faults the VM system
    /// must handle (nothing mapped, or a genuine protection violation).
    pub fn fault_fixup(&self, pm: &Arc<Pmap>, va: VAddr, ftype: VmProt, user: bool) -> bool {
        let tmpl = &self.templates;

        let _main = self.main_lock.read();
        let inner = pm.inner.lock();

        let l2b = match self.get_l2_bucket(pm, va) {
            Some(l2b) => l2b,
            None => return false,
        };
        let pte = l2b.pte(va);
        if pte == 0 {
            return false;
        }
        if user && !tmpl.l2_s_user(pte) {
            return false;
        }

        let pa = l2pte_pa(pte);

        if ftype.can_write() && !tmpl.l2_s_writable(pte) {
            // Modify emulation
            let pg = match self.managed_page(pa) {
                Some(pg) => pg,
                None => return false,
            };
            let mut md = pg.lock();
            let idx = match self.find_pv(&md, pm, va) {
                Some(idx) => idx,
                None => return false,
            };
            let pv_flags = md.pvh_list[idx].flags;
            if !pv_flags.contains(PvFlags::WRITE) {
                return false;
            }
            crate::log_trace!("fault_fixup: mod emul pmap {} va {:#x} pa {:#x}", pm.id, va, pa);

            md.attrs |= PvFlags::REF | PvFlags::MOD;
            md.pvh_list[idx].flags |= PvFlags::REF | PvFlags::MOD;
            drop(md);

            let npte = tmpl.l2_s_set_writable(tmpl.l2_s_revalidate(pte, pv_flags.contains(PvFlags::EXEC)));
            l2b.set_pte(va, npte);
            self.pte_sync(l2b.pte_addr(va));
        } else if pte & L2_TYPE_MASK == L2_TYPE_INV {
            // Reference emulation
            let pg = match self.managed_page(pa) {
                Some(pg) => pg,
                None => return false,
            };
            let mut md = pg.lock();
            let idx = match self.find_pv(&md, pm, va) {
                Some(idx) => idx,
                None => return false,
            };
            let pv_flags = md.pvh_list[idx].flags;
            crate::log_trace!("fault_fixup: ref emul pmap {} va {:#x} pa {:#x}", pm.id, va, pa);

            md.attrs |= PvFlags::REF;
            md.pvh_list[idx].flags |= PvFlags::REF;
            drop(md);

            let npte = tmpl.l2_s_revalidate(pte, pv_flags.contains(PvFlags::EXEC));
            l2b.set_pte(va, npte);
            self.pte_sync(l2b.pte_addr(va));
        }

        // The L1 may not point at the table yet, or the TLB holds a stale
        // entry from before the mapping changed.
        if let (Some(l1), Some(domain)) = (inner.l1.as_ref(), pm.domain()) {
            let l1idx = l1_idx(va);
            let l1pd = tmpl.l1_c_entry(l2b.phys(), domain);
            if l1.entry(l1idx) != l1pd {
                l1.set_entry(l1idx, l1pd);
                self.pte_sync(l1.entry_addr(l1idx));
            }
        }

        self.cpu.tlb_flush_id_se(va);
        self.cpu.cpwait();
        true
    }

    /// Clear the wired flag of the mapping at `va`
    pub fn unwire(&self, pm: &Arc<Pmap>, va: VAddr) {
        let _main = self.main_lock.read();
        let _inner = pm.inner.lock();

        let l2b = match self.get_l2_bucket(pm, va) {
            Some(l2b) => l2b,
            None => panic!("unwire: no L2 table for pmap {} va {:#x}", pm.id, va),
        };
        let pte = l2b.pte(va);
        self.set_unmanaged_wiring(pm, l2b, va, false);
        if let Some(pg) = self.managed_page(l2pte_pa(pte)) {
            let mut md = pg.lock();
            self.modify_pv(&mut md, pm, va, PvFlags::WIRED, PvFlags::empty());
        }
    }

    /// Track the wiring of an entry that has no reverse mapping
    fn set_unmanaged_wiring(&self, pm: &Pmap, l2b: &L2Bucket, va: VAddr, wired: bool) {
        match (l2b.set_unmanaged_wired(va, wired), wired) {
            (false, true) => {
                pm.wired.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                pm.wired.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------------
    // Unmanaged kernel mappings
    // ------------------------------------------------------------------------

    /// Enter a wired, cached kernel mapping that is not tracked per page
    pub fn kenter_pa(&self, va: VAddr, pa: PAddr, prot: VmProt) {
        self.kenter_cache(va, pa, prot, CacheMode::WriteBack);
    }

    /// Enter a wired kernel mapping with an explicit cache mode
    ///
    /// The kernel L2 table for `va` must already exist.
    pub fn kenter_cache(&self, va: VAddr, pa: PAddr, prot: VmProt, mode: CacheMode) {
        let kpm = &self.kernel_pmap;
        let l2b = match self.get_l2_bucket(kpm, va) {
            Some(l2b) => l2b,
            None => panic!("kenter_pa: no L2 table for va {:#x}", va),
        };

        let opte = l2b.pte(va);
        if l2pte_valid(opte) {
            self.cpu.dcache_wbinv_range(va, PAGE_SIZE);
            self.tlb_flush_d_se(kpm, va);
            self.cpu.cpwait();
        } else if opte == 0 {
            l2b.inc_occupancy();
        }

        let npte = self.templates.l2_s_entry(pa, PteKind::Kernel, prot, mode);
        l2b.set_pte(va, npte);
        self.pte_sync(l2b.pte_addr(va));
        crate::LTRACEF!("kenter_pa va {:#x} pa {:#x} pte {:#x}", va, pa, npte);
    }

    /// Remove unmanaged kernel mappings in `[va, va + len)`
    pub fn kremove(&self, mut va: VAddr, len: usize) {
        let kpm = &self.kernel_pmap;
        let eva = va + len;

        while va < eva {
            let next_bucket = core::cmp::min(l2_next_bucket(va), eva);

            let l2b = match self.get_l2_bucket(kpm, va) {
                Some(l2b) => l2b,
                None => panic!("kremove: no L2 table for va {:#x}", va),
            };

            let mut mappings = 0u16;
            while va < next_bucket {
                let opte = l2b.pte(va);
                if opte != 0 {
                    if l2pte_valid(opte) {
                        self.cpu.dcache_wbinv_range(va, PAGE_SIZE);
                        self.tlb_flush_d_se(kpm, va);
                    }
                    l2b.set_pte(va, 0);
                    self.pte_sync(l2b.pte_addr(va));
                    mappings += 1;
                }
                va += PAGE_SIZE;
            }
            l2b.dec_occupancy(mappings);
        }
        self.cpu.cpwait();
    }
}
