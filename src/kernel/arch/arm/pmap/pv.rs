// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Reverse Mappings and Cache Aliasing
//!
//! Operations on the [`PvEntry`] list of a managed page, the referenced and
//! modified attributes derived from it, and the cache alias resolution for
//! virtually indexed caches.
//!
//! # Aliasing
//!
//! Two virtual mappings of the same physical page can sit in different lines
//! of a VIVT cache. Read-only aliases are harmless; as soon as one mapping
//! can write and another exists, all but at most one of them must be made
//! uncacheable. The decision depends only on how many kernel and user
//! mappings exist and whether they are writable:
//!
//! ```text
//!                 kernel: none   ro      rw    ro+rw
//! user: none              -      ok      ok    KNC
//!       ro                ok     ok      NC    NC
//!       rw                ok     NC      NC    NC
//!       ro+rw             UNC    NC      NC    NC
//! ```
//!
//! `KNC` uncaches only the kernel mappings, `UNC` only the user ones and
//! `NC` all of them.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::page::{PageMd, PvEntry, PvFlags, VmPage};
use super::{Pmap, PmapContext};
use crate::kernel::arch::arm::pte::{l2pte_valid, L2_TYPE_MASK};
use crate::kernel::vm::layout::{VAddr, PAGE_SIZE};
use crate::kernel::vm::VmProt;

#[allow(dead_code)]
const LOCAL_TRACE: bool = false;

/// Marker in [`VAC_FLAGS`]: no aliasing at all, caching can be restored
const VAC_CLEAR: i8 = -1;

const KNC: i8 = PvFlags::KNC.bits() as i8;
const UNC: i8 = PvFlags::UNC.bits() as i8;
const NC: i8 = PvFlags::NC.bits() as i8;

/// Required uncached state indexed by `[user][kernel]` alias class
///
/// Class bit 0 is unused; bit 1 is set for a read-only mapping (or more than
/// one writable one), bit 2 for a writable mapping.
const VAC_FLAGS: [[i8; 4]; 4] = [
    [VAC_CLEAR, 0, 0, KNC],
    [0, 0, NC, NC],
    [0, NC, NC, NC],
    [UNC, NC, NC, NC],
];

/// Alias class of one side (kernel or user)
fn alias_class(ro: u32, rw: u32) -> usize {
    let mut idx = 0;
    if ro > 0 || rw > 1 {
        idx |= 1;
    }
    if rw > 0 {
        idx |= 2;
    }
    idx
}

/// Uncached state the page needs, or `None` when nothing aliases
pub fn vac_flags(md: &PageMd) -> Option<PvFlags> {
    let kidx = alias_class(md.kro, md.krw);
    let uidx = alias_class(md.uro, md.urw);
    match VAC_FLAGS[uidx][kidx] {
        VAC_CLEAR => None,
        f => Some(PvFlags::from_bits_truncate(f as u32)),
    }
}

impl PmapContext {
    // ------------------------------------------------------------------------
    // PV list maintenance
    // ------------------------------------------------------------------------

    /// Record the mapping `(pm, va)` of a page
    pub fn enter_pv(&self, md: &mut PageMd, pm: &Arc<Pmap>, va: VAddr, flags: PvFlags) {
        md.pvh_list.push(PvEntry {
            pmap: pm.clone(),
            va,
            flags,
        });
        md.attrs |= flags & (PvFlags::REF | PvFlags::MOD);
        match (pm.kernel, flags.contains(PvFlags::WRITE)) {
            (true, true) => md.krw += 1,
            (true, false) => md.kro += 1,
            (false, true) => md.urw += 1,
            (false, false) => md.uro += 1,
        }
        if flags.contains(PvFlags::WIRED) {
            pm.wired.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Position of the mapping `(pm, va)` in the list
    pub fn find_pv(&self, md: &PageMd, pm: &Pmap, va: VAddr) -> Option<usize> {
        md.pvh_list.iter().position(|pv| pv.is(pm, va))
    }

    /// Forget the mapping `(pm, va)`; returns its record
    pub fn remove_pv(&self, md: &mut PageMd, pm: &Pmap, va: VAddr) -> Option<PvEntry> {
        let idx = self.find_pv(md, pm, va)?;
        let pv = md.pvh_list.remove(idx);
        if pv.flags.contains(PvFlags::WIRED) {
            pm.wired.fetch_sub(1, Ordering::Relaxed);
        }
        match (pm.kernel, pv.flags.contains(PvFlags::WRITE)) {
            (true, true) => md.krw -= 1,
            (true, false) => md.kro -= 1,
            (false, true) => md.urw -= 1,
            (false, false) => md.uro -= 1,
        }
        Some(pv)
    }

    /// Clear `clr` and set `set` in the flags of `(pm, va)`
    ///
    /// Keeps the page attributes, alias counts and wired count in step.
    /// Returns the old flags, or empty flags if there is no such mapping.
    pub fn modify_pv(
        &self,
        md: &mut PageMd,
        pm: &Pmap,
        va: VAddr,
        clr: PvFlags,
        set: PvFlags,
    ) -> PvFlags {
        let idx = match self.find_pv(md, pm, va) {
            Some(idx) => idx,
            None => return PvFlags::empty(),
        };
        let oflags = md.pvh_list[idx].flags;
        let nflags = (oflags - clr) | set;
        md.pvh_list[idx].flags = nflags;

        md.attrs |= set & (PvFlags::REF | PvFlags::MOD);

        if (oflags ^ nflags).contains(PvFlags::WIRED) {
            if nflags.contains(PvFlags::WIRED) {
                pm.wired.fetch_add(1, Ordering::Relaxed);
            } else {
                pm.wired.fetch_sub(1, Ordering::Relaxed);
            }
        }

        if (oflags ^ nflags).contains(PvFlags::WRITE) {
            let gained = nflags.contains(PvFlags::WRITE);
            match (pm.kernel, gained) {
                (true, true) => {
                    md.krw += 1;
                    md.kro -= 1;
                }
                (true, false) => {
                    md.kro += 1;
                    md.krw -= 1;
                }
                (false, true) => {
                    md.urw += 1;
                    md.uro -= 1;
                }
                (false, false) => {
                    md.uro += 1;
                    md.urw -= 1;
                }
            }
        }
        oflags
    }

    // ------------------------------------------------------------------------
    // Cache aliasing
    // ------------------------------------------------------------------------

    /// Bring the cacheability of every mapping of a page in line with its
    /// alias counts
    ///
    /// `(pm, va)` names a mapping that was just entered and needs no cache
    /// cleaning; pass a `va` of 0 when there is none.
    pub fn vac_me_harder(&self, md: &mut PageMd, pm: &Pmap, va: VAddr) {
        if !self.config.variant.has_vivt_cache() {
            return;
        }

        let nattr = match vac_flags(md) {
            Some(nattr) => nattr,
            None => {
                md.attrs.remove(PvFlags::NC);
                return;
            }
        };
        if nattr.is_empty() && !md.attrs.intersects(PvFlags::NC) {
            return;
        }

        let tmpl = &self.templates;
        let mut need_wait = false;
        for pv in md.pvh_list.iter_mut() {
            let want = nattr
                & if pv.pmap.kernel {
                    PvFlags::KNC
                } else {
                    PvFlags::UNC
                };

            let l2b = match self.get_l2_bucket(&pv.pmap, pv.va) {
                Some(l2b) => l2b,
                None => panic!("vac_me_harder: no L2 table for va {:#x}", pv.va),
            };
            let opte = l2b.pte(pv.va);
            let cached = tmpl.l2_s_cached(opte);

            let npte = if !want.is_empty() {
                pv.flags = (pv.flags - PvFlags::NC) | want;
                if !cached {
                    continue;
                }
                let just_entered = pv.va == va && pv.pmap.id == pm.id;
                if !just_entered && l2pte_valid(opte) {
                    if pv.flags.been_execd() {
                        self.idcache_wbinv_range(&pv.pmap, pv.va, PAGE_SIZE);
                        self.tlb_flush_id_se(&pv.pmap, pv.va);
                    } else if pv.flags.been_refd() {
                        let rd_only = !pv.flags.contains(PvFlags::WRITE);
                        self.dcache_wb_range(&pv.pmap, pv.va, PAGE_SIZE, true, rd_only);
                        self.tlb_flush_d_se(&pv.pmap, pv.va);
                    }
                }
                opte & !tmpl.l2_s_cache_mask
            } else {
                pv.flags.remove(PvFlags::NC);
                if cached {
                    continue;
                }
                if l2pte_valid(opte) {
                    if pv.flags.been_execd() {
                        self.tlb_flush_id_se(&pv.pmap, pv.va);
                    } else if pv.flags.been_refd() {
                        self.tlb_flush_d_se(&pv.pmap, pv.va);
                    }
                }
                (opte & !tmpl.l2_s_cache_mask) | tmpl.l2_s_cache_mode
            };

            l2b.set_pte(pv.va, npte);
            self.pte_sync_current(&pv.pmap, l2b.pte_addr(pv.va));
            need_wait = true;
        }

        if need_wait {
            self.cpu.cpwait();
        }
        md.attrs = (md.attrs - PvFlags::NC) | nattr;
        crate::LTRACEF!("vac_me_harder: attrs {:?}", md.attrs);
    }

    // ------------------------------------------------------------------------
    // Attribute clearing
    // ------------------------------------------------------------------------

    /// Clear `mask` (REF, MOD and/or WRITE) from every mapping of a page
    ///
    /// Clearing REF invalidates the entries so the next access faults and
    /// sets it again; clearing MOD or WRITE write-protects them.
    pub fn clearbit(&self, pg: &VmPage, mask: PvFlags) {
        let _main = self.main_lock.write();
        let mut md = pg.lock();
        let tmpl = &self.templates;

        md.attrs.remove(mask & (PvFlags::MOD | PvFlags::REF));
        if md.pvh_list.is_empty() {
            return;
        }

        for i in 0..md.pvh_list.len() {
            let pv = md.pvh_list[i].clone();
            let pm = &pv.pmap;
            let oflags = pv.flags;
            let mut nflags = oflags - mask;

            let _guard = pm.inner.lock();

            let l2b = match self.get_l2_bucket(pm, pv.va) {
                Some(l2b) => l2b,
                None => panic!("clearbit: no L2 table for va {:#x}", pv.va),
            };
            let opte = l2b.pte(pv.va);
            let mut npte = opte;

            if mask.intersects(PvFlags::WRITE | PvFlags::MOD) {
                if nflags.intersects(PvFlags::NC) {
                    // Every mapping is about to be read-only, so caching is
                    // safe again, unless this is modify emulation.
                    if mask.contains(PvFlags::WRITE) {
                        npte |= tmpl.l2_s_cache_mode;
                        nflags.remove(PvFlags::NC);
                    }
                } else if tmpl.l2_s_writable(opte) {
                    if oflags.been_execd() {
                        self.idcache_wbinv_range(pm, pv.va, PAGE_SIZE);
                    } else if oflags.been_refd() {
                        let do_inv = mask.contains(PvFlags::REF);
                        self.dcache_wb_range(pm, pv.va, PAGE_SIZE, do_inv, false);
                    }
                }

                npte = tmpl.l2_s_clear_writable(npte);

                if mask.contains(PvFlags::WRITE) && oflags.contains(PvFlags::WRITE) {
                    if pm.kernel {
                        md.krw -= 1;
                        md.kro += 1;
                    } else {
                        md.urw -= 1;
                        md.uro += 1;
                    }
                }
            }

            if mask.contains(PvFlags::REF) {
                if !nflags.intersects(PvFlags::NC) && !mask.intersects(PvFlags::WRITE | PvFlags::MOD)
                {
                    if tmpl.l2_s_writable(npte) {
                        if oflags.been_execd() {
                            self.idcache_wbinv_range(pm, pv.va, PAGE_SIZE);
                        } else if oflags.been_refd() {
                            self.dcache_wb_range(pm, pv.va, PAGE_SIZE, true, false);
                        }
                    } else if l2pte_valid(npte) {
                        if oflags.been_execd() {
                            self.idcache_wbinv_range(pm, pv.va, PAGE_SIZE);
                        } else if oflags.been_refd() {
                            self.dcache_wb_range(pm, pv.va, PAGE_SIZE, true, true);
                        }
                    }
                }

                // Invalid, so the next access faults and sets REF again.
                npte &= !L2_TYPE_MASK;
            }

            md.pvh_list[i].flags = nflags;

            if npte != opte {
                l2b.set_pte(pv.va, npte);
                self.pte_sync(l2b.pte_addr(pv.va));
                if oflags.been_execd() {
                    self.tlb_flush_id_se(pm, pv.va);
                } else if oflags.been_refd() {
                    self.tlb_flush_d_se(pm, pv.va);
                }
            }
        }

        if mask.contains(PvFlags::WRITE) && md.krw == 0 && md.urw == 0 {
            md.attrs.remove(PvFlags::NC);
        }
        self.cpu.cpwait();
    }

    /// Check whether the page was written
    pub fn is_modified(&self, pg: &VmPage) -> bool {
        pg.lock().attrs.contains(PvFlags::MOD)
    }

    /// Check whether the page was accessed
    pub fn is_referenced(&self, pg: &VmPage) -> bool {
        pg.lock().attrs.contains(PvFlags::REF)
    }

    /// Clear the modified attribute; returns whether it was set
    pub fn clear_modify(&self, pg: &VmPage) -> bool {
        let was = self.is_modified(pg);
        if was {
            self.clearbit(pg, PvFlags::MOD);
        }
        was
    }

    /// Clear the referenced attribute; returns whether it was set
    pub fn clear_reference(&self, pg: &VmPage) -> bool {
        let was = self.is_referenced(pg);
        if was {
            self.clearbit(pg, PvFlags::REF);
        }
        was
    }

    // ------------------------------------------------------------------------
    // Whole-page operations
    // ------------------------------------------------------------------------

    /// Reduce the protection of every mapping of a page
    pub fn page_protect(&self, pg: &VmPage, prot: VmProt) {
        crate::LTRACEF!("page_protect pa {:#x} prot {:?}", pg.phys(), prot);
        if prot.can_read() && prot.can_write() {
            return;
        }
        if prot.can_read() {
            self.clearbit(pg, PvFlags::WRITE);
        } else {
            self.page_remove(pg);
        }
    }

    /// Remove every mapping of a page
    pub fn page_remove(&self, pg: &VmPage) {
        let _main = self.main_lock.write();
        let mut md = pg.lock();
        if md.pvh_list.is_empty() {
            return;
        }

        let curpm = self.current().unwrap_or_else(|| self.kernel_pmap.clone());
        self.clean_page(&md, false);

        let mut flush = false;
        let mut flags = PvFlags::empty();
        for pv in md.pvh_list.drain(..) {
            let pm = &pv.pmap;
            let _guard = pm.inner.lock();

            let l2b = match self.get_l2_bucket(pm, pv.va) {
                Some(l2b) => l2b,
                None => panic!("page_remove: no L2 table for va {:#x}", pv.va),
            };

            // Only the resident pmap (or the kernel) can have live entries.
            if pm.id == curpm.id || pm.kernel {
                flush = true;
            } else {
                pm.tlb_deferred.store(true, Ordering::Relaxed);
            }

            pm.resident.fetch_sub(1, Ordering::Relaxed);
            if pv.flags.contains(PvFlags::WIRED) {
                pm.wired.fetch_sub(1, Ordering::Relaxed);
            }
            flags |= pv.flags;

            l2b.set_pte(pv.va, 0);
            self.pte_sync_current(pm, l2b.pte_addr(pv.va));
            l2b.dec_occupancy(1);
        }
        md.krw = 0;
        md.kro = 0;
        md.urw = 0;
        md.uro = 0;
        md.attrs.remove(PvFlags::NC);

        if flush {
            if flags.been_execd() {
                self.tlb_flush_id(&curpm);
            } else {
                self.tlb_flush_d(&curpm);
            }
        }
        self.cpu.cpwait();
    }

    /// Clean a page's lines out of the cache before it is zeroed or copied
    ///
    /// Caches are flushed whenever another user pmap is activated, so only
    /// mappings in the resident pmap and the kernel matter. A single such
    /// mapping is cleaned by range; more than one costs a whole-cache flush.
    /// A copy source only needs cleaning if a mapping could have dirtied it.
    /// Returns true when the whole cache was flushed.
    pub fn clean_page(&self, md: &PageMd, is_src: bool) -> bool {
        if md.pvh_list.is_empty() {
            return false;
        }

        let pm = self.current().unwrap_or_else(|| self.kernel_pmap.clone());

        let mut cache_needs_cleaning = false;
        let mut page_to_clean: Option<&PvEntry> = None;
        let mut flags = PvFlags::empty();

        for pv in md.pvh_list.iter() {
            if !(pv.pmap.kernel || pv.pmap.id == pm.id) {
                continue;
            }
            flags |= pv.flags;
            if pv.flags.intersects(PvFlags::NC) {
                // Mapped uncached here, nothing can be in the cache.
                debug_assert!(!cache_needs_cleaning, "clean_page: cache inconsistency");
                break;
            }
            if is_src && !pv.flags.contains(PvFlags::WRITE) {
                continue;
            }
            if cache_needs_cleaning {
                page_to_clean = None;
                break;
            }
            page_to_clean = Some(pv);
            cache_needs_cleaning = true;
        }

        match page_to_clean {
            Some(pv) => {
                if flags.been_execd() {
                    self.idcache_wbinv_range(&pv.pmap, pv.va, PAGE_SIZE);
                } else {
                    let rd_only = !flags.contains(PvFlags::WRITE);
                    self.dcache_wb_range(&pv.pmap, pv.va, PAGE_SIZE, !is_src, rd_only);
                }
                false
            }
            None if cache_needs_cleaning => {
                if flags.been_execd() {
                    self.idcache_wbinv_all(&pm);
                } else {
                    self.dcache_wbinv_all(&pm);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(kro: u32, krw: u32, uro: u32, urw: u32) -> PageMd {
        PageMd {
            kro,
            krw,
            uro,
            urw,
            ..PageMd::default()
        }
    }

    #[test]
    fn test_vac_flags_unaliased() {
        assert_eq!(vac_flags(&md(0, 0, 0, 0)), None);
        assert_eq!(vac_flags(&md(0, 1, 0, 0)), Some(PvFlags::empty()));
        assert_eq!(vac_flags(&md(0, 0, 0, 1)), Some(PvFlags::empty()));
        assert_eq!(vac_flags(&md(2, 0, 3, 0)), Some(PvFlags::empty()));
    }

    #[test]
    fn test_vac_flags_writable_alias() {
        // Writable user mapping plus a kernel read-only alias.
        assert_eq!(vac_flags(&md(1, 0, 0, 1)), Some(PvFlags::NC));
        // Two user writers and nothing in the kernel.
        assert_eq!(vac_flags(&md(0, 0, 0, 2)), Some(PvFlags::UNC));
        // Two kernel writers and nothing in user space.
        assert_eq!(vac_flags(&md(0, 2, 0, 0)), Some(PvFlags::KNC));
        // User writer and kernel writer.
        assert_eq!(vac_flags(&md(0, 1, 0, 1)), Some(PvFlags::NC));
    }

    #[test]
    fn test_alias_class() {
        assert_eq!(alias_class(0, 0), 0);
        assert_eq!(alias_class(1, 0), 1);
        assert_eq!(alias_class(0, 1), 2);
        assert_eq!(alias_class(0, 2), 3);
        assert_eq!(alias_class(1, 1), 3);
    }
}
