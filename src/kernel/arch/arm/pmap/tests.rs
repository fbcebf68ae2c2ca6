// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Whole-pmap tests
//!
//! Every test boots a context on a [`SoftCpu`] with the same layout:
//!
//! - kernel L1 at 0xa000_4000, mapped by a page-table section at 0xc000_0000
//! - two kernel L2 tables covering 0xc100_0000-0xc120_0000
//! - table memory from a 16MB arena at 0x8000_0000
//! - 4MB of managed pages at 0

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use super::*;
use crate::kernel::arch::arm::cpufunc::{CpuOp, SoftCpu};
use crate::kernel::arch::arm::pte::{
    l1pte_page_p, CacheMode, L2_B, L2_TYPE_INV, L2_TYPE_MASK, L2_TYPE_S, PMAP_DOMAINS,
};
use crate::kernel::pmm::FrameArena;
use crate::kernel::vm::layout::{
    PhysRange, KERNEL_VM_BASE, KERNEL_VM_END, L1_S_SIZE, L2_S_FRAME,
};

const MANAGED: PhysRange = PhysRange::new(0x0000_0000, 0x0040_0000);
const ARENA: PhysRange = PhysRange::new(0x8000_0000, 0x8100_0000);

const BOOT_L1_PA: PAddr = 0xa000_4000;
const BOOT_L1_VA: VAddr = 0xc000_4000;

/// Kernel VA with an L2 table, clear of the page hook windows
const KVA: VAddr = KERNEL_VM_BASE + L1_S_SIZE;

struct Harness {
    cpu: Arc<SoftCpu>,
    arena: Arc<FrameArena>,
    ctx: PmapContext,
}

fn boot_tables(config: &PmapConfig) -> BootTables {
    let mut boot = BootTables::new(config, BOOT_L1_PA, BOOT_L1_VA);
    boot.map_section(0xc000_0000, 0xa000_0000, VmProt::RW, CacheMode::PageTable);
    boot.link_l2pt(KERNEL_VM_BASE, 0xa000_8000, 0xc000_8000);
    boot.link_l2pt(KERNEL_VM_BASE + L1_S_SIZE, 0xa000_8400, 0xc000_8400);
    boot
}

fn build(config: PmapConfig, arena: PhysRange, boot: BootTables) -> Harness {
    let cpu = Arc::new(SoftCpu::new());
    let arena = Arc::new(FrameArena::new(arena));
    let ctx = PmapContext::bootstrap(
        config,
        cpu.clone(),
        arena.clone(),
        &[MANAGED],
        boot,
        KERNEL_VM_BASE,
        KERNEL_VM_END,
    );
    ctx.init();
    cpu.take_ops();
    Harness { cpu, arena, ctx }
}

fn harness(config: PmapConfig) -> Harness {
    build(config, ARENA, boot_tables(&config))
}

fn pte(ctx: &PmapContext, pm: &Pmap, va: VAddr) -> u32 {
    ctx.get_l2_bucket(pm, va).map_or(0, |l2b| l2b.pte(va))
}

fn map(h: &Harness, pm: &Arc<Pmap>, va: VAddr, pa: PAddr, prot: VmProt, flags: EnterFlags) {
    h.ctx.enter(pm, va, pa, prot, flags).unwrap();
}

// ============================================================================
// Bootstrap
// ============================================================================

#[test]
fn test_bootstrap_adopts_boot_tables() {
    let config = PmapConfig::generic();
    let mut boot = boot_tables(&config);
    boot.map_entry(KVA + 0x5000, 0x0030_0000, VmProt::RW, CacheMode::WriteBack);
    let h = build(config, ARENA, boot);

    let kpm = h.ctx.kernel_pmap();
    assert!(kpm.is_kernel());
    assert_eq!(kpm.domain(), Some(PMAP_DOMAIN_KERNEL));
    assert_eq!(h.ctx.kernel_l1().phys(), BOOT_L1_PA);
    assert_eq!(h.ctx.l1_count(), 1);

    let l2b = h.ctx.get_l2_bucket(kpm, KVA).unwrap();
    assert_eq!(l2b.phys(), 0xa000_8400);
    assert_eq!(l2b.occupancy(), 1);
    assert_eq!(h.ctx.extract(kpm, KVA + 0x5000), Some(0x0030_0000));

    // Section mappings translate without L2 metadata.
    assert_eq!(h.ctx.extract(kpm, 0xc001_2345), Some(0xa001_2345));

    assert_eq!(
        h.ctx.virtual_space(),
        (KERNEL_VM_BASE + 2 * PAGE_SIZE, KERNEL_VM_END)
    );
    assert_eq!(h.ctx.kernel_va_limit(), KERNEL_VM_BASE + 2 * L1_S_SIZE);
}

#[test]
fn test_bootstrap_fixes_page_table_cache_mode() {
    let config = PmapConfig::generic();
    let mut boot = BootTables::new(&config, BOOT_L1_PA, BOOT_L1_VA);
    // Tables mapped write-back instead of with the page-table mode.
    boot.map_section(0xc000_0000, 0xa000_0000, VmProt::RW, CacheMode::WriteBack);
    boot.link_l2pt(KERNEL_VM_BASE, 0xa000_8000, 0xc000_8000);

    let cpu = Arc::new(SoftCpu::new());
    let ctx = PmapContext::bootstrap(
        config,
        cpu.clone(),
        Arc::new(FrameArena::new(ARENA)),
        &[MANAGED],
        boot,
        KERNEL_VM_BASE,
        KERNEL_VM_END,
    );

    let t = ctx.templates();
    let pde = ctx.kernel_l1().entry(l1_idx(0xc000_0000));
    assert_eq!(pde & t.l1_s_cache_mask, t.l1_s_cache_mode_pt);

    let ops = cpu.ops();
    assert!(ops.contains(&CpuOp::DcacheWbinvAll));
    assert!(ops.contains(&CpuOp::TlbFlushId));
}

#[test]
#[should_panic(expected = "bootstrap: no L2 table for page hook")]
fn test_bootstrap_needs_hook_tables() {
    let config = PmapConfig::generic();
    let mut boot = BootTables::new(&config, BOOT_L1_PA, BOOT_L1_VA);
    boot.map_section(0xc000_0000, 0xa000_0000, VmProt::RW, CacheMode::PageTable);
    build(config, ARENA, boot);
}

// ============================================================================
// Mapping round trips
// ============================================================================

#[test]
fn test_scenario_enter_extract_remove() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();

    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    assert_eq!(h.ctx.extract(&a, 0x1000), Some(0x2000));
    assert_eq!(a.stats().resident, 1);

    h.ctx.remove(&a, 0x1000, 0x2000);
    assert_eq!(h.ctx.extract(&a, 0x1000), None);
    assert_eq!(a.stats().resident, 0);
    assert_eq!(h.ctx.page(0x2000).unwrap().mapping_count(), 0);
}

#[test]
fn test_round_trip_unmanaged_page() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();

    map(&h, &a, 0x0040_0000, 0x9000_0000, VmProt::RW, EnterFlags::empty());
    assert_eq!(h.ctx.extract(&a, 0x0040_0abc), Some(0x9000_0abc));

    // Unmanaged: valid right away, no cache bits, no reverse map.
    let p = pte(&h.ctx, &a, 0x0040_0000);
    assert_eq!(p & L2_TYPE_MASK, L2_TYPE_S);
    assert!(!h.ctx.templates().l2_s_cached(p));
    assert!(h.ctx.page(0x9000_0000).is_none());
}

#[test]
fn test_enter_replaces_mapping() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();

    map(&h, &a, 0x1000, 0x3000, VmProt::RW, EnterFlags::READ);
    map(&h, &a, 0x1000, 0x4000, VmProt::RW, EnterFlags::READ);

    assert_eq!(h.ctx.extract(&a, 0x1000), Some(0x4000));
    assert_eq!(a.stats().resident, 1);
    assert_eq!(h.ctx.page(0x3000).unwrap().mapping_count(), 0);
    assert_eq!(h.ctx.page(0x4000).unwrap().mapping_count(), 1);
}

#[test]
fn test_remove_idempotent() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();

    map(&h, &a, 0x1000, 0x2000, VmProt::READ, EnterFlags::READ);
    map(&h, &a, 0x2000, 0x3000, VmProt::READ, EnterFlags::READ);

    h.ctx.remove(&a, 0x1000, 0x2000);
    let stats = a.stats();
    h.ctx.remove(&a, 0x1000, 0x2000);
    assert_eq!(a.stats(), stats);
    assert_eq!(h.ctx.extract(&a, 0x2000), Some(0x3000));

    // Nothing was ever mapped here.
    h.ctx.remove(&a, 0x1000_0000, 0x1010_0000);
    assert_eq!(a.stats(), stats);
}

#[test]
fn test_enter_fails_without_table_memory() {
    let config = PmapConfig::generic();
    let h = build(
        config,
        PhysRange::new(0x8000_0000, 0x8000_2000),
        boot_tables(&config),
    );
    let a = h.ctx.create();

    assert_eq!(
        h.ctx.enter(&a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty()),
        Err(VmError::NoMemory)
    );
    assert_eq!(a.stats().resident, 0);
    assert!(a.l1_phys().is_none());
    assert_eq!(h.ctx.page(0x2000).unwrap().mapping_count(), 0);
}

// ============================================================================
// Aliasing
// ============================================================================

#[test]
fn test_scenario_shared_writable_page_uncached() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    let b = h.ctx.create();

    map(&h, &a, 0x1000, 0x5000, VmProt::RW, EnterFlags::empty());
    map(&h, &b, 0x3000, 0x5000, VmProt::RW, EnterFlags::empty());

    let pg = h.ctx.page(0x5000).unwrap();
    let md = pg.lock();
    assert_eq!(md.pvh_list.len(), 2);
    assert!(md.pvh_list.iter().any(|pv| pv.flags.intersects(PvFlags::NC)));
    assert!(md.attrs.intersects(PvFlags::NC));

    let t = h.ctx.templates();
    let cached = md
        .pvh_list
        .iter()
        .filter(|pv| t.l2_s_cached(pte(&h.ctx, &pv.pmap, pv.va)))
        .count();
    assert!(cached <= 1);
}

#[test]
fn test_alias_resolution_restores_caching() {
    let h = harness(PmapConfig::generic());
    let kpm = h.ctx.kernel_pmap().clone();
    let a = h.ctx.create();
    let t = *h.ctx.templates();

    map(&h, &kpm, KVA, 0x6000, VmProt::RW, EnterFlags::WRITE);
    assert!(t.l2_s_cached(pte(&h.ctx, &kpm, KVA)));

    // A writable kernel mapping plus any other mapping: nothing stays cached.
    map(&h, &a, 0x1000, 0x6000, VmProt::READ, EnterFlags::READ);
    let cached = [(&kpm, KVA), (&a, 0x1000)]
        .iter()
        .filter(|(pm, va)| t.l2_s_cached(pte(&h.ctx, pm, *va)))
        .count();
    assert_eq!(cached, 0);

    h.ctx.remove(&a, 0x1000, 0x2000);
    assert!(t.l2_s_cached(pte(&h.ctx, &kpm, KVA)));
    assert!(!h.ctx.page(0x6000).unwrap().attrs().intersects(PvFlags::NC));
}

#[test]
fn test_read_only_aliases_stay_cached() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    let b = h.ctx.create();
    let t = *h.ctx.templates();

    map(&h, &a, 0x1000, 0x7000, VmProt::READ, EnterFlags::READ);
    map(&h, &b, 0x8000, 0x7000, VmProt::READ, EnterFlags::READ);

    assert!(t.l2_s_cached(pte(&h.ctx, &a, 0x1000)));
    assert!(t.l2_s_cached(pte(&h.ctx, &b, 0x8000)));
}

#[test]
fn test_v7_skips_alias_handling() {
    let h = harness(PmapConfig::v7());
    let a = h.ctx.create();
    let b = h.ctx.create();

    map(&h, &a, 0x1000, 0x5000, VmProt::RW, EnterFlags::WRITE);
    map(&h, &b, 0x3000, 0x5000, VmProt::RW, EnterFlags::WRITE);

    let md = h.ctx.page(0x5000).unwrap().lock();
    assert!(md.pvh_list.iter().all(|pv| !pv.flags.intersects(PvFlags::NC)));
}

// ============================================================================
// Referenced/modified emulation
// ============================================================================

#[test]
fn test_reference_and_modify_emulation() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    let t = *h.ctx.templates();
    let pg = h.ctx.page(0x9000).unwrap();

    map(&h, &a, 0x1000, 0x9000, VmProt::RW, EnterFlags::empty());
    let p = pte(&h.ctx, &a, 0x1000);
    assert_eq!(p & L2_TYPE_MASK, L2_TYPE_INV);
    assert!(!t.l2_s_writable(p));
    assert!(!h.ctx.is_referenced(pg));

    h.cpu.take_ops();
    assert!(h.ctx.fault_fixup(&a, 0x1000, VmProt::READ, true));
    let p = pte(&h.ctx, &a, 0x1000);
    assert_eq!(p & L2_TYPE_MASK, L2_TYPE_S);
    assert!(!t.l2_s_writable(p));
    assert!(h.ctx.is_referenced(pg));
    assert!(!h.ctx.is_modified(pg));
    assert_eq!(h.cpu.take_ops(), vec![CpuOp::TlbFlushIdSe(0x1000), CpuOp::Cpwait]);

    assert!(h.ctx.fault_fixup(&a, 0x1000, VmProt::WRITE, true));
    assert!(t.l2_s_writable(pte(&h.ctx, &a, 0x1000)));
    assert!(h.ctx.is_modified(pg));
}

#[test]
fn test_fault_fixup_rejects_real_faults() {
    let h = harness(PmapConfig::generic());
    let kpm = h.ctx.kernel_pmap().clone();
    let a = h.ctx.create();

    // Nothing mapped
    assert!(!h.ctx.fault_fixup(&a, 0x1000, VmProt::READ, true));

    // Write to a read-only mapping
    map(&h, &a, 0x1000, 0x9000, VmProt::READ, EnterFlags::READ);
    assert!(!h.ctx.fault_fixup(&a, 0x1000, VmProt::WRITE, true));

    // User access to a kernel-only page
    map(&h, &kpm, KVA, 0xa000, VmProt::READ, EnterFlags::empty());
    assert!(!h.ctx.fault_fixup(&kpm, KVA, VmProt::READ, true));
    assert!(h.ctx.fault_fixup(&kpm, KVA, VmProt::READ, false));
}

#[test]
fn test_clear_modify_write_protects() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    let t = *h.ctx.templates();
    let pg = h.ctx.page(0xb000).unwrap();

    map(&h, &a, 0x1000, 0xb000, VmProt::RW, EnterFlags::WRITE);
    assert!(t.l2_s_writable(pte(&h.ctx, &a, 0x1000)));
    assert!(h.ctx.is_modified(pg));

    h.cpu.take_ops();
    assert!(h.ctx.clear_modify(pg));
    assert!(!h.ctx.is_modified(pg));
    assert!(!t.l2_s_writable(pte(&h.ctx, &a, 0x1000)));
    assert!(h.cpu.ops().contains(&CpuOp::TlbFlushDSe(0x1000)));
    assert!(!h.ctx.clear_modify(pg));

    // The next write is caught again.
    assert!(h.ctx.fault_fixup(&a, 0x1000, VmProt::WRITE, true));
    assert!(h.ctx.is_modified(pg));
}

#[test]
fn test_clear_reference_invalidates() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    let pg = h.ctx.page(0xc000).unwrap();

    map(&h, &a, 0x1000, 0xc000, VmProt::READ, EnterFlags::READ);
    assert!(h.ctx.clear_reference(pg));
    assert_eq!(pte(&h.ctx, &a, 0x1000) & L2_TYPE_MASK, L2_TYPE_INV);
    assert!(!h.ctx.is_referenced(pg));

    assert!(h.ctx.fault_fixup(&a, 0x1000, VmProt::READ, true));
    assert_eq!(pte(&h.ctx, &a, 0x1000) & L2_TYPE_MASK, L2_TYPE_S);
    assert!(h.ctx.is_referenced(pg));
}

#[test]
fn test_modified_page_needs_reference_for_write() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    let t = *h.ctx.templates();
    let pg = h.ctx.page(0xd000).unwrap();

    map(&h, &a, 0x1000, 0xd000, VmProt::RW, EnterFlags::WRITE);
    assert!(h.ctx.clear_reference(pg));
    h.ctx.remove(&a, 0x1000, 0x2000);
    assert!(h.ctx.is_modified(pg));
    assert!(!h.ctx.is_referenced(pg));

    // Modified but not referenced: invalid and read-only until the fault.
    map(&h, &a, 0x2000, 0xd000, VmProt::RW, EnterFlags::empty());
    let p = pte(&h.ctx, &a, 0x2000);
    assert_eq!(p & L2_TYPE_MASK, L2_TYPE_INV);
    assert!(!t.l2_s_writable(p));
    let md = pg.lock();
    assert_eq!(md.pvh_list.len(), 1);
    assert!(!md.pvh_list[0].flags.contains(PvFlags::MOD));
    assert!(md.pvh_list[0].flags.contains(PvFlags::WRITE));
}

// ============================================================================
// Protection changes
// ============================================================================

#[test]
fn test_protect_large_range_single_flush() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    let t = *h.ctx.templates();

    for i in 0..5 {
        map(&h, &a, 0x1000 + i * PAGE_SIZE, 0x10_0000 + i * PAGE_SIZE, VmProt::RW, EnterFlags::WRITE);
    }
    h.cpu.take_ops();

    h.ctx.protect(&a, 0x1000, 0x1000 + 5 * PAGE_SIZE, VmProt::READ);
    for i in 0..5 {
        let va = 0x1000 + i * PAGE_SIZE;
        assert!(!t.l2_s_writable(pte(&h.ctx, &a, va)));
        assert_eq!(h.ctx.extract(&a, va), Some(0x10_0000 + i * PAGE_SIZE));
        let md = h.ctx.page(0x10_0000 + i * PAGE_SIZE).unwrap().lock();
        assert!(!md.pvh_list[0].flags.contains(PvFlags::WRITE));
        assert_eq!((md.uro, md.urw), (1, 0));
    }
    assert_eq!(h.cpu.count(|op| *op == CpuOp::TlbFlushD), 1);
    assert_eq!(h.cpu.count(|op| matches!(op, CpuOp::TlbFlushDSe(_))), 0);
}

#[test]
fn test_protect_small_range_per_page_flush() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);

    for i in 0..2 {
        map(&h, &a, 0x1000 + i * PAGE_SIZE, 0x10_0000 + i * PAGE_SIZE, VmProt::RW, EnterFlags::WRITE);
    }
    h.cpu.take_ops();

    h.ctx.protect(&a, 0x1000, 0x1000 + 2 * PAGE_SIZE, VmProt::READ);
    assert_eq!(h.cpu.count(|op| matches!(op, CpuOp::TlbFlushDSe(_))), 2);
    assert_eq!(h.cpu.count(|op| *op == CpuOp::TlbFlushD), 0);
}

#[test]
fn test_protect_none_removes_and_write_ignored() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    let t = *h.ctx.templates();

    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::WRITE);
    h.ctx.protect(&a, 0x1000, 0x2000, VmProt::RW);
    assert!(t.l2_s_writable(pte(&h.ctx, &a, 0x1000)));

    h.ctx.protect(&a, 0x1000, 0x2000, VmProt::empty());
    assert_eq!(h.ctx.extract(&a, 0x1000), None);
    assert_eq!(a.stats().resident, 0);
}

#[test]
fn test_page_protect_and_page_remove() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    let b = h.ctx.create();
    h.ctx.activate(&a);
    let t = *h.ctx.templates();
    let pg = h.ctx.page(0xd000).unwrap();

    map(&h, &a, 0x1000, 0xd000, VmProt::RW, EnterFlags::WRITE);
    map(&h, &b, 0x2000, 0xd000, VmProt::READ, EnterFlags::READ);

    h.ctx.page_protect(pg, VmProt::READ);
    assert!(!t.l2_s_writable(pte(&h.ctx, &a, 0x1000)));
    assert_eq!(pg.mapping_count(), 2);

    h.ctx.page_protect(pg, VmProt::empty());
    assert_eq!(pg.mapping_count(), 0);
    assert_eq!(h.ctx.extract(&a, 0x1000), None);
    assert_eq!(h.ctx.extract(&b, 0x2000), None);
    assert_eq!(a.stats().resident, 0);
    assert_eq!(b.stats().resident, 0);
    // b was not resident; its invalidation waits for activation.
    assert!(b.tlb_deferred());
}

// ============================================================================
// Accounting
// ============================================================================

#[test]
fn test_wired_accounting() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();

    for i in 0..3 {
        map(&h, &a, 0x1000 + i * PAGE_SIZE, 0x20_0000 + i * PAGE_SIZE, VmProt::RW, EnterFlags::WIRED);
    }
    for i in 3..5 {
        map(&h, &a, 0x1000 + i * PAGE_SIZE, 0x20_0000 + i * PAGE_SIZE, VmProt::RW, EnterFlags::empty());
    }
    assert_eq!(a.stats(), PmapStats { resident: 5, wired: 3 });

    h.ctx.remove(&a, 0x1000, 0x2000);
    assert_eq!(a.stats(), PmapStats { resident: 4, wired: 2 });

    h.ctx.unwire(&a, 0x2000);
    assert_eq!(a.stats().wired, 1);

    // Wiring an existing mapping in place
    let va = 0x1000 + 3 * PAGE_SIZE;
    map(&h, &a, va, 0x20_0000 + 3 * PAGE_SIZE, VmProt::RW, EnterFlags::WIRED);
    assert_eq!(a.stats(), PmapStats { resident: 4, wired: 2 });

    h.ctx.remove(&a, 0x1000, 0x1000 + 5 * PAGE_SIZE);
    assert_eq!(a.stats(), PmapStats { resident: 0, wired: 0 });
}

#[test]
fn test_wired_accounting_unmanaged() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    let dev = 0x9000_0000;

    map(&h, &a, 0x1000, dev, VmProt::RW, EnterFlags::WIRED);
    map(&h, &a, 0x2000, dev + PAGE_SIZE, VmProt::RW, EnterFlags::WIRED);
    assert_eq!(a.stats(), PmapStats { resident: 2, wired: 2 });
    let l2b = h.ctx.get_l2_bucket(&a, 0x1000).unwrap();
    assert!(l2b.unmanaged_wired(0x1000));

    h.ctx.unwire(&a, 0x2000);
    assert_eq!(a.stats(), PmapStats { resident: 2, wired: 1 });

    // Replacing with a managed page moves the wiring to the reverse map.
    map(&h, &a, 0x1000, 0x5000, VmProt::RW, EnterFlags::WIRED);
    assert_eq!(a.stats(), PmapStats { resident: 2, wired: 1 });
    assert!(!l2b.unmanaged_wired(0x1000));

    // And back again, unwired this time.
    map(&h, &a, 0x1000, dev, VmProt::RW, EnterFlags::empty());
    assert_eq!(a.stats(), PmapStats { resident: 2, wired: 0 });
    assert_eq!(h.ctx.page(0x5000).unwrap().mapping_count(), 0);

    map(&h, &a, 0x2000, dev + PAGE_SIZE, VmProt::RW, EnterFlags::WIRED);
    assert_eq!(a.stats().wired, 1);
    h.ctx.remove(&a, 0x1000, 0x3000);
    assert_eq!(a.stats(), PmapStats::default());
    assert!(!l2b.unmanaged_wired(0x2000));
}

#[test]
fn test_wired_accounting_shadow() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();

    // (pa, wired) per slot
    let mut shadow: [Option<(PAddr, bool)>; 32] = [None; 32];
    let mut seed: u32 = 0x1234_5678;
    let mut next = || {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        seed >> 16
    };

    for _ in 0..500 {
        let slot = next() as usize % shadow.len();
        let va = 0x0010_0000 + slot * 7 * PAGE_SIZE;
        match next() % 3 {
            0 => {
                h.ctx.remove(&a, va, va + PAGE_SIZE);
                shadow[slot] = None;
            }
            _ => {
                // One page in eight is device memory with no reverse map.
                let frame = next() as usize % 64;
                let pa = if frame % 8 == 0 {
                    0x9000_0000 + frame * PAGE_SIZE
                } else {
                    0x1000 + frame * PAGE_SIZE
                };
                let wired = next() % 2 == 0;
                let flags = if wired { EnterFlags::WIRED } else { EnterFlags::empty() };
                // Entering over an existing mapping sets its wiring as well.
                map(&h, &a, va, pa, VmProt::RW, flags);
                shadow[slot] = Some((pa, wired));
            }
        }

        let resident = shadow.iter().filter(|s| s.is_some()).count() as u32;
        let wired = shadow.iter().filter(|s| matches!(s, Some((_, true)))).count() as u32;
        assert_eq!(a.stats(), PmapStats { resident, wired });
    }
}

// ============================================================================
// Removal strategies
// ============================================================================

#[test]
fn test_remove_few_pages_cleans_by_range() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);

    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::READ);
    map(&h, &a, 0x2000, 0x3000, VmProt::RW, EnterFlags::READ);
    h.cpu.take_ops();

    h.ctx.remove(&a, 0x1000, 0x3000);
    let ops = h.cpu.take_ops();
    for va in [0x1000, 0x2000] {
        assert!(ops.contains(&CpuOp::DcacheWbinvRange(va, PAGE_SIZE)));
        assert!(ops.contains(&CpuOp::TlbFlushDSe(va)));
    }
    assert!(!ops.contains(&CpuOp::IdcacheWbinvAll));
}

#[test]
fn test_remove_many_pages_flushes_everything() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);

    for i in 0..6 {
        map(&h, &a, 0x1000 + i * PAGE_SIZE, 0x2000 + i * PAGE_SIZE, VmProt::RW, EnterFlags::READ);
    }
    h.cpu.take_ops();

    h.ctx.remove(&a, 0x1000, 0x1000 + 6 * PAGE_SIZE);
    let ops = h.cpu.take_ops();
    assert_eq!(ops.iter().filter(|op| **op == CpuOp::IdcacheWbinvAll).count(), 1);
    assert!(!ops.iter().any(|op| matches!(op, CpuOp::TlbFlushDSe(_))));
    assert!(a.inner.lock().remove_all);

    h.ctx.update(&a);
    assert!(!a.inner.lock().remove_all);
    assert_eq!(a.cache_state(), CacheState::ALL);
    for i in 0..6 {
        assert_eq!(h.ctx.extract(&a, 0x1000 + i * PAGE_SIZE), None);
    }
}

#[test]
fn test_scenario_remove_all_scattered() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);

    let mappings: Vec<(VAddr, PAddr)> = (0..1000)
        .map(|i| (0x0010_0000 + i * 5 * PAGE_SIZE, 0x1000 + i * PAGE_SIZE))
        .collect();
    for &(va, pa) in &mappings {
        map(&h, &a, va, pa, VmProt::RW, EnterFlags::READ);
    }
    assert_eq!(a.stats().resident, 1000);
    assert!(a.l2_buckets().count() > 1);

    h.ctx.remove_all(&a);

    for &(va, pa) in &mappings {
        assert_eq!(h.ctx.extract(&a, va), None);
        let md = h.ctx.page(pa).unwrap().lock();
        assert!(md.pvh_list.iter().all(|pv| pv.pmap.id() != a.id()));
    }
    for l2b in a.l2_buckets() {
        assert_eq!(l2b.occupancy(), 0);
    }
    assert_eq!(a.stats(), PmapStats::default());
    assert!(!a.inner.lock().remove_all);

    h.ctx.destroy(&a);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_destroy_frees_tables() {
    let h = harness(PmapConfig::generic());
    let free_before = h.arena.free_count();
    let a = h.ctx.create();

    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    assert_eq!(h.ctx.l1_count(), 2);
    assert_eq!(h.ctx.domains_in_use(), 1);
    // L1 (four pages) plus one page carved into L2 tables
    assert_eq!(h.arena.free_count(), free_before - 5);

    h.ctx.remove(&a, 0x1000, 0x2000);
    h.ctx.destroy(&a);
    assert_eq!(h.ctx.l1_count(), 1);
    assert_eq!(h.ctx.domains_in_use(), 0);
    assert_eq!(h.arena.free_count(), free_before - 1);
    assert_eq!(h.ctx.l2_pool_free(), 4);
    assert_eq!(a.domain(), None);
}

#[test]
fn test_destroy_keeps_referenced_pmap() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());

    h.ctx.reference(&a);
    assert_eq!(a.refs(), 2);
    h.ctx.destroy(&a);
    assert_eq!(a.refs(), 1);
    assert!(a.l1_phys().is_some());
    assert_eq!(h.ctx.extract(&a, 0x1000), Some(0x2000));
}

#[test]
#[should_panic(expected = "destroy: pmap")]
fn test_destroy_with_mappings_panics() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    h.ctx.destroy(&a);
}

#[test]
fn test_destroy_current_switches_to_kernel() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::READ);
    h.ctx.remove(&a, 0x1000, 0x2000);

    h.ctx.destroy(&a);
    assert!(h.ctx.current().is_none());
    assert_eq!(h.cpu.ttb(), BOOT_L1_PA);
    assert_eq!(h.cpu.dacr(), KERNEL_DACR);
}

// ============================================================================
// Activation and domains
// ============================================================================

#[test]
fn test_first_mapping_of_current_pmap_loads_l1() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();

    h.ctx.activate(&a);
    assert_eq!(h.cpu.ttb(), BOOT_L1_PA);
    assert_eq!(h.cpu.dacr(), KERNEL_DACR);

    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    let l1 = a.l1_phys().unwrap();
    assert_eq!(h.cpu.ttb(), l1);
    assert_eq!(h.cpu.dacr(), domain_dacr(a.domain().unwrap()));
}

#[test]
fn test_activate_fast_path() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    h.cpu.take_ops();

    h.ctx.activate(&a);
    let ops = h.cpu.take_ops();
    assert!(ops.contains(&CpuOp::SetTtb(a.l1_phys().unwrap())));
    assert!(ops.contains(&CpuOp::SetDacr(domain_dacr(a.domain().unwrap()))));
    assert_eq!(ops.last(), Some(&CpuOp::Cpwait));
    assert_eq!(a.cache_state(), CacheState::ALL);

    h.ctx.activate(&a);
    assert!(h.cpu.ops().is_empty());
}

#[test]
fn test_activate_switch_flushes_vivt_cache() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    let b = h.ctx.create();
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    map(&h, &b, 0x1000, 0x3000, VmProt::RW, EnterFlags::empty());

    h.ctx.activate(&a);
    h.cpu.take_ops();
    h.ctx.activate(&b);
    assert!(h.cpu.ops().contains(&CpuOp::IdcacheWbinvAll));
    assert_eq!(a.cache_state(), CacheState::NONE);
    assert_eq!(h.ctx.current().map(|pm| pm.id()), Some(b.id()));

    // Physically tagged caches survive the switch.
    let h = harness(PmapConfig::v7());
    let a = h.ctx.create();
    let b = h.ctx.create();
    h.ctx.activate(&a);
    h.cpu.take_ops();
    h.ctx.activate(&b);
    assert!(!h.cpu.ops().contains(&CpuOp::IdcacheWbinvAll));
}

#[test]
fn test_deferred_tlb_flush_on_activate() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    let b = h.ctx.create();
    h.ctx.activate(&a);

    map(&h, &b, 0x1000, 0x2000, VmProt::RW, EnterFlags::READ);
    h.cpu.take_ops();
    h.ctx.remove(&b, 0x1000, 0x2000);
    h.ctx.update(&b);

    // b is not resident: no TLB operation, just a debt.
    assert_eq!(h.cpu.count(CpuOp::is_tlb_op), 0);
    assert!(b.tlb_deferred());

    h.ctx.activate(&b);
    assert!(h.cpu.ops().contains(&CpuOp::TlbFlushId));
    assert!(!b.tlb_deferred());
}

#[test]
fn test_remove_after_kernel_switch_flushes_on_return() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::READ);

    // Switching to the kernel leaves a's entries in the TLB.
    h.ctx.activate(h.ctx.kernel_pmap());
    assert_eq!(a.cache_state(), CacheState::NONE);
    h.cpu.take_ops();

    h.ctx.remove(&a, 0x1000, 0x2000);
    h.ctx.update(&a);
    assert_eq!(h.cpu.count(CpuOp::is_tlb_op), 0);
    assert!(a.tlb_deferred());

    h.ctx.activate(&a);
    assert!(h.cpu.ops().contains(&CpuOp::TlbFlushId));
    assert!(!a.tlb_deferred());
}

#[test]
fn test_activate_kernel() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    h.ctx.activate(&a);

    h.ctx.activate(h.ctx.kernel_pmap());
    assert!(h.ctx.current().is_none());
    assert_eq!(h.cpu.ttb(), BOOT_L1_PA);
    assert_eq!(h.cpu.dacr(), KERNEL_DACR);
}

#[test]
fn test_activation_record() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    h.ctx.activate(&a);

    let rec = h.ctx.activation_record(&a);
    assert_eq!(rec.pagedir as PAddr, a.l1_phys().unwrap());
    assert_eq!(rec.dacr, domain_dacr(a.domain().unwrap()));
    assert_eq!(CacheState::unpack(rec.cstate), CacheState::ALL);

    assert_eq!(PMAP_ACTIVATION_PAGEDIR, 0);
    assert_eq!(PMAP_ACTIVATION_DACR, 4);
    assert_eq!(PMAP_ACTIVATION_CSTATE, 8);
}

#[test]
fn test_procwr_only_when_current() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.procwr(&a, 0x1000, 0x100);
    assert!(h.cpu.ops().is_empty());

    h.ctx.activate(&a);
    h.cpu.take_ops();
    h.ctx.procwr(&a, 0x1000, 0x100);
    assert_eq!(h.cpu.ops(), vec![CpuOp::IcacheSyncRange(0x1000, 0x100)]);
}

#[test]
fn test_domain_exhaustion() {
    let h = harness(PmapConfig::generic());
    let count = PMAP_DOMAINS + 1;

    let pmaps: Vec<Arc<Pmap>> = (0..count).map(|_| h.ctx.create()).collect();
    for (i, pm) in pmaps.iter().enumerate() {
        map(&h, pm, 0x1000, 0x10_0000 + i * PAGE_SIZE, VmProt::RW, EnterFlags::READ);
        h.ctx.activate(pm);
        assert!(pm.domain().is_some());
    }
    assert_eq!(h.ctx.domains_in_use(), PMAP_DOMAINS);
    assert!(h.cpu.ops().contains(&CpuOp::IdcacheWbinvAll));

    // The least recently used pmap lost its domain, not its mappings.
    assert_eq!(pmaps[0].domain(), None);
    for (i, pm) in pmaps.iter().enumerate() {
        assert_eq!(h.ctx.extract(pm, 0x1000), Some(0x10_0000 + i * PAGE_SIZE));
    }

    // Reactivation takes a domain back and relinks the tables with it.
    h.ctx.activate(&pmaps[0]);
    let domain = pmaps[0].domain().unwrap();
    assert_eq!(pmaps[1].domain(), None);
    let l1 = pmaps[0].inner.lock().l1.clone().unwrap();
    let l2b = h.ctx.get_l2_bucket(&pmaps[0], 0x1000).unwrap();
    assert_eq!(
        l1.entry_for(0x1000),
        h.ctx.templates().l1_c_entry(l2b.phys(), domain)
    );
    assert_eq!(h.cpu.dacr(), domain_dacr(domain));
}

// ============================================================================
// Kernel mappings and growth
// ============================================================================

#[test]
fn test_kenter_kremove() {
    let h = harness(PmapConfig::generic());
    let kpm = h.ctx.kernel_pmap().clone();
    let occupancy = h.ctx.get_l2_bucket(&kpm, KVA).unwrap().occupancy();

    h.ctx.kenter_pa(KVA + 0x2000, 0x0030_0000, VmProt::RW);
    assert_eq!(h.ctx.extract(&kpm, KVA + 0x2010), Some(0x0030_0010));
    assert!(h.ctx.templates().l2_s_cached(pte(&h.ctx, &kpm, KVA + 0x2000)));

    h.ctx.kenter_cache(KVA + 0x3000, 0x1000_0000, VmProt::RW, CacheMode::Device);
    // Device memory is bufferable only.
    let t = h.ctx.templates();
    assert_eq!(pte(&h.ctx, &kpm, KVA + 0x3000) & t.l2_s_cache_mask, L2_B);
    assert_eq!(
        h.ctx.get_l2_bucket(&kpm, KVA).unwrap().occupancy(),
        occupancy + 2
    );

    h.cpu.take_ops();
    h.ctx.kremove(KVA + 0x2000, 2 * PAGE_SIZE);
    assert_eq!(h.ctx.extract(&kpm, KVA + 0x2000), None);
    assert_eq!(h.ctx.extract(&kpm, KVA + 0x3000), None);
    assert_eq!(h.ctx.get_l2_bucket(&kpm, KVA).unwrap().occupancy(), occupancy);

    let ops = h.cpu.take_ops();
    assert!(ops.contains(&CpuOp::DcacheWbinvRange(KVA + 0x2000, PAGE_SIZE)));
    assert!(ops.contains(&CpuOp::TlbFlushDSe(KVA + 0x2000)));
    assert_eq!(ops.last(), Some(&CpuOp::Cpwait));
}

#[test]
#[should_panic(expected = "kenter_pa: no L2 table")]
fn test_kenter_without_table_panics() {
    let h = harness(PmapConfig::generic());
    h.ctx.kenter_pa(KERNEL_VM_BASE + 8 * L1_S_SIZE, 0x0030_0000, VmProt::RW);
}

#[test]
fn test_growkernel_distributes_to_user_l1s() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::empty());
    h.cpu.take_ops();

    let start = h.ctx.kernel_va_limit();
    let end = h.ctx.growkernel(start + 2 * L1_S_SIZE);
    assert_eq!(end, start + 2 * L1_S_SIZE);
    assert_eq!(h.ctx.kernel_va_limit(), end);

    let kl1 = h.ctx.kernel_l1();
    let ul1 = a.inner.lock().l1.clone().unwrap();
    for va in [start, start + L1_S_SIZE] {
        let pde = kl1.entry_for(va);
        assert!(l1pte_page_p(pde));
        assert_eq!(ul1.entry_for(va), pde);
    }

    let ops = h.cpu.ops();
    assert!(ops.contains(&CpuOp::DcacheWbinvAll));
    assert!(ops.contains(&CpuOp::TlbFlushD));

    // Already covered
    h.cpu.take_ops();
    assert_eq!(h.ctx.growkernel(start), end);
    assert!(h.cpu.ops().is_empty());

    // Tables created later inherit the new entries.
    let b = h.ctx.create();
    map(&h, &b, 0x1000, 0x3000, VmProt::RW, EnterFlags::empty());
    let bl1 = b.inner.lock().l1.clone().unwrap();
    assert_eq!(bl1.entry_for(start), kl1.entry_for(start));

    // The new kernel space is usable.
    h.ctx.kenter_pa(start + 0x1000, 0x0030_0000, VmProt::READ);
    assert_eq!(h.ctx.extract(h.ctx.kernel_pmap(), start + 0x1000), Some(0x0030_0000));
}

#[test]
fn test_devmap_lookups() {
    let config = PmapConfig::generic();
    let mut boot = boot_tables(&config);
    let uart = DevMap {
        va: 0xfd00_0000,
        pa: 0x1000_0000,
        size: L1_S_SIZE,
        prot: VmProt::RW,
        cache: CacheMode::Device,
    };
    boot.devmap_bootstrap(&[uart]);
    let h = build(config, ARENA, boot);

    assert_eq!(h.ctx.devmap_find_pa(0x1000_1000, 0x100), Some(uart));
    assert_eq!(h.ctx.devmap_find_va(0xfd0f_f000, PAGE_SIZE), Some(uart));
    assert_eq!(h.ctx.devmap_find_pa(0x100f_f000, 2 * PAGE_SIZE), None);
    assert_eq!(h.ctx.extract(h.ctx.kernel_pmap(), 0xfd00_1234), Some(0x1000_1234));

    let gpio = DevMap {
        va: 0xfe00_0000,
        pa: 0x2000_0000,
        size: PAGE_SIZE,
        prot: VmProt::RW,
        cache: CacheMode::Device,
    };
    h.ctx.devmap_register(&[gpio]);
    assert_eq!(h.ctx.devmap_find_pa(0x1000_1000, 0x100), None);
    assert_eq!(h.ctx.devmap_find_va(0xfe00_0000, PAGE_SIZE), Some(gpio));
}

// ============================================================================
// Page hooks
// ============================================================================

#[test]
fn test_zero_page_generic() {
    let h = harness(PmapConfig::generic());
    let kpm = h.ctx.kernel_pmap().clone();
    let cdst = KERNEL_VM_BASE + PAGE_SIZE;
    let t = *h.ctx.templates();

    h.ctx.zero_page(0x4000);
    let p = pte(&h.ctx, &kpm, cdst);
    assert_eq!(p as PAddr & L2_S_FRAME, 0x4000);
    assert!(t.l2_s_writable(p));
    assert_eq!(p & t.l2_s_cache_mask, t.l2_s_cache_mode);
    assert_eq!(
        h.cpu.take_ops(),
        vec![
            CpuOp::TlbFlushDSe(cdst),
            CpuOp::Cpwait,
            CpuOp::ZeroPage(cdst),
            CpuOp::DcacheWbinvRange(cdst, PAGE_SIZE),
        ]
    );
}

#[test]
fn test_zero_page_xscale_minidata() {
    let h = harness(PmapConfig::xscale());
    let kpm = h.ctx.kernel_pmap().clone();
    let cdst = KERNEL_VM_BASE + PAGE_SIZE;
    let t = *h.ctx.templates();

    h.ctx.zero_page(0x4000);
    let p = pte(&h.ctx, &kpm, cdst);
    assert_eq!(p & t.l2_s_cache_mask, t.l2_s_hook_cache_mode());
    assert_ne!(t.l2_s_hook_cache_mode(), t.l2_s_cache_mode);
    assert_eq!(h.cpu.ops().last(), Some(&CpuOp::CleanMinidata));
}

#[test]
fn test_copy_page_generic() {
    let h = harness(PmapConfig::generic());
    let kpm = h.ctx.kernel_pmap().clone();
    let (csrc, cdst) = (KERNEL_VM_BASE, KERNEL_VM_BASE + PAGE_SIZE);
    let t = *h.ctx.templates();

    h.ctx.copy_page(0x4000, 0x5000);
    assert!(!t.l2_s_writable(pte(&h.ctx, &kpm, csrc)));
    assert!(t.l2_s_writable(pte(&h.ctx, &kpm, cdst)));
    assert_eq!(
        h.cpu.take_ops(),
        vec![
            CpuOp::TlbFlushDSe(csrc),
            CpuOp::TlbFlushDSe(cdst),
            CpuOp::Cpwait,
            CpuOp::CopyPage(csrc, cdst),
            CpuOp::DcacheInvRange(csrc, PAGE_SIZE),
            CpuOp::DcacheWbinvRange(cdst, PAGE_SIZE),
        ]
    );
}

#[test]
fn test_copy_page_cleans_dirty_source() {
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    map(&h, &a, 0x1000, 0x4000, VmProt::RW, EnterFlags::WRITE);
    h.cpu.take_ops();

    h.ctx.copy_page(0x4000, 0x5000);
    let ops = h.cpu.take_ops();
    assert_eq!(ops.first(), Some(&CpuOp::DcacheWbRange(0x1000, PAGE_SIZE)));
    assert!(ops.contains(&CpuOp::CopyPage(KERNEL_VM_BASE, KERNEL_VM_BASE + PAGE_SIZE)));
}

// ============================================================================
// Descriptor write-back
// ============================================================================

#[test]
fn test_pte_sync_precedes_tlb_flush() {
    let h = harness(PmapConfig::sa1());
    let a = h.ctx.create();
    h.ctx.activate(&a);

    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::READ);
    h.cpu.take_ops();
    map(&h, &a, 0x1000, 0x3000, VmProt::RW, EnterFlags::READ);

    let pte_addr = h.ctx.get_l2_bucket(&a, 0x1000).unwrap().pte_addr(0x1000);
    let ops = h.cpu.take_ops();
    let sync = ops
        .iter()
        .rposition(|op| *op == CpuOp::DcacheWbRange(pte_addr, 4))
        .unwrap();
    let flush = ops
        .iter()
        .position(|op| *op == CpuOp::TlbFlushDSe(0x1000))
        .unwrap();
    assert!(sync < flush);

    // Without the requirement no descriptor is written back.
    let h = harness(PmapConfig::generic());
    let a = h.ctx.create();
    h.ctx.activate(&a);
    map(&h, &a, 0x1000, 0x2000, VmProt::RW, EnterFlags::READ);
    assert_eq!(h.cpu.count(|op| matches!(op, CpuOp::DcacheWbRange(_, 4))), 0);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_mapping_and_page_operations() {
    const PAGES: usize = 8;
    const SHARED: PAddr = 0x0010_0000;

    let h = Arc::new(harness(PmapConfig::generic()));
    let pmaps = [h.ctx.create(), h.ctx.create()];
    let done = Arc::new(AtomicBool::new(false));

    let mappers: Vec<_> = pmaps
        .iter()
        .enumerate()
        .map(|(n, pm)| {
            let (h, pm) = (h.clone(), pm.clone());
            std::thread::spawn(move || {
                let base = 0x0100_0000 + n * L1_S_SIZE;
                for round in 0..200 {
                    for i in 0..PAGES {
                        let access = if (round + i) % 2 == 0 {
                            EnterFlags::WRITE
                        } else {
                            EnterFlags::READ
                        };
                        map(&h, &pm, base + i * PAGE_SIZE, SHARED + i * PAGE_SIZE, VmProt::RW, access);
                    }
                    h.ctx.remove(&pm, base, base + PAGES / 2 * PAGE_SIZE);
                    h.ctx.update(&pm);
                }
            })
        })
        .collect();

    let pager = {
        let (h, done) = (h.clone(), done.clone());
        std::thread::spawn(move || {
            let mut passes = 0;
            while passes == 0 || !done.load(Ordering::Acquire) {
                for i in 0..PAGES {
                    let pg = h.ctx.page(SHARED + i * PAGE_SIZE).unwrap();
                    h.ctx.clear_modify(pg);
                    h.ctx.page_protect(pg, VmProt::READ);
                    h.ctx.clear_reference(pg);
                }
                passes += 1;
            }
        })
    };

    for mapper in mappers {
        mapper.join().unwrap();
    }
    done.store(true, Ordering::Release);
    pager.join().unwrap();

    for pm in &pmaps {
        assert_eq!(pm.stats(), PmapStats { resident: (PAGES / 2) as u32, wired: 0 });
    }
    for i in 0..PAGES {
        let pg = h.ctx.page(SHARED + i * PAGE_SIZE).unwrap();
        let expected = if i < PAGES / 2 { 0 } else { pmaps.len() };
        assert_eq!(pg.mapping_count(), expected);

        let md = pg.lock();
        let rw = md
            .pvh_list
            .iter()
            .filter(|pv| pv.flags.contains(PvFlags::WRITE))
            .count() as u32;
        assert_eq!((md.krw, md.kro), (0, 0));
        assert_eq!((md.urw, md.uro), (rw, expected as u32 - rw));
    }
}
