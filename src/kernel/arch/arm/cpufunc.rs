// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! CPU Function Table
//!
//! Cache maintenance, TLB maintenance and MMU register access differ between
//! ARM core families. The pmap never issues those operations directly; it
//! calls through a [`CpuFuncs`] object selected once at boot for the running
//! CPU class.
//!
//! [`SoftCpu`] is a software model of the table. It records every operation
//! in order and keeps the TTB and DACR values it was given, which is what
//! boot bring-up on a simulator and the unit tests need.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::kernel::vm::layout::{PAddr, VAddr};

/// Per-CPU-class cache, TLB and MMU operations
///
/// Range operations take virtual addresses in the currently loaded address
/// space. Implementations must be callable from any context the pmap runs in.
pub trait CpuFuncs: Send + Sync {
    /// Write back and invalidate the entire I+D cache
    fn idcache_wbinv_all(&self);

    /// Write back and invalidate the entire D-cache
    fn dcache_wbinv_all(&self);

    /// Write back and invalidate a range of the I+D cache
    fn idcache_wbinv_range(&self, va: VAddr, len: usize);

    /// Write back and invalidate a range of the D-cache
    fn dcache_wbinv_range(&self, va: VAddr, len: usize);

    /// Invalidate a range of the D-cache without writing it back
    fn dcache_inv_range(&self, va: VAddr, len: usize);

    /// Write back a range of the D-cache
    fn dcache_wb_range(&self, va: VAddr, len: usize);

    /// Make a range of freshly written instructions visible to the I-cache
    fn icache_sync_range(&self, va: VAddr, len: usize);

    /// Invalidate the entire I+D TLB
    fn tlb_flush_id(&self);

    /// Invalidate the entire D TLB
    fn tlb_flush_d(&self);

    /// Invalidate one I+D TLB entry
    fn tlb_flush_id_se(&self, va: VAddr);

    /// Invalidate one D TLB entry
    fn tlb_flush_d_se(&self, va: VAddr);

    /// Load the translation table base
    fn setttb(&self, ttb: PAddr);

    /// Load the domain access control register
    fn set_dacr(&self, dacr: u32);

    /// Current translation table base
    fn ttb(&self) -> PAddr;

    /// Current domain access control register
    fn dacr(&self) -> u32;

    /// Wait for outstanding coprocessor operations to complete
    fn cpwait(&self);

    /// Zero the page mapped at `va`
    fn zero_page(&self, va: VAddr);

    /// Copy the page mapped at `src` to the page mapped at `dst`
    fn copy_page(&self, src: VAddr, dst: VAddr);

    /// Clean the XScale mini-data cache
    ///
    /// Only meaningful on XScale; other classes never see it called.
    fn xscale_cache_clean_minidata(&self) {}
}

/// One operation issued to a [`SoftCpu`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuOp {
    IdcacheWbinvAll,
    DcacheWbinvAll,
    IdcacheWbinvRange(VAddr, usize),
    DcacheWbinvRange(VAddr, usize),
    DcacheInvRange(VAddr, usize),
    DcacheWbRange(VAddr, usize),
    IcacheSyncRange(VAddr, usize),
    TlbFlushId,
    TlbFlushD,
    TlbFlushIdSe(VAddr),
    TlbFlushDSe(VAddr),
    SetTtb(PAddr),
    SetDacr(u32),
    Cpwait,
    ZeroPage(VAddr),
    CopyPage(VAddr, VAddr),
    CleanMinidata,
}

impl CpuOp {
    /// Whether the operation invalidates TLB entries
    pub fn is_tlb_op(&self) -> bool {
        matches!(
            self,
            CpuOp::TlbFlushId | CpuOp::TlbFlushD | CpuOp::TlbFlushIdSe(_) | CpuOp::TlbFlushDSe(_)
        )
    }

    /// Whether the operation maintains the caches
    pub fn is_cache_op(&self) -> bool {
        matches!(
            self,
            CpuOp::IdcacheWbinvAll
                | CpuOp::DcacheWbinvAll
                | CpuOp::IdcacheWbinvRange(..)
                | CpuOp::DcacheWbinvRange(..)
                | CpuOp::DcacheInvRange(..)
                | CpuOp::DcacheWbRange(..)
                | CpuOp::IcacheSyncRange(..)
                | CpuOp::CleanMinidata
        )
    }
}

/// Recording software model of the CPU function table
pub struct SoftCpu {
    /// Operations issued so far, oldest first
    log: spin::Mutex<Vec<CpuOp>>,

    /// Translation table base
    ttb: AtomicU32,

    /// Domain access control register
    dacr: AtomicU32,
}

impl SoftCpu {
    /// Create a CPU with TTB and DACR cleared
    pub const fn new() -> Self {
        Self {
            log: spin::Mutex::new(Vec::new()),
            ttb: AtomicU32::new(0),
            dacr: AtomicU32::new(0),
        }
    }

    /// Snapshot of every operation recorded so far
    pub fn ops(&self) -> Vec<CpuOp> {
        self.log.lock().clone()
    }

    /// Drain the operation log
    pub fn take_ops(&self) -> Vec<CpuOp> {
        core::mem::take(&mut *self.log.lock())
    }

    /// Number of recorded operations matching `pred`
    pub fn count(&self, pred: impl Fn(&CpuOp) -> bool) -> usize {
        self.log.lock().iter().filter(|op| pred(op)).count()
    }

    fn record(&self, op: CpuOp) {
        self.log.lock().push(op);
    }
}

impl Default for SoftCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuFuncs for SoftCpu {
    fn idcache_wbinv_all(&self) {
        self.record(CpuOp::IdcacheWbinvAll);
    }

    fn dcache_wbinv_all(&self) {
        self.record(CpuOp::DcacheWbinvAll);
    }

    fn idcache_wbinv_range(&self, va: VAddr, len: usize) {
        self.record(CpuOp::IdcacheWbinvRange(va, len));
    }

    fn dcache_wbinv_range(&self, va: VAddr, len: usize) {
        self.record(CpuOp::DcacheWbinvRange(va, len));
    }

    fn dcache_inv_range(&self, va: VAddr, len: usize) {
        self.record(CpuOp::DcacheInvRange(va, len));
    }

    fn dcache_wb_range(&self, va: VAddr, len: usize) {
        self.record(CpuOp::DcacheWbRange(va, len));
    }

    fn icache_sync_range(&self, va: VAddr, len: usize) {
        self.record(CpuOp::IcacheSyncRange(va, len));
    }

    fn tlb_flush_id(&self) {
        self.record(CpuOp::TlbFlushId);
    }

    fn tlb_flush_d(&self) {
        self.record(CpuOp::TlbFlushD);
    }

    fn tlb_flush_id_se(&self, va: VAddr) {
        self.record(CpuOp::TlbFlushIdSe(va));
    }

    fn tlb_flush_d_se(&self, va: VAddr) {
        self.record(CpuOp::TlbFlushDSe(va));
    }

    fn setttb(&self, ttb: PAddr) {
        self.ttb.store(ttb as u32, Ordering::SeqCst);
        self.record(CpuOp::SetTtb(ttb));
    }

    fn set_dacr(&self, dacr: u32) {
        self.dacr.store(dacr, Ordering::SeqCst);
        self.record(CpuOp::SetDacr(dacr));
    }

    fn ttb(&self) -> PAddr {
        self.ttb.load(Ordering::SeqCst) as PAddr
    }

    fn dacr(&self) -> u32 {
        self.dacr.load(Ordering::SeqCst)
    }

    fn cpwait(&self) {
        barrier();
        self.record(CpuOp::Cpwait);
    }

    fn zero_page(&self, va: VAddr) {
        self.record(CpuOp::ZeroPage(va));
    }

    fn copy_page(&self, src: VAddr, dst: VAddr) {
        self.record(CpuOp::CopyPage(src, dst));
    }

    fn xscale_cache_clean_minidata(&self) {
        self.record(CpuOp::CleanMinidata);
    }
}

/// Full system barrier
#[cfg(target_arch = "aarch64")]
#[inline]
fn barrier() {
    use aarch64_cpu::asm::barrier::{dsb, isb, SY};
    dsb(SY);
    isb(SY);
}

/// Full system barrier
#[cfg(not(target_arch = "aarch64"))]
#[inline]
fn barrier() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers() {
        let cpu = SoftCpu::new();
        assert_eq!(cpu.ttb(), 0);
        cpu.setttb(0x8000_4000);
        cpu.set_dacr(0x4000_0001);
        assert_eq!(cpu.ttb(), 0x8000_4000);
        assert_eq!(cpu.dacr(), 0x4000_0001);
    }

    #[test]
    fn test_log_order_and_drain() {
        let cpu = SoftCpu::new();
        cpu.dcache_wb_range(0x1000, 4);
        cpu.tlb_flush_d_se(0x1000);
        cpu.cpwait();

        assert_eq!(
            cpu.take_ops(),
            vec![CpuOp::DcacheWbRange(0x1000, 4), CpuOp::TlbFlushDSe(0x1000), CpuOp::Cpwait]
        );
        assert!(cpu.ops().is_empty());
    }

    #[test]
    fn test_op_classes() {
        let cpu = SoftCpu::new();
        cpu.tlb_flush_id();
        cpu.idcache_wbinv_all();
        cpu.xscale_cache_clean_minidata();
        assert_eq!(cpu.count(CpuOp::is_tlb_op), 1);
        assert_eq!(cpu.count(CpuOp::is_cache_op), 2);
    }
}
