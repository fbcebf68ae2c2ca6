// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! L1 Translation Tables and Domains
//!
//! Every user pmap gets its own 16KB L1 table the first time it installs a
//! mapping. All live L1 tables, the kernel's included, are kept in an
//! [`L1Registry`] so that kernel growth can link a new kernel L2 table into
//! each of them.
//!
//! The 16 ARM domains are split into the kernel domain (15) and fifteen user
//! domains handed out by the [`DomainAllocator`]. When all fifteen are taken
//! the least recently used owner that is not running loses its domain; it
//! gets a fresh one the next time it is activated.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::{CacheState, Pmap, DOMAIN_NONE};
use crate::kernel::arch::arm::cpufunc::CpuFuncs;
use crate::kernel::arch::arm::pte::PMAP_DOMAINS;
use crate::kernel::vm::layout::{l1_idx, PAddr, VAddr, KERNEL_BASE, L1_ENTRIES};

use super::l2::zeroed_table;

/// Registry slot of a table that is not registered
const NO_SLOT: usize = usize::MAX;

/// One L1 translation table
pub struct L1Table {
    /// Physical address (16KB aligned)
    phys: PAddr,

    /// Descriptors
    entries: Box<[AtomicU32]>,

    /// Number of pmaps using the table
    refs: AtomicU32,

    /// Registry slot
    slot: AtomicUsize,
}

impl L1Table {
    /// Create an empty table at `phys`, referenced once
    pub(crate) fn new(phys: PAddr) -> Self {
        Self::from_entries(phys, zeroed_table(L1_ENTRIES))
    }

    /// Adopt a populated table (the boot L1)
    pub(crate) fn from_entries(phys: PAddr, entries: Box<[AtomicU32]>) -> Self {
        debug_assert_eq!(entries.len(), L1_ENTRIES);
        Self {
            phys,
            entries,
            refs: AtomicU32::new(1),
            slot: AtomicUsize::new(NO_SLOT),
        }
    }

    /// Physical address of the table
    pub fn phys(&self) -> PAddr {
        self.phys
    }

    /// Read entry `idx`
    #[inline]
    pub fn entry(&self, idx: usize) -> u32 {
        self.entries[idx].load(Ordering::Acquire)
    }

    /// Read the entry mapping `va`
    #[inline]
    pub fn entry_for(&self, va: VAddr) -> u32 {
        self.entry(l1_idx(va))
    }

    #[inline]
    pub(crate) fn set_entry(&self, idx: usize, pde: u32) {
        self.entries[idx].store(pde, Ordering::Release);
    }

    /// Address of entry `idx`, for cache maintenance
    #[inline]
    pub(crate) fn entry_addr(&self, idx: usize) -> VAddr {
        &self.entries[idx] as *const AtomicU32 as VAddr
    }

    pub(crate) fn table_addr(&self) -> VAddr {
        self.entries.as_ptr() as VAddr
    }

    /// Number of pmaps using the table
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    /// Drop a reference; returns the references left
    pub(crate) fn release(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn copy_kernel_entries(&self, kernel: &L1Table) {
        for idx in l1_idx(KERNEL_BASE)..L1_ENTRIES {
            self.set_entry(idx, kernel.entry(idx));
        }
    }
}

/// Slab of every live L1 table
pub struct L1Registry {
    inner: spin::Mutex<L1Slab>,
}

struct L1Slab {
    slots: Vec<Option<Arc<L1Table>>>,
    free: Vec<usize>,
    count: usize,
}

impl L1Registry {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(L1Slab {
                slots: Vec::new(),
                free: Vec::new(),
                count: 0,
            }),
        }
    }

    /// Add a table
    ///
    /// When `kernel` is given the kernel half of the new table is copied from
    /// it while the registry lock is held, so a concurrent kernel growth
    /// cannot be missed.
    pub fn register(&self, l1: &Arc<L1Table>, kernel: Option<&L1Table>) {
        let mut slab = self.inner.lock();
        if let Some(kernel) = kernel {
            l1.copy_kernel_entries(kernel);
        }
        let slot = match slab.free.pop() {
            Some(slot) => {
                slab.slots[slot] = Some(l1.clone());
                slot
            }
            None => {
                slab.slots.push(Some(l1.clone()));
                slab.slots.len() - 1
            }
        };
        l1.slot.store(slot, Ordering::Relaxed);
        slab.count += 1;
    }

    /// Remove a table
    pub fn unregister(&self, l1: &L1Table) {
        let mut slab = self.inner.lock();
        let slot = l1.slot.swap(NO_SLOT, Ordering::Relaxed);
        assert!(slot != NO_SLOT, "unregister: L1 {:#x} not registered", l1.phys());
        slab.slots[slot] = None;
        slab.free.push(slot);
        slab.count -= 1;
    }

    /// Call `f` on every registered table with the registry locked
    pub fn for_each(&self, mut f: impl FnMut(&L1Table)) {
        let slab = self.inner.lock();
        for l1 in slab.slots.iter().flatten() {
            f(l1);
        }
    }

    /// Number of registered tables
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for L1Registry {
    fn default() -> Self {
        Self::new()
    }
}

struct DomainOwner {
    pmap_id: usize,
    pmap: Weak<Pmap>,
    stamp: u64,
}

/// Allocator for the fifteen user domains
pub struct DomainAllocator {
    inner: spin::Mutex<DomainTable>,
}

struct DomainTable {
    owners: [Option<DomainOwner>; PMAP_DOMAINS],
    clock: u64,
}

impl DomainAllocator {
    pub const fn new() -> Self {
        const NONE: Option<DomainOwner> = None;
        Self {
            inner: spin::Mutex::new(DomainTable {
                owners: [NONE; PMAP_DOMAINS],
                clock: 0,
            }),
        }
    }

    /// Give `pm` a domain
    ///
    /// A free domain is used when there is one. Otherwise the least recently
    /// used owner other than `current` is evicted: the whole cache is written
    /// back and the TLB flushed, since the victim's entries would otherwise
    /// be reachable through the recycled domain. Never fails.
    pub fn assign(&self, pm: &Pmap, current: usize, cpu: &dyn CpuFuncs) -> u8 {
        let mut table = self.inner.lock();
        table.clock += 1;
        let stamp = table.clock;

        let free = table.owners.iter().position(|owner| match owner {
            None => true,
            Some(o) => o.pmap.strong_count() == 0,
        });

        let domain = match free {
            Some(d) => d,
            None => {
                let victim = table
                    .owners
                    .iter()
                    .enumerate()
                    .filter_map(|(d, o)| o.as_ref().map(|o| (d, o)))
                    .filter(|(_, o)| o.pmap_id != current && o.pmap_id != pm.id)
                    .min_by_key(|(_, o)| o.stamp)
                    .map(|(d, _)| d);
                let d = match victim {
                    Some(d) => d,
                    None => panic!("assign_domain: no domain can be recycled for pmap {}", pm.id),
                };

                cpu.idcache_wbinv_all();
                cpu.tlb_flush_id();

                if let Some(owner) = table.owners[d].take() {
                    if let Some(victim) = owner.pmap.upgrade() {
                        victim.domain.store(DOMAIN_NONE, Ordering::Release);
                        victim.set_cache_state(CacheState::NONE);
                    }
                    crate::log_debug!(
                        "pmap: domain {} recycled from pmap {} to pmap {}",
                        d,
                        owner.pmap_id,
                        pm.id
                    );
                }
                d
            }
        };

        table.owners[domain] = Some(DomainOwner {
            pmap_id: pm.id,
            pmap: pm.self_ref.clone(),
            stamp,
        });
        pm.domain.store(domain as u8, Ordering::Release);
        domain as u8
    }

    /// Mark `domain` as just used
    pub fn touch(&self, domain: u8) {
        let mut table = self.inner.lock();
        table.clock += 1;
        let stamp = table.clock;
        if let Some(owner) = table.owners.get_mut(domain as usize).and_then(|o| o.as_mut()) {
            owner.stamp = stamp;
        }
    }

    /// Give back `domain` if `pmap_id` still owns it
    pub fn release(&self, domain: u8, pmap_id: usize) {
        let mut table = self.inner.lock();
        if let Some(slot) = table.owners.get_mut(domain as usize) {
            if slot.as_ref().map_or(false, |o| o.pmap_id == pmap_id) {
                *slot = None;
            }
        }
    }

    /// Number of domains currently owned
    pub fn in_use(&self) -> usize {
        self.inner
            .lock()
            .owners
            .iter()
            .filter(|o| o.as_ref().map_or(false, |o| o.pmap.strong_count() > 0))
            .count()
    }
}

impl Default for DomainAllocator {
    fn default() -> Self {
        Self::new()
    }
}
