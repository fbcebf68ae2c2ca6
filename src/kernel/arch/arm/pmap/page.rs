// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Managed Page Metadata
//!
//! Every page of the managed physical ranges has a [`VmPage`] holding its
//! reverse mappings (one [`PvEntry`] per virtual mapping), the referenced and
//! modified attributes, and the read-only/read-write mapping counts the
//! cache alias logic works from.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::Pmap;
use crate::kernel::vm::layout::{PAddr, PhysRange, VAddr, PAGE_SIZE};

bitflags::bitflags! {
    /// Per-mapping flags, also used for the page attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PvFlags: u32 {
        /// Page was written through this mapping
        const MOD = 0x01;

        /// Page was accessed through this mapping
        const REF = 0x02;

        /// Mapping is wired
        const WIRED = 0x04;

        /// Mapping allows writes
        const WRITE = 0x08;

        /// Mapping allows execution
        const EXEC = 0x10;

        /// Uncached because of a user alias
        const UNC = 0x20;

        /// Uncached because of a kernel alias
        const KNC = 0x40;

        /// Uncached for any reason
        const NC = Self::UNC.bits() | Self::KNC.bits();
    }
}

impl PvFlags {
    /// Mapping was referenced and may hold instructions in the I-cache
    #[inline]
    pub const fn been_execd(self) -> bool {
        self.contains(Self::REF.union(Self::EXEC))
    }

    /// Mapping was referenced
    #[inline]
    pub const fn been_refd(self) -> bool {
        self.contains(Self::REF)
    }
}

/// One virtual mapping of a managed page
#[derive(Clone)]
pub struct PvEntry {
    /// Address space of the mapping
    pub pmap: Arc<Pmap>,

    /// Virtual address of the mapping
    pub va: VAddr,

    /// Mapping flags
    pub flags: PvFlags,
}

impl PvEntry {
    /// Check whether this entry is the mapping `(pm, va)`
    #[inline]
    pub fn is(&self, pm: &Pmap, va: VAddr) -> bool {
        self.pmap.id() == pm.id() && self.va == va
    }
}

impl core::fmt::Debug for PvEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PvEntry")
            .field("pmap", &self.pmap.id())
            .field("va", &format_args!("{:#x}", self.va))
            .field("flags", &self.flags)
            .finish()
    }
}

/// Mutable metadata of a managed page, protected by the page lock
#[derive(Debug, Default)]
pub struct PageMd {
    /// Reverse mappings
    pub pvh_list: Vec<PvEntry>,

    /// Aggregate attributes (REF, MOD and the NC bits)
    pub attrs: PvFlags,

    /// Kernel read/write mappings
    pub krw: u32,

    /// Kernel read-only mappings
    pub kro: u32,

    /// User read/write mappings
    pub urw: u32,

    /// User read-only mappings
    pub uro: u32,
}

impl PageMd {
    /// Total kernel mappings
    pub fn k_mappings(&self) -> u32 {
        self.krw + self.kro
    }

    /// Total user mappings
    pub fn u_mappings(&self) -> u32 {
        self.urw + self.uro
    }
}

/// A managed physical page
pub struct VmPage {
    phys: PAddr,
    md: spin::Mutex<PageMd>,
}

impl VmPage {
    fn new(phys: PAddr) -> Self {
        Self {
            phys,
            md: spin::Mutex::new(PageMd::default()),
        }
    }

    /// Physical address of the page
    pub fn phys(&self) -> PAddr {
        self.phys
    }

    /// Lock the page metadata
    pub fn lock(&self) -> spin::MutexGuard<'_, PageMd> {
        self.md.lock()
    }

    /// Number of virtual mappings of the page
    pub fn mapping_count(&self) -> usize {
        self.md.lock().pvh_list.len()
    }

    /// Aggregate attributes
    pub fn attrs(&self) -> PvFlags {
        self.md.lock().attrs
    }
}

impl core::fmt::Debug for VmPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmPage")
            .field("phys", &format_args!("{:#x}", self.phys))
            .finish_non_exhaustive()
    }
}

struct PhysSegment {
    range: PhysRange,
    pages: Box<[VmPage]>,
}

/// Metadata for every page of the managed physical ranges
pub struct PhysPageTable {
    segments: Vec<PhysSegment>,
}

impl PhysPageTable {
    pub fn new(ranges: &[PhysRange]) -> Self {
        let segments = ranges
            .iter()
            .map(|&range| PhysSegment {
                range,
                pages: (0..range.page_count())
                    .map(|i| VmPage::new(range.start + i * PAGE_SIZE))
                    .collect(),
            })
            .collect();
        Self { segments }
    }

    /// Metadata of the page containing `pa`, if it is managed
    pub fn lookup(&self, pa: PAddr) -> Option<&VmPage> {
        self.segments
            .iter()
            .find(|seg| seg.range.contains(pa))
            .and_then(|seg| seg.pages.get((pa - seg.range.start) / PAGE_SIZE))
    }

    /// Number of managed pages
    pub fn page_count(&self) -> usize {
        self.segments.iter().map(|seg| seg.pages.len()).sum()
    }
}
