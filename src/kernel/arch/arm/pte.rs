// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! ARM Short-Descriptor Encoding
//!
//! Bit layouts of the first and second level translation table entries for
//! the MMU variants the pmap supports, and the per-variant templates the rest
//! of the pmap builds every descriptor from.
//!
//! # Variants
//!
//! - **Generic**: ARMv4/ARMv5 (ARM9, ARM10, SA-1). Four AP fields per small
//!   page (one per 1KB subpage), `IMP` bits set in sections and coarse tables.
//! - **XScale**: extended small pages with a single AP field and the TEX `X`
//!   bit selecting write-allocate or the mini-data cache.
//! - **V7**: ARMv7 short descriptors with the `AP[2:0]` encoding (AP2 makes a
//!   mapping read-only), TEX/C/B memory types and execute-never.
//!
//! The variant is chosen once at boot. [`PteTemplates`] then holds the data
//! table for that variant and every later encoding is a plain lookup in it,
//! so systems supporting a single variant and systems supporting several run
//! the same code.

use crate::kernel::vm::layout::{PAddr, L2_S_FRAME};
use crate::kernel::vm::VmProt;

// ============================================================================
// L1 Descriptors
// ============================================================================

/// Invalid L1 entry
pub const L1_TYPE_INV: u32 = 0x00;

/// Coarse L2 table
pub const L1_TYPE_C: u32 = 0x01;

/// Section
pub const L1_TYPE_S: u32 = 0x02;

/// Fine L2 table (unused)
pub const L1_TYPE_F: u32 = 0x03;

/// L1 type mask
pub const L1_TYPE_MASK: u32 = 0x03;

/// Section bufferable
pub const L1_S_B: u32 = 0x04;

/// Section cacheable
pub const L1_S_C: u32 = 0x08;

/// Section implementation-defined bit (must be set on ARMv4/v5)
pub const L1_S_IMP: u32 = 0x10;

/// Section domain field mask
pub const L1_S_DOM_MASK: u32 = 0xf << 5;

/// Section base address mask
pub const L1_S_ADDR_MASK: u32 = 0xfff0_0000;

/// XScale section ECC/P bit
pub const L1_S_XSCALE_P: u32 = 0x200;

/// ARMv7 section execute-never
pub const L1_S_V7_XN: u32 = 0x10;

/// Coarse table implementation-defined bit 2
pub const L1_C_IMP2: u32 = 0x10;

/// Coarse table domain field mask
pub const L1_C_DOM_MASK: u32 = 0xf << 5;

/// Coarse table base address mask
pub const L1_C_ADDR_MASK: u32 = 0xffff_fc00;

/// Section domain field
#[inline]
pub const fn l1_s_dom(domain: u8) -> u32 {
    ((domain as u32) & 0xf) << 5
}

/// Section access permissions (ARMv4/v5, XScale)
#[inline]
pub const fn l1_s_ap(ap: u32) -> u32 {
    ap << 10
}

/// XScale section TEX field
#[inline]
pub const fn l1_s_xscale_tex(tex: u32) -> u32 {
    tex << 12
}

/// ARMv7 section access permissions, `ap` is AP[2:0]
#[inline]
pub const fn l1_s_v7_ap(ap: u32) -> u32 {
    ((ap & 0x3) << 10) | ((ap & 0x4) << 13)
}

/// ARMv7 section TEX field
#[inline]
pub const fn l1_s_v7_tex(tex: u32) -> u32 {
    tex << 12
}

/// Coarse table domain field
#[inline]
pub const fn l1_c_dom(domain: u8) -> u32 {
    ((domain as u32) & 0xf) << 5
}

// ============================================================================
// L2 Descriptors
// ============================================================================

/// Invalid L2 entry (also used for reference emulation)
pub const L2_TYPE_INV: u32 = 0x00;

/// Large page (64KB)
pub const L2_TYPE_L: u32 = 0x01;

/// Small page (4KB)
pub const L2_TYPE_S: u32 = 0x02;

/// Tiny page on ARMv4/v5 fine tables
pub const L2_TYPE_T: u32 = 0x03;

/// XScale extended small page
pub const L2_TYPE_XSCALE_XS: u32 = 0x03;

/// L2 type mask
pub const L2_TYPE_MASK: u32 = 0x03;

/// Bufferable
pub const L2_B: u32 = 0x04;

/// Cacheable
pub const L2_C: u32 = 0x08;

/// ARMv7 small page execute-never
pub const L2_V7_S_XN: u32 = 0x01;

/// ARMv7 large page execute-never
pub const L2_V7_L_XN: u32 = 0x8000;

/// ARMv7 AP2 (read-only) bit of small and large pages
pub const L2_V7_APX: u32 = 0x200;

/// AP field of subpage 0
#[inline]
pub const fn l2_ap0(ap: u32) -> u32 {
    ap << 4
}

/// AP field replicated over all four subpages
#[inline]
pub const fn l2_ap(ap: u32) -> u32 {
    (ap << 4) | (ap << 6) | (ap << 8) | (ap << 10)
}

/// XScale large page TEX field
#[inline]
pub const fn l2_xscale_l_tex(tex: u32) -> u32 {
    tex << 12
}

/// XScale extended small page TEX field
#[inline]
pub const fn l2_xscale_t_tex(tex: u32) -> u32 {
    tex << 6
}

/// ARMv7 small and large page access permissions, `ap` is AP[2:0]
#[inline]
pub const fn l2_v7_ap(ap: u32) -> u32 {
    ((ap & 0x3) << 4) | ((ap & 0x4) << 7)
}

/// ARMv7 small page TEX field
#[inline]
pub const fn l2_v7_s_tex(tex: u32) -> u32 {
    tex << 6
}

/// ARMv7 large page TEX field
#[inline]
pub const fn l2_v7_l_tex(tex: u32) -> u32 {
    tex << 12
}

// ============================================================================
// Access Permissions and Domains
// ============================================================================

/// Kernel read-only (with the S bit set in the control register)
pub const AP_KR: u32 = 0x00;

/// Kernel read/write
pub const AP_KRW: u32 = 0x01;

/// Kernel read/write, user read-only
pub const AP_KRWUR: u32 = 0x02;

/// Kernel and user read/write
pub const AP_KRWURW: u32 = 0x03;

/// Write bit of the ARMv4/v5 AP encoding
pub const AP_W: u32 = 0x01;

/// User bit of the ARMv4/v5 AP encoding
pub const AP_U: u32 = 0x02;

/// ARMv7 kernel read/write
pub const AP_V7_KRW: u32 = 0b001;

/// ARMv7 kernel and user read/write
pub const AP_V7_KRWURW: u32 = 0b011;

/// ARMv7 kernel read-only
pub const AP_V7_KR: u32 = 0b101;

/// ARMv7 kernel and user read-only
pub const AP_V7_KRUR: u32 = 0b111;

/// XScale `X` bit in the TEX field
pub const TEX_XSCALE_X: u32 = 0x01;

/// Number of domains available to user pmaps
pub const PMAP_DOMAINS: usize = 15;

/// Domain reserved for the kernel pmap
pub const PMAP_DOMAIN_KERNEL: u8 = 15;

/// Domain access: no access
pub const DOMAIN_FAULT: u32 = 0x00;

/// Domain access: checked against the AP bits
pub const DOMAIN_CLIENT: u32 = 0x01;

/// Domain access: not checked
pub const DOMAIN_MANAGER: u32 = 0x03;

/// Domain access control register value giving client access to the kernel
/// domain and to `domain`
#[inline]
pub const fn domain_dacr(domain: u8) -> u32 {
    (DOMAIN_CLIENT << (PMAP_DOMAIN_KERNEL as u32 * 2)) | (DOMAIN_CLIENT << (domain as u32 * 2))
}

// ============================================================================
// Descriptor Predicates
// ============================================================================

/// Check whether an L1 entry is a section
#[inline]
pub const fn l1pte_section_p(pde: u32) -> bool {
    (pde & L1_TYPE_MASK) == L1_TYPE_S
}

/// Check whether an L1 entry points at a coarse L2 table
#[inline]
pub const fn l1pte_page_p(pde: u32) -> bool {
    (pde & L1_TYPE_MASK) == L1_TYPE_C
}

/// Check whether an L2 entry translates (reference-emulated entries do not)
#[inline]
pub const fn l2pte_valid(pte: u32) -> bool {
    (pte & L2_TYPE_MASK) != L2_TYPE_INV
}

/// Check whether an L2 entry is a large page
#[inline]
pub const fn l2pte_large_p(pte: u32) -> bool {
    (pte & L2_TYPE_MASK) == L2_TYPE_L
}

/// Physical frame of a small page entry
#[inline]
pub const fn l2pte_pa(pte: u32) -> PAddr {
    (pte as PAddr) & L2_S_FRAME
}

// ============================================================================
// Generic Requests
// ============================================================================

/// Supported MMU variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuVariant {
    /// ARMv4/ARMv5 cores
    Generic,

    /// Intel XScale
    XScale,

    /// ARMv7 short-descriptor format
    V7,
}

impl MmuVariant {
    /// Check whether the data cache is virtually indexed and tagged, so that
    /// aliases and context switches need cache maintenance
    pub const fn has_vivt_cache(self) -> bool {
        !matches!(self, MmuVariant::V7)
    }
}

/// Owner of a mapping for protection purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteKind {
    /// Kernel-only mapping
    Kernel,

    /// Mapping accessible from user mode
    User,
}

/// Entry granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// 1MB L1 section
    Section,

    /// 64KB L2 large page
    LargePage,

    /// 4KB L2 small page
    SmallPage,
}

/// Generic cache-mode request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Write-back cacheable (the default for RAM)
    WriteBack,

    /// Write-through cacheable
    WriteThrough,

    /// Normal memory, not cacheable
    NonCacheable,

    /// Device or strongly-ordered memory
    Device,

    /// Mode used for memory holding page tables
    PageTable,
}

// ============================================================================
// Per-Variant Templates
// ============================================================================

/// Descriptor templates for the MMU variant in use
///
/// Built once at boot from the variant and the cache configuration; every
/// field is a ready-made bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteTemplates {
    /// Variant these templates were built for
    pub variant: MmuVariant,

    /// Section prototype
    pub l1_s_proto: u32,

    /// Coarse table prototype
    pub l1_c_proto: u32,

    /// Large page prototype
    pub l2_l_proto: u32,

    /// Small page prototype
    pub l2_s_proto: u32,

    /// Cache attribute mask of a section
    pub l1_s_cache_mask: u32,

    /// Cache attribute mask of a large page
    pub l2_l_cache_mask: u32,

    /// Cache attribute mask of a small page
    pub l2_s_cache_mask: u32,

    /// Default cache mode of a section
    pub l1_s_cache_mode: u32,

    /// Default cache mode of a large page
    pub l2_l_cache_mode: u32,

    /// Default cache mode of a small page
    pub l2_s_cache_mode: u32,

    /// Section cache mode for page table memory
    pub l1_s_cache_mode_pt: u32,

    /// Large page cache mode for page table memory
    pub l2_l_cache_mode_pt: u32,

    /// Small page cache mode for page table memory
    pub l2_s_cache_mode_pt: u32,

    /// Small page bits granting user access
    pub l2_s_prot_u: u32,

    /// Small page bits controlling write access
    pub l2_s_prot_w: u32,

    /// All small page protection bits
    pub l2_s_prot_mask: u32,

    dcache_write_through: bool,
    write_allocate: bool,
}

impl PteTemplates {
    /// Build the templates for a variant
    ///
    /// # Arguments
    ///
    /// * `variant` - MMU variant selected at boot
    /// * `dcache_write_through` - the data cache cannot write back
    /// * `write_allocate` - request write-allocate for write-back memory
    ///   (XScale `X` bit, ARMv7 `TEX=001`)
    pub fn new(variant: MmuVariant, dcache_write_through: bool, write_allocate: bool) -> Self {
        let mut t = Self {
            variant,
            l1_s_proto: 0,
            l1_c_proto: 0,
            l2_l_proto: L2_TYPE_L,
            l2_s_proto: 0,
            l1_s_cache_mask: 0,
            l2_l_cache_mask: 0,
            l2_s_cache_mask: 0,
            l1_s_cache_mode: 0,
            l2_l_cache_mode: 0,
            l2_s_cache_mode: 0,
            l1_s_cache_mode_pt: 0,
            l2_l_cache_mode_pt: 0,
            l2_s_cache_mode_pt: 0,
            l2_s_prot_u: 0,
            l2_s_prot_w: 0,
            l2_s_prot_mask: 0,
            dcache_write_through,
            write_allocate,
        };

        match variant {
            MmuVariant::Generic => {
                t.l1_s_proto = L1_TYPE_S | L1_S_IMP;
                t.l1_c_proto = L1_TYPE_C | L1_C_IMP2;
                t.l2_s_proto = L2_TYPE_S;
                t.l1_s_cache_mask = L1_S_B | L1_S_C;
                t.l2_l_cache_mask = L2_B | L2_C;
                t.l2_s_cache_mask = L2_B | L2_C;
                t.l2_s_prot_u = l2_ap(AP_U);
                t.l2_s_prot_w = l2_ap(AP_W);
            }
            MmuVariant::XScale => {
                t.l1_s_proto = L1_TYPE_S;
                t.l1_c_proto = L1_TYPE_C;
                t.l2_s_proto = L2_TYPE_XSCALE_XS;
                t.l1_s_cache_mask = L1_S_B | L1_S_C | l1_s_xscale_tex(TEX_XSCALE_X);
                t.l2_l_cache_mask = L2_B | L2_C | l2_xscale_l_tex(TEX_XSCALE_X);
                t.l2_s_cache_mask = L2_B | L2_C | l2_xscale_t_tex(TEX_XSCALE_X);
                t.l2_s_prot_u = l2_ap0(AP_U);
                t.l2_s_prot_w = l2_ap0(AP_W);
            }
            MmuVariant::V7 => {
                t.l1_s_proto = L1_TYPE_S;
                t.l1_c_proto = L1_TYPE_C;
                t.l2_s_proto = L2_TYPE_S;
                t.l1_s_cache_mask = L1_S_B | L1_S_C | l1_s_v7_tex(0x7);
                t.l2_l_cache_mask = L2_B | L2_C | l2_v7_l_tex(0x7);
                t.l2_s_cache_mask = L2_B | L2_C | l2_v7_s_tex(0x7);
                t.l2_s_prot_u = l2_v7_ap(0b010);
                // AP2 set means read-only on ARMv7
                t.l2_s_prot_w = L2_V7_APX;
            }
        }
        t.l2_s_prot_mask = t.l2_s_prot_u | t.l2_s_prot_w;

        t.l1_s_cache_mode = t.cache_bits(CacheMode::WriteBack, Granularity::Section);
        t.l2_l_cache_mode = t.cache_bits(CacheMode::WriteBack, Granularity::LargePage);
        t.l2_s_cache_mode = t.cache_bits(CacheMode::WriteBack, Granularity::SmallPage);
        t.l1_s_cache_mode_pt = t.cache_bits(CacheMode::PageTable, Granularity::Section);
        t.l2_l_cache_mode_pt = t.cache_bits(CacheMode::PageTable, Granularity::LargePage);
        t.l2_s_cache_mode_pt = t.cache_bits(CacheMode::PageTable, Granularity::SmallPage);
        t
    }

    /// Protection bits for a mapping
    ///
    /// Readability is implied; `writable` selects read/write over read-only.
    pub fn protection_bits(&self, kind: PteKind, writable: bool, gran: Granularity) -> u32 {
        match self.variant {
            MmuVariant::Generic | MmuVariant::XScale => {
                let mut ap = 0;
                if kind == PteKind::User {
                    ap |= AP_U;
                }
                if writable {
                    ap |= AP_W;
                }
                match gran {
                    Granularity::Section => l1_s_ap(ap),
                    Granularity::LargePage => l2_ap(ap),
                    Granularity::SmallPage if self.variant == MmuVariant::XScale => l2_ap0(ap),
                    Granularity::SmallPage => l2_ap(ap),
                }
            }
            MmuVariant::V7 => {
                let ap = match (kind, writable) {
                    (PteKind::Kernel, true) => AP_V7_KRW,
                    (PteKind::Kernel, false) => AP_V7_KR,
                    (PteKind::User, true) => AP_V7_KRWURW,
                    (PteKind::User, false) => AP_V7_KRUR,
                };
                match gran {
                    Granularity::Section => l1_s_v7_ap(ap),
                    Granularity::LargePage | Granularity::SmallPage => l2_v7_ap(ap),
                }
            }
        }
    }

    /// Cache-control bits for a cache mode
    pub fn cache_bits(&self, mode: CacheMode, gran: Granularity) -> u32 {
        // B and C sit at the same positions in every descriptor type.
        let (b, c) = (L2_B, L2_C);
        match self.variant {
            MmuVariant::Generic => match mode {
                CacheMode::WriteBack => b | c,
                CacheMode::WriteThrough => c,
                CacheMode::NonCacheable => 0,
                CacheMode::Device => b,
                CacheMode::PageTable if self.dcache_write_through => b | c,
                CacheMode::PageTable => c,
            },
            MmuVariant::XScale => {
                let x = match gran {
                    Granularity::Section => l1_s_xscale_tex(TEX_XSCALE_X),
                    Granularity::LargePage => l2_xscale_l_tex(TEX_XSCALE_X),
                    Granularity::SmallPage => l2_xscale_t_tex(TEX_XSCALE_X),
                };
                match mode {
                    CacheMode::WriteBack if self.write_allocate => x | b | c,
                    CacheMode::WriteBack => b | c,
                    CacheMode::WriteThrough | CacheMode::PageTable => c,
                    CacheMode::NonCacheable => 0,
                    CacheMode::Device => b,
                }
            }
            MmuVariant::V7 => {
                let tex = |v: u32| match gran {
                    Granularity::Section => l1_s_v7_tex(v),
                    Granularity::LargePage => l2_v7_l_tex(v),
                    Granularity::SmallPage => l2_v7_s_tex(v),
                };
                match mode {
                    CacheMode::WriteBack if self.write_allocate => tex(1) | b | c,
                    CacheMode::WriteBack => b | c,
                    CacheMode::WriteThrough | CacheMode::PageTable => c,
                    CacheMode::NonCacheable => tex(1),
                    CacheMode::Device => b,
                }
            }
        }
    }

    /// Execute-never bits for a non-executable mapping
    pub fn execute_never(&self, gran: Granularity) -> u32 {
        match (self.variant, gran) {
            (MmuVariant::V7, Granularity::Section) => L1_S_V7_XN,
            (MmuVariant::V7, Granularity::LargePage) => L2_V7_L_XN,
            (MmuVariant::V7, Granularity::SmallPage) => L2_V7_S_XN,
            _ => 0,
        }
    }

    /// Small page protection bits
    #[inline]
    pub fn l2_s_prot(&self, kind: PteKind, writable: bool) -> u32 {
        self.protection_bits(kind, writable, Granularity::SmallPage)
    }

    /// Small page type bits, carrying execute-never where supported
    #[inline]
    pub fn l2_s_proto_exec(&self, exec: bool) -> u32 {
        if exec {
            self.l2_s_proto
        } else {
            self.l2_s_proto | self.execute_never(Granularity::SmallPage)
        }
    }

    /// Check whether a small page entry allows writes
    #[inline]
    pub fn l2_s_writable(&self, pte: u32) -> bool {
        match self.variant {
            MmuVariant::V7 => pte & L2_V7_APX == 0,
            _ => pte & self.l2_s_prot_w != 0,
        }
    }

    /// Grant write access in a small page entry
    #[inline]
    pub fn l2_s_set_writable(&self, pte: u32) -> u32 {
        match self.variant {
            MmuVariant::V7 => pte & !L2_V7_APX,
            _ => pte | self.l2_s_prot_w,
        }
    }

    /// Revoke write access in a small page entry
    #[inline]
    pub fn l2_s_clear_writable(&self, pte: u32) -> u32 {
        match self.variant {
            MmuVariant::V7 => pte | L2_V7_APX,
            _ => pte & !self.l2_s_prot_w,
        }
    }

    /// Check whether a small page entry is accessible from user mode
    #[inline]
    pub fn l2_s_user(&self, pte: u32) -> bool {
        pte & self.l2_s_prot_u != 0
    }

    /// Turn a reference-emulated (invalid) entry back into a small page
    #[inline]
    pub fn l2_s_revalidate(&self, pte: u32, exec: bool) -> u32 {
        (pte & !(L2_TYPE_MASK | self.execute_never(Granularity::SmallPage)))
            | self.l2_s_proto_exec(exec)
    }

    /// Cache bits used for the page-copy and page-zero hooks
    ///
    /// XScale routes these through the mini-data cache so bulk copies do not
    /// evict the main data cache.
    pub fn l2_s_hook_cache_mode(&self) -> u32 {
        match self.variant {
            MmuVariant::XScale => L2_C | l2_xscale_t_tex(TEX_XSCALE_X),
            _ => self.l2_s_cache_mode,
        }
    }

    /// Coarse L1 descriptor pointing at an L2 table
    #[inline]
    pub fn l1_c_entry(&self, l2_phys: PAddr, domain: u8) -> u32 {
        ((l2_phys as u32) & L1_C_ADDR_MASK) | l1_c_dom(domain) | self.l1_c_proto
    }

    /// Complete small page descriptor
    pub fn l2_s_entry(&self, pa: PAddr, kind: PteKind, prot: VmProt, mode: CacheMode) -> u32 {
        self.l2_s_proto_exec(prot.can_execute())
            | ((pa as u32) & (L2_S_FRAME as u32))
            | self.l2_s_prot(kind, prot.can_write())
            | self.cache_bits(mode, Granularity::SmallPage)
    }

    /// Check whether a small page entry carries any cache attributes
    #[inline]
    pub fn l2_s_cached(&self, pte: u32) -> bool {
        pte & self.l2_s_cache_mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic() -> PteTemplates {
        PteTemplates::new(MmuVariant::Generic, false, false)
    }

    #[test]
    fn test_generic_small_page_encoding() {
        let t = generic();
        let pte = t.l2_s_entry(0x2000, PteKind::Kernel, VmProt::RW, CacheMode::WriteBack);
        assert_eq!(pte, 0x2000 | L2_TYPE_S | 0x550 | L2_B | L2_C);

        let user_ro = t.l2_s_prot(PteKind::User, false);
        assert_eq!(user_ro, l2_ap(AP_KRWUR));
        assert!(t.l2_s_user(user_ro));
        assert!(!t.l2_s_writable(user_ro));
        assert_eq!(t.l2_s_prot(PteKind::User, true), l2_ap(AP_KRWURW));
    }

    #[test]
    fn test_generic_section_and_coarse_protos() {
        let t = generic();
        assert_eq!(t.l1_s_proto, 0x12);
        assert_eq!(t.l1_c_proto, 0x11);
        assert_eq!(
            t.protection_bits(PteKind::Kernel, true, Granularity::Section),
            AP_KRW << 10
        );
        assert_eq!(t.l1_c_entry(0x8000_0400, 3), 0x8000_0400 | (3 << 5) | 0x11);
    }

    #[test]
    fn test_generic_page_table_cache_mode() {
        assert_eq!(generic().l2_s_cache_mode_pt, L2_C);
        let wt = PteTemplates::new(MmuVariant::Generic, true, false);
        assert_eq!(wt.l2_s_cache_mode_pt, L2_B | L2_C);
    }

    #[test]
    fn test_xscale_encoding() {
        let t = PteTemplates::new(MmuVariant::XScale, false, true);
        assert_eq!(t.l2_s_proto, L2_TYPE_XSCALE_XS);
        assert_eq!(t.l2_s_prot(PteKind::User, true), 0x30);
        assert_eq!(t.l2_s_cache_mode, L2_B | L2_C | 0x40);
        assert_eq!(t.l2_l_cache_mode, L2_B | L2_C | 0x1000);
        assert_eq!(t.l2_s_cache_mode_pt, L2_C);
        assert_eq!(t.l2_s_hook_cache_mode(), L2_C | 0x40);
        // Large pages keep four AP fields even on XScale.
        assert_eq!(
            t.protection_bits(PteKind::Kernel, true, Granularity::LargePage),
            0x550
        );
    }

    #[test]
    fn test_v7_permissions() {
        let t = PteTemplates::new(MmuVariant::V7, false, true);
        let kro = t.l2_s_prot(PteKind::Kernel, false);
        assert_eq!(kro, 0x210);
        assert!(!t.l2_s_writable(kro));
        let krw = t.l2_s_set_writable(kro);
        assert_eq!(krw, 0x010);
        assert!(t.l2_s_writable(krw));
        assert_eq!(t.l2_s_clear_writable(krw), kro);
        assert!(t.l2_s_user(t.l2_s_prot(PteKind::User, false)));
        assert_eq!(
            t.protection_bits(PteKind::User, true, Granularity::Section),
            0b11 << 10
        );
        assert_eq!(
            t.protection_bits(PteKind::Kernel, false, Granularity::Section),
            (0b01 << 10) | (1 << 15)
        );
    }

    #[test]
    fn test_v7_memory_types() {
        let t = PteTemplates::new(MmuVariant::V7, false, true);
        assert_eq!(t.l2_s_cache_mode, 0x40 | L2_B | L2_C);
        assert_eq!(t.cache_bits(CacheMode::NonCacheable, Granularity::SmallPage), 0x40);
        assert_eq!(t.cache_bits(CacheMode::Device, Granularity::Section), L1_S_B);
        assert_eq!(t.l2_s_cache_mask, 0x1cc);
    }

    #[test]
    fn test_v7_execute_never_survives_reference_emulation() {
        let t = PteTemplates::new(MmuVariant::V7, false, false);
        let pte = t.l2_s_entry(0x5000, PteKind::User, VmProt::READ, CacheMode::WriteBack);
        assert_eq!(pte & L2_V7_S_XN, L2_V7_S_XN);
        assert!(l2pte_valid(pte));
        assert!(!l2pte_large_p(pte));

        let inv = (pte & !L2_TYPE_MASK) | L2_TYPE_INV;
        assert!(!l2pte_valid(inv));
        assert_eq!(t.l2_s_revalidate(inv, false), pte);
        assert_eq!(l2pte_pa(pte), 0x5000);
    }

    #[test]
    fn test_descriptor_predicates() {
        assert!(l1pte_section_p(0x8000_0000 | L1_TYPE_S));
        assert!(l1pte_page_p(0x8000_0400 | L1_TYPE_C));
        assert!(!l1pte_page_p(L1_TYPE_INV));
        assert!(l2pte_large_p(0x1_0000 | L2_TYPE_L));
        assert!(!l2pte_valid(0x2000));
    }

    #[test]
    fn test_domain_dacr() {
        assert_eq!(domain_dacr(0), (1 << 30) | 1);
        assert_eq!(domain_dacr(3), (1 << 30) | (1 << 6));
    }
}
