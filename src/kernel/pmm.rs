// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Physical Memory Supply
//!
//! The pmap never discovers physical memory itself. Every page it needs for
//! L1 translation tables, L2 descriptor tables and kernel growth is obtained
//! through the [`PageAllocator`] trait, which the VM system implements.
//!
//! # Design
//!
//! [`FrameArena`] is the allocator used during bring-up and by the unit
//! tests. It tracks one contiguous range of physical pages with a bitmap
//! where each bit represents one page (0 = free, 1 = allocated). Single
//! pages are claimed lock-free with `fetch_or`; contiguous aligned runs are
//! searched under the arena lock and claimed bit by bit.
//!
//! # Usage
//!
//! ```rust,ignore
//! let arena = FrameArena::new(PhysRange::new(0x8000_0000, 0x8100_0000));
//!
//! // Four contiguous pages, 16KB aligned (an L1 table)
//! let l1 = arena.alloc_pages(4, 0x4000).ok_or(VmError::NoMemory)?;
//!
//! arena.free_pages(l1, 4);
//! ```

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::kernel::vm::layout::{PAddr, PhysRange, PAGE_SIZE};

/// Source of physical pages for page-table memory
pub trait PageAllocator: Send + Sync {
    /// Allocate `count` contiguous pages whose first page is aligned to
    /// `align` bytes (a power of two, at least `PAGE_SIZE`)
    ///
    /// Returns `None` when no suitable run is available.
    fn alloc_pages(&self, count: usize, align: usize) -> Option<PAddr>;

    /// Return `count` pages starting at `pa`
    fn free_pages(&self, pa: PAddr, count: usize);

    /// Allocate a single page
    fn alloc_page(&self) -> Option<PAddr> {
        self.alloc_pages(1, PAGE_SIZE)
    }

    /// Free a single page
    fn free_page(&self, pa: PAddr) {
        self.free_pages(pa, 1)
    }
}

/// Bitmap allocator over one physical range
pub struct FrameArena {
    /// Physical range managed by the arena
    range: PhysRange,

    /// Bitmap tracking allocated pages (0 = free, 1 = allocated)
    bitmap: Vec<AtomicU64>,

    /// Number of free pages
    free_count: AtomicUsize,

    /// Total number of pages
    total_count: usize,

    /// Serializes contiguous searches
    lock: spin::Mutex<()>,
}

impl FrameArena {
    /// Create an arena managing every whole page of `range`
    pub fn new(range: PhysRange) -> Self {
        let total_count = range.page_count();
        let words = (total_count + 63) / 64;
        let mut bitmap = Vec::with_capacity(words);
        for i in 0..words {
            // Bits past the end of the range stay permanently allocated.
            let valid = core::cmp::min(64, total_count - i * 64);
            let word = if valid == 64 { 0 } else { !0u64 << valid };
            bitmap.push(AtomicU64::new(word));
        }

        Self {
            range,
            bitmap,
            free_count: AtomicUsize::new(total_count),
            total_count,
            lock: spin::Mutex::new(()),
        }
    }

    /// Physical range managed by the arena
    pub fn range(&self) -> PhysRange {
        self.range
    }

    /// Get the number of free pages
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Get the total number of pages
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// Check whether the page at `pa` is currently allocated
    pub fn is_allocated(&self, pa: PAddr) -> bool {
        match self.index_of(pa) {
            Some(index) => self.bit(index),
            None => false,
        }
    }

    /// Mark a range as allocated so it is never handed out
    ///
    /// Used for memory already in use when the arena is created (kernel
    /// image, boot page tables).
    pub fn reserve(&self, pa: PAddr, count: usize) {
        let _guard = self.lock.lock();
        for i in 0..count {
            if let Some(index) = self.index_of(pa + i * PAGE_SIZE) {
                if self.claim(index) {
                    self.free_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn index_of(&self, pa: PAddr) -> Option<usize> {
        if !self.range.contains(pa) || pa % PAGE_SIZE != 0 {
            return None;
        }
        let index = (pa - self.range.start) / PAGE_SIZE;
        (index < self.total_count).then_some(index)
    }

    fn bit(&self, index: usize) -> bool {
        self.bitmap[index / 64].load(Ordering::Acquire) & (1u64 << (index % 64)) != 0
    }

    /// Set the bit for `index`; returns false if it was already set
    fn claim(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        let old = self.bitmap[index / 64].fetch_or(mask, Ordering::Acquire);
        old & mask == 0
    }

    fn release(&self, index: usize) {
        let mask = 1u64 << (index % 64);
        self.bitmap[index / 64].fetch_and(!mask, Ordering::Release);
    }

    fn alloc_one(&self) -> Option<PAddr> {
        for (i, word) in self.bitmap.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            while current != !0u64 {
                let bit = (!current).trailing_zeros() as usize;
                let mask = 1u64 << bit;
                let old = word.fetch_or(mask, Ordering::Acquire);
                if old & mask == 0 {
                    self.free_count.fetch_sub(1, Ordering::Relaxed);
                    return Some(self.range.start + (i * 64 + bit) * PAGE_SIZE);
                }
                current = old | mask;
            }
        }
        None
    }

    fn alloc_run(&self, count: usize, align: usize) -> Option<PAddr> {
        let _guard = self.lock.lock();
        let align_pages = core::cmp::max(align / PAGE_SIZE, 1);

        // First index whose address honours the alignment.
        let first_aligned = (self.range.start.next_multiple_of(align) - self.range.start) / PAGE_SIZE;
        let mut index = first_aligned;
        while index + count <= self.total_count {
            match (index..index + count).find(|&i| self.bit(i)) {
                Some(busy) => {
                    // Skip past the allocated page to the next aligned slot.
                    let next = busy + 1;
                    index = first_aligned + (next - first_aligned).next_multiple_of(align_pages);
                }
                None => {
                    for claimed in index..index + count {
                        if !self.claim(claimed) {
                            // Raced with a single-page allocation; undo.
                            for undo in index..claimed {
                                self.release(undo);
                            }
                            return None;
                        }
                    }
                    self.free_count.fetch_sub(count, Ordering::Relaxed);
                    return Some(self.range.start + index * PAGE_SIZE);
                }
            }
        }
        None
    }
}

impl PageAllocator for FrameArena {
    fn alloc_pages(&self, count: usize, align: usize) -> Option<PAddr> {
        if count == 0 {
            return None;
        }
        if count == 1 && align <= PAGE_SIZE {
            return self.alloc_one();
        }
        self.alloc_run(count, align)
    }

    fn free_pages(&self, pa: PAddr, count: usize) {
        for i in 0..count {
            let page = pa + i * PAGE_SIZE;
            match self.index_of(page) {
                Some(index) if self.bit(index) => {
                    self.release(index);
                    self.free_count.fetch_add(1, Ordering::Relaxed);
                }
                _ => panic!("free_pages: {:#x} not allocated from this arena", page),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(pages: usize) -> FrameArena {
        FrameArena::new(PhysRange::new(0x8000_0000, 0x8000_0000 + pages * PAGE_SIZE))
    }

    #[test]
    fn test_single_page_alloc_and_free() {
        let a = arena(8);
        assert_eq!(a.total_count(), 8);

        let p = a.alloc_page().unwrap();
        assert_eq!(p, 0x8000_0000);
        assert!(a.is_allocated(p));
        assert_eq!(a.free_count(), 7);

        a.free_page(p);
        assert!(!a.is_allocated(p));
        assert_eq!(a.free_count(), 8);
    }

    #[test]
    fn test_exhaustion() {
        let a = arena(3);
        assert!(a.alloc_page().is_some());
        assert!(a.alloc_page().is_some());
        assert!(a.alloc_page().is_some());
        assert!(a.alloc_page().is_none());
    }

    #[test]
    fn test_aligned_run() {
        let a = arena(16);
        let first = a.alloc_page().unwrap();
        assert_eq!(first, 0x8000_0000);

        let run = a.alloc_pages(4, 0x4000).unwrap();
        assert_eq!(run % 0x4000, 0);
        assert_eq!(run, 0x8000_4000);
        for i in 0..4 {
            assert!(a.is_allocated(run + i * PAGE_SIZE));
        }
        assert_eq!(a.free_count(), 11);

        a.free_pages(run, 4);
        assert_eq!(a.free_count(), 15);
    }

    #[test]
    fn test_run_too_large() {
        let a = arena(4);
        assert!(a.alloc_pages(8, PAGE_SIZE).is_none());
        assert!(a.alloc_pages(0, PAGE_SIZE).is_none());
    }

    #[test]
    fn test_reserve() {
        let a = arena(4);
        a.reserve(0x8000_0000, 2);
        assert_eq!(a.free_count(), 2);
        assert_eq!(a.alloc_page(), Some(0x8000_2000));
    }

    #[test]
    fn test_partial_last_word() {
        let a = arena(70);
        let mut n = 0;
        while a.alloc_page().is_some() {
            n += 1;
        }
        assert_eq!(n, 70);
    }

    #[test]
    #[should_panic]
    fn test_double_free_panics() {
        let a = arena(2);
        let p = a.alloc_page().unwrap();
        a.free_page(p);
        a.free_page(p);
    }
}
