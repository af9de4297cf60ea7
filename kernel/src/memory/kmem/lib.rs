// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The slab object allocator and the `kmalloc` façade built on
//! top of it.
//!
//! ## Structure
//!
//! At initialisation, one page is borrowed from the physical
//! memory manager and carved into a fixed pool of slab
//! descriptors; each descriptor is then given one zeroed page
//! of object storage. That is the only time this crate asks the
//! frame allocator for memory: afterwards, slabs circulate
//! between the caches and their free lists.
//!
//! Nine caches serve the power-of-two size classes from 8 bytes
//! to 2 KiB. [`kmalloc`] rounds a request up to the next class
//! and allocates from the matching cache; [`kfree`] finds the
//! owning cache through the frame's [`Page`](memory::Page)
//! descriptor, which is stamped whenever a cache claims a
//! slab's page.
//!
//! Within a slab, never-used slots are carved off by a bump
//! pointer and freed slots are threaded onto an intrusive free
//! list, which is always reused first. Objects are naturally
//! aligned to their size class.
//!
//! # Examples
//!
//! ```
//! # fn doc() {
//! use memory::GfpFlags;
//!
//! kmem::init();
//!
//! let obj = kmem::kmalloc(100, GfpFlags::KERNEL).unwrap();
//! // ... use the 128-byte allocation ...
//! kmem::kfree(obj);
//! # }
//! ```

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

mod cache;
mod slab;

pub use crate::cache::{Cache, CACHE_NAMELEN};

use crate::cache::{cache_index, CACHE_COUNT, LARGEST_SIZE_CLASS, SIZE_CLASSES};
use crate::slab::{Slab, SlabPool};
use core::mem::size_of;
use core::ptr::NonNull;
use lazy_static::lazy_static;
use log::{error, info};
use memory::{phys_to_virt, virt_to_phys, GfpFlags, PageAllocator, PhysAddr, PAGE_SHIFT};
use spin::Mutex;

/// The base-2 exponent of the descriptor pool's size in pages.
///
const SLAB_POOL_ORDER: u32 = 0;

/// The slab allocator: the descriptor pool plus one cache per
/// size class.
///
pub struct SlabAllocator {
    caches: [Cache; CACHE_COUNT],
    pool: SlabPool,
}

impl SlabAllocator {
    /// Returns an allocator with no slabs, which can satisfy
    /// no allocation until [`init`](Self::init) is called.
    ///
    pub const fn empty() -> Self {
        const UNSET: Cache = Cache::unset();
        SlabAllocator {
            caches: [UNSET; CACHE_COUNT],
            pool: SlabPool::empty(),
        }
    }

    /// Builds the slab pool and the size-class caches.
    ///
    /// One page becomes the descriptor pool; every descriptor
    /// receives one zeroed page of object storage up front.
    ///
    /// # Panics
    ///
    /// `init` panics if the frame allocator cannot supply the
    /// pool page or any object page. Failing to assemble the
    /// slab layer this early leaves the kernel unable to
    /// allocate at all, which is not a recoverable state.
    ///
    pub fn init(&mut self, pmm: &mut impl PageAllocator) {
        let pool_addr = match pmm.alloc_pages(GfpFlags::KERNEL, SLAB_POOL_ORDER) {
            Some(page) => page.addr(),
            None => panic!("out of memory while allocating the slab descriptor pool"),
        };

        let count = ((1usize << SLAB_POOL_ORDER) << PAGE_SHIFT) / size_of::<Slab>();
        let base = phys_to_virt(pool_addr) as *mut Slab;
        for i in 0..count {
            let page = match pmm.get_zeroed_page(GfpFlags::KERNEL | GfpFlags::ZERO) {
                Some(page) => page.addr(),
                None => panic!("out of memory while allocating slab object pages"),
            };

            unsafe { base.add(i).write(Slab::new_in_pool(page)) };
        }

        self.pool = unsafe { SlabPool::from_raw(base, count) };

        for (index, &(name, size)) in SIZE_CLASSES.iter().enumerate() {
            self.caches[index] = Cache::create(index as u8, name, size, 0);
        }

        info!(
            "slab allocator: {} slabs over {} size classes",
            count,
            SIZE_CLASSES.len()
        );
    }

    /// Allocates `size` bytes from the matching size-class
    /// cache, or returns `None`.
    ///
    /// Requests above the largest size class and requests
    /// without [`GfpFlags::KERNEL`] are refused.
    ///
    pub fn allocate(
        &mut self,
        pmm: &mut impl PageAllocator,
        size: usize,
        flags: GfpFlags,
    ) -> Option<PhysAddr> {
        if size > LARGEST_SIZE_CLASS {
            error!(
                "kmalloc: allocation of {} bytes exceeds the largest size class",
                size
            );
            return None;
        }

        if !flags.contains(GfpFlags::KERNEL) {
            return None;
        }

        let index = cache_index(size)?;
        let SlabAllocator { caches, pool } = self;
        Some(caches[index].alloc(pool, pmm, flags))
    }

    /// Returns an object to the cache it was allocated from.
    ///
    /// # Panics
    ///
    /// `free` panics if the object's frame is not owned by any
    /// cache, or if the owning cache has no slab containing
    /// the object.
    ///
    pub fn free(&mut self, pmm: &mut impl PageAllocator, obj: PhysAddr) {
        let owner = match pmm.page(obj.frame_base()).owner() {
            Some(owner) => owner as usize,
            None => panic!(
                "kfree: object at {:#x} does not belong to any cache",
                obj.as_usize()
            ),
        };

        debug_assert!(owner < CACHE_COUNT);
        let SlabAllocator { caches, pool } = self;
        caches[owner].free(pool, pmm, obj);
    }

    /// Returns the cache serving size class `index`.
    ///
    pub fn cache(&self, index: usize) -> &Cache {
        &self.caches[index]
    }

    /// Returns the number of descriptors in the slab pool.
    ///
    pub fn pool_slabs(&self) -> usize {
        self.pool.len()
    }

    /// Logs each cache's object size and slab counts.
    ///
    pub fn debug(&self) {
        for cache in self.caches.iter() {
            info!(
                "{}: {} byte objects, {} per slab, {} slabs in use, {} free",
                cache.name(),
                cache.objsize(),
                cache.objnum(),
                cache.slabs(),
                cache.free_slabs()
            );
        }
    }
}

lazy_static! {
    /// The slab allocator behind [`kmalloc`] and [`kfree`].
    ///
    /// `ALLOCATOR` starts out empty; [`init`] gives it its
    /// slab pool once the physical memory manager is ready.
    ///
    pub static ref ALLOCATOR: Mutex<SlabAllocator> = Mutex::new(SlabAllocator::empty());
}

/// Builds the slab allocator over the global physical memory
/// manager.
///
/// The physical memory manager must already be initialised.
///
/// # Panics
///
/// `init` panics if the frame allocator cannot supply the
/// slab pool's pages.
///
pub fn init() {
    let mut pmm = physmem::ALLOCATOR.lock();
    ALLOCATOR.lock().init(&mut *pmm);
}

/// Allocates `size` bytes for kernel use.
///
/// The allocation is served by the smallest size class that
/// holds `size` bytes, so the object is aligned to at least its
/// own (rounded) size. Returns `None` if `size` exceeds the
/// largest size class or `flags` lacks [`GfpFlags::KERNEL`].
///
pub fn kmalloc(size: usize, flags: GfpFlags) -> Option<NonNull<u8>> {
    let mut pmm = physmem::ALLOCATOR.lock();
    let addr = ALLOCATOR.lock().allocate(&mut *pmm, size, flags)?;
    NonNull::new(phys_to_virt(addr))
}

/// Frees an object previously returned by [`kmalloc`].
///
/// # Panics
///
/// `kfree` panics if `obj` was not returned by [`kmalloc`] or
/// has already drained back to the frame allocator.
///
pub fn kfree(obj: NonNull<u8>) {
    let mut pmm = physmem::ALLOCATOR.lock();
    ALLOCATOR.lock().free(&mut *pmm, virt_to_phys(obj.as_ptr()));
}

/// Prints debug information about the slab caches.
///
pub fn debug() {
    ALLOCATOR.lock().debug();
}


#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::testutil::PhysArena;
    use core::ptr;
    use memory::PAGE_SIZE;
    use multiboot::{MemoryRegion, RegionType};
    use physmem::{KernelRegion, PhysMemoryManager};

    fn boot_pmm() -> (PhysArena, PhysMemoryManager) {
        let arena = PhysArena::new(0x80_0000);
        let regions = [MemoryRegion {
            addr: 0x10_0000,
            len: 0x70_0000,
            kind: RegionType::Available,
        }];
        let kernel = KernelRegion::new(PhysAddr::new(0x10_0000), PhysAddr::new(0x11_0000));
        let pmm = unsafe { PhysMemoryManager::new(regions.iter().copied(), kernel) };
        (arena, pmm)
    }

    fn boot() -> (PhysArena, PhysMemoryManager, SlabAllocator) {
        let (arena, mut pmm) = boot_pmm();
        let mut slab = SlabAllocator::empty();
        slab.init(&mut pmm);
        (arena, pmm, slab)
    }

    #[test]
    fn test_init() {
        let (_arena, mut pmm) = boot_pmm();
        let used_before = pmm.used_pages();

        let mut slab = SlabAllocator::empty();
        slab.init(&mut pmm);

        // One page of descriptors, one object page per
        // descriptor.
        assert_eq!(slab.pool_slabs(), PAGE_SIZE / size_of::<Slab>());
        assert_eq!(pmm.used_pages(), used_before + slab.pool_slabs() + 1);

        assert_eq!(slab.cache(0).name(), "kmalloc-8");
        assert_eq!(slab.cache(0).objsize(), 8);
        assert_eq!(slab.cache(0).objnum(), 512);
        assert_eq!(slab.cache(7).name(), "kmalloc-1k");
        assert_eq!(slab.cache(8).name(), "kmalloc-2k");
        assert_eq!(slab.cache(8).objnum(), 2);
    }

    #[test]
    fn test_adjacent_small_objects() {
        let (_arena, mut pmm, mut slab) = boot();

        // A 1-byte and an 8-byte request land in the same
        // 8-byte cache, back to back in the same slab.
        let first = slab.allocate(&mut pmm, 1, GfpFlags::KERNEL).unwrap();
        let second = slab.allocate(&mut pmm, 8, GfpFlags::KERNEL).unwrap();
        assert_eq!(second - first, 8);
        assert_eq!(pmm.page(first.frame_base()).owner(), Some(0));
        assert_eq!(first.frame_base(), second.frame_base());
    }

    #[test]
    fn test_rejected_requests() {
        let (_arena, mut pmm, mut slab) = boot();

        // Above the largest size class.
        assert!(slab.allocate(&mut pmm, 2049, GfpFlags::KERNEL).is_none());
        assert!(slab.allocate(&mut pmm, 1 << 20, GfpFlags::KERNEL).is_none());

        // Without the KERNEL flag.
        assert!(slab.allocate(&mut pmm, 64, GfpFlags::empty()).is_none());
        assert!(slab.allocate(&mut pmm, 64, GfpFlags::ZERO).is_none());
    }

    #[test]
    fn test_size_class_routing() {
        let (_arena, mut pmm, mut slab) = boot();

        for &(size, index) in &[
            (1usize, 0u8),
            (8, 0),
            (9, 1),
            (16, 1),
            (17, 2),
            (100, 4),
            (1000, 7),
            (2048, 8),
        ] {
            let obj = slab.allocate(&mut pmm, size, GfpFlags::KERNEL).unwrap();

            // The object's frame is stamped with the serving
            // cache, and the object is naturally aligned to
            // the class size.
            assert_eq!(pmm.page(obj.frame_base()).owner(), Some(index));
            let objsize = slab.cache(index as usize).objsize();
            assert_eq!(obj.as_usize() % objsize, 0);
        }
    }

    #[test]
    fn test_bump_allocation_is_monotonic() {
        let (_arena, mut pmm, mut slab) = boot();

        let mut last = slab.allocate(&mut pmm, 16, GfpFlags::KERNEL).unwrap();
        for _ in 0..4 {
            let next = slab.allocate(&mut pmm, 16, GfpFlags::KERNEL).unwrap();
            assert_eq!(next - last, 16);
            last = next;
        }
    }

    #[test]
    fn test_freed_slots_are_reused_lifo() {
        let (_arena, mut pmm, mut slab) = boot();

        let a = slab.allocate(&mut pmm, 32, GfpFlags::KERNEL).unwrap();
        let b = slab.allocate(&mut pmm, 32, GfpFlags::KERNEL).unwrap();
        let c = slab.allocate(&mut pmm, 32, GfpFlags::KERNEL).unwrap();

        slab.free(&mut pmm, a);
        slab.free(&mut pmm, c);

        // The most recently freed slot comes back first; the
        // bump pointer is untouched by the frees.
        assert_eq!(slab.allocate(&mut pmm, 32, GfpFlags::KERNEL).unwrap(), c);
        assert_eq!(slab.allocate(&mut pmm, 32, GfpFlags::KERNEL).unwrap(), a);
        assert_eq!(
            slab.allocate(&mut pmm, 32, GfpFlags::KERNEL).unwrap(),
            b + 32
        );
    }

    #[test]
    fn test_full_slab_rollover() {
        let (_arena, mut pmm, mut slab) = boot();

        // 512 8-byte objects fill one slab exactly.
        let first = slab.allocate(&mut pmm, 8, GfpFlags::KERNEL).unwrap();
        for i in 1..512 {
            let obj = slab.allocate(&mut pmm, 8, GfpFlags::KERNEL).unwrap();
            assert_eq!(obj, first + 8 * i);
        }
        assert_eq!(slab.cache(0).slabs(), 1);

        // The 513th spills into a fresh slab on a different
        // frame.
        let spill = slab.allocate(&mut pmm, 8, GfpFlags::KERNEL).unwrap();
        assert_ne!(spill.frame_base(), first.frame_base());
        assert_eq!(slab.cache(0).slabs(), 2);
    }

    #[test]
    fn test_drained_slab_returns_to_freelist() {
        let (_arena, mut pmm, mut slab) = boot();

        // Fill the first 2 KiB slab (two objects), then spill
        // onto a second.
        let o1 = slab.allocate(&mut pmm, 2048, GfpFlags::KERNEL).unwrap();
        let o2 = slab.allocate(&mut pmm, 2048, GfpFlags::KERNEL).unwrap();
        let o3 = slab.allocate(&mut pmm, 2048, GfpFlags::KERNEL).unwrap();

        let slab1_page = o1.frame_base();
        assert_eq!(o2.frame_base(), slab1_page);
        assert_ne!(o3.frame_base(), slab1_page);
        assert_eq!(slab.cache(8).slabs(), 2);

        // Dirty the first slab so the scrub is observable.
        unsafe { ptr::write_bytes(phys_to_virt(o1), 0xa5, 2048) };

        // Draining the first slab moves it to the cache's free
        // list, scrubbed and disowned.
        slab.free(&mut pmm, o1);
        slab.free(&mut pmm, o2);
        assert_eq!(slab.cache(8).slabs(), 1);
        assert_eq!(slab.cache(8).free_slabs(), 1);
        assert_eq!(pmm.page(slab1_page).owner(), None);

        let base = phys_to_virt(slab1_page);
        for i in 0..PAGE_SIZE {
            assert_eq!(unsafe { *base.add(i) }, 0);
        }

        // Fill the second slab, then watch the drained slab
        // get reclaimed from the free list, bump reset to the
        // page base and ownership restored.
        let o4 = slab.allocate(&mut pmm, 2048, GfpFlags::KERNEL).unwrap();
        assert_eq!(o4.frame_base(), o3.frame_base());

        let o5 = slab.allocate(&mut pmm, 2048, GfpFlags::KERNEL).unwrap();
        assert_eq!(o5, slab1_page);
        assert_eq!(pmm.page(slab1_page).owner(), Some(8));
        assert_eq!(slab.cache(8).slabs(), 2);
        assert_eq!(slab.cache(8).free_slabs(), 0);
    }

    #[test]
    fn test_allocation_target_slab_is_kept() {
        let (_arena, mut pmm, mut slab) = boot();

        // Draining the slab currently targeted for allocation
        // does not demote it to the free list.
        let o1 = slab.allocate(&mut pmm, 2048, GfpFlags::KERNEL).unwrap();
        slab.free(&mut pmm, o1);
        assert_eq!(slab.cache(8).slabs(), 1);
        assert_eq!(slab.cache(8).free_slabs(), 0);

        // Its slot is immediately reusable.
        let o2 = slab.allocate(&mut pmm, 2048, GfpFlags::KERNEL).unwrap();
        assert_eq!(o2, o1);
    }

    #[test]
    fn test_caches_do_not_interfere() {
        let (_arena, mut pmm, mut slab) = boot();

        let small = slab.allocate(&mut pmm, 8, GfpFlags::KERNEL).unwrap();
        let big = slab.allocate(&mut pmm, 2048, GfpFlags::KERNEL).unwrap();
        assert_ne!(small.frame_base(), big.frame_base());

        slab.free(&mut pmm, small);
        assert_eq!(
            slab.allocate(&mut pmm, 8, GfpFlags::KERNEL).unwrap(),
            small
        );
        assert_eq!(slab.cache(8).slabs(), 1);
        assert_eq!(pmm.page(big.frame_base()).owner(), Some(8));
    }

    #[test]
    #[should_panic(expected = "does not belong to any cache")]
    fn test_free_of_unowned_object_panics() {
        let (_arena, mut pmm, mut slab) = boot();

        // A frame straight from the PMM was never claimed by
        // any cache.
        let stray = pmm.alloc_pages(GfpFlags::KERNEL, 0).unwrap().addr();
        slab.free(&mut pmm, stray);
    }
}
