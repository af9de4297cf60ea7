// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the size-class object caches built over the slab
//! pool.

use crate::slab::{SlabList, SlabPool};
use core::ptr;
use core::str;
use memory::{phys_to_virt, GfpFlags, PageAllocator, PhysAddr, PAGE_SIZE};

/// The maximum length of a cache name, including the
/// terminating zero byte.
///
pub const CACHE_NAMELEN: usize = 16;

/// The number of size-class caches.
///
pub(crate) const CACHE_COUNT: usize = 9;

/// The size classes served by `kmalloc`, smallest first.
///
pub(crate) const SIZE_CLASSES: [(&str, usize); CACHE_COUNT] = [
    ("kmalloc-8", 8),
    ("kmalloc-16", 16),
    ("kmalloc-32", 32),
    ("kmalloc-64", 64),
    ("kmalloc-128", 128),
    ("kmalloc-256", 256),
    ("kmalloc-512", 512),
    ("kmalloc-1k", 1024),
    ("kmalloc-2k", 2048),
];

/// The largest allocation `kmalloc` can serve.
///
pub(crate) const LARGEST_SIZE_CLASS: usize = 2048;

/// Maps an allocation size to the index of the smallest size
/// class that can hold it, or `None` if no class is big
/// enough.
///
pub(crate) fn cache_index(size: usize) -> Option<usize> {
    let rounded = size.next_power_of_two().max(8);
    let index = (rounded.trailing_zeros() - 3) as usize;
    if index < CACHE_COUNT {
        Some(index)
    } else {
        None
    }
}

/// A pool of slabs serving objects of one size class.
///
/// A cache owns two slab lists: `list` holds the slabs with at
/// least one live object (plus, briefly, a freshly attached
/// empty slab), and `freelist` holds slabs that drained
/// completely and wait to be reused. Allocation always happens
/// at the most recent slab of `list`.
///
/// Because slabs start on a page boundary and object sizes are
/// powers of two, every object is naturally aligned to its size
/// class.
///
pub struct Cache {
    id: u8,
    list: SlabList,
    freelist: SlabList,
    objsize: u32,
    gfporder: u32,
    objnum: u32,
    flags: u8,
    name: [u8; CACHE_NAMELEN],
}

impl Cache {
    /// Returns a cache with no size class, used to fill the
    /// cache table before initialisation.
    ///
    pub(crate) const fn unset() -> Cache {
        Cache {
            id: 0,
            list: SlabList::new(),
            freelist: SlabList::new(),
            objsize: 0,
            gfporder: 0,
            objnum: 0,
            flags: 0,
            name: [0; CACHE_NAMELEN],
        }
    }

    /// Creates the cache for one size class.
    ///
    /// `size` is rounded up to a power of two; the name is
    /// truncated to [`CACHE_NAMELEN`]` - 1` bytes.
    ///
    pub(crate) fn create(id: u8, name: &str, size: usize, flags: u8) -> Cache {
        let objsize = size.next_power_of_two().max(8);
        let gfporder = objsize.trailing_zeros();
        let objnum = (PAGE_SIZE >> gfporder) as u32;

        let mut name_buf = [0u8; CACHE_NAMELEN];
        let len = name.len().min(CACHE_NAMELEN - 1);
        name_buf[..len].copy_from_slice(&name.as_bytes()[..len]);

        Cache {
            id,
            list: SlabList::new(),
            freelist: SlabList::new(),
            objsize: objsize as u32,
            gfporder,
            objnum,
            flags,
            name: name_buf,
        }
    }

    /// Returns the cache's name.
    ///
    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CACHE_NAMELEN);
        str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Returns the size of the objects the cache serves.
    ///
    pub fn objsize(&self) -> usize {
        self.objsize as usize
    }

    /// Returns the base-2 exponent of the object size.
    ///
    pub fn gfporder(&self) -> u32 {
        self.gfporder
    }

    /// Returns how many objects one slab holds.
    ///
    pub fn objnum(&self) -> u32 {
        self.objnum
    }

    /// Returns the cache flags. Currently always zero.
    ///
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Returns the number of slabs with live objects.
    ///
    pub fn slabs(&self) -> usize {
        self.list.len()
    }

    /// Returns the number of drained slabs waiting on the
    /// cache's free list.
    ///
    pub fn free_slabs(&self) -> usize {
        self.freelist.len()
    }

    /// Allocates one object from the cache.
    ///
    /// # Panics
    ///
    /// `alloc` panics if the cache needs another slab and the
    /// pool has none left.
    ///
    pub(crate) fn alloc(
        &mut self,
        pool: &mut SlabPool,
        pmm: &mut impl PageAllocator,
        _flags: GfpFlags,
    ) -> PhysAddr {
        if self.list.is_empty() {
            self.alloc_slab(pool, pmm);
        }

        let mut index = self.list.next_free().expect("cache has no slab after alloc_slab");
        if pool.get(index).inuse == self.objnum {
            self.alloc_slab(pool, pmm);
            index = self.list.next_free().expect("cache has no slab after alloc_slab");
        }

        let objsize = self.objsize as usize;
        let slab = pool.get_mut(index);
        let obj = match slab.take_free_slot() {
            // A previously freed slot is reused first.
            Some(slot) => slot,
            // Otherwise carve the next never-used slot.
            None => slab.bump_slot(objsize),
        };

        slab.inuse += 1;
        debug_assert!(slab.inuse <= self.objnum);
        obj
    }

    /// Attaches another slab to the cache's allocation list:
    /// a drained slab from the cache's own free list if one
    /// exists, otherwise the next unclaimed descriptor from
    /// the pool.
    ///
    /// The slab's page is stamped with the cache's identity,
    /// which is how `kfree` later routes objects back here.
    ///
    fn alloc_slab(&mut self, pool: &mut SlabPool, pmm: &mut impl PageAllocator) {
        if let Some(index) = self.freelist.pop_recent(pool) {
            self.list.push_recent(pool, index);
            let page = pool.get(index).s_mem;
            pmm.page_mut(page).set_owner(self.id);
            return;
        }

        if let Some(index) = pool.claim_next() {
            self.list.push_recent(pool, index);
            let page = pool.get(index).s_mem;
            pmm.page_mut(page).set_owner(self.id);
            return;
        }

        panic!("cache \"{}\": slab pool exhausted", self.name());
    }

    /// Frees one object previously returned by
    /// [`alloc`](Self::alloc).
    ///
    /// # Panics
    ///
    /// `free` panics if no slab of this cache contains the
    /// object.
    ///
    pub(crate) fn free(
        &mut self,
        pool: &mut SlabPool,
        pmm: &mut impl PageAllocator,
        obj: PhysAddr,
    ) {
        let page_addr = obj.frame_base();

        // Walk the list newest-first: frees tend to hit
        // recently allocated slabs.
        let mut cursor = self.list.next_free();
        while let Some(index) = cursor {
            if pool.get(index).s_mem == page_addr {
                self.free_slab(pool, pmm, index, obj);
                return;
            }

            cursor = pool.get(index).prev;
        }

        panic!(
            "cache \"{}\": cannot free object at {:#x}: no containing slab",
            self.name(),
            obj.as_usize()
        );
    }

    /// Returns `obj` to slab `index`. A slab whose last object
    /// goes away is scrubbed and moved to the cache's free
    /// list, unless it is the current allocation target.
    ///
    fn free_slab(
        &mut self,
        pool: &mut SlabPool,
        pmm: &mut impl PageAllocator,
        index: u16,
        obj: PhysAddr,
    ) {
        {
            let slab = pool.get_mut(index);
            debug_assert!(obj < slab.bump, "freed object was never allocated");
            debug_assert!(
                (obj - slab.s_mem) % self.objsize as usize == 0,
                "freed object is not aligned to its size class"
            );

            slab.push_free_slot(obj);
            if slab.inuse > 0 {
                slab.inuse -= 1;
            }
        }

        let drained = pool.get(index).inuse == 0;
        if drained && self.list.next_free() != Some(index) {
            let page = pool.get(index).s_mem;
            unsafe { ptr::write_bytes(phys_to_virt(page), 0, PAGE_SIZE) };
            pool.get_mut(index).reset();

            self.list.remove(pool, index);
            self.freelist.push_recent(pool, index);
            pmm.page_mut(page).clear_owner();
        }
    }
}
