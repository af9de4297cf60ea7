// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the bitmap frame allocator built over the BIOS
//! memory map.

use crate::bitmap::FrameBitmap;
use core::mem;
use core::ptr;
use log::{debug, info};
use memory::{GfpFlags, Page, PageAllocator, PhysAddr, PAGE_SHIFT, PAGE_SIZE};
use multiboot::MemoryRegion;
use pretty::Bytes;

/// The gap left between the kernel image and the allocator
/// metadata, so the boot stack cannot be overwritten by the
/// bitmap.
///
pub const BOOT_STACK_GUARD: usize = 64 * 1024;

/// Describes where the kernel image sits in physical memory.
///
/// `start` is the first byte of the image and `end` the first
/// byte after it, as the linker script reports them. An
/// optional guard extends the reserved range past `end` to
/// cover the boot stack.
///
#[derive(Clone, Copy, Debug)]
pub struct KernelRegion {
    start: PhysAddr,
    end: PhysAddr,
    stack_guard: usize,
}

impl KernelRegion {
    /// Describes a kernel image spanning `[start, end)`.
    ///
    pub const fn new(start: PhysAddr, end: PhysAddr) -> Self {
        KernelRegion {
            start,
            end,
            stack_guard: 0,
        }
    }

    /// Extends the reserved range by `bytes` past the image,
    /// covering the boot stack.
    ///
    #[must_use]
    pub const fn with_stack_guard(mut self, bytes: usize) -> Self {
        self.stack_guard = bytes;
        self
    }

    /// Returns the first byte of the image.
    ///
    pub const fn start(&self) -> PhysAddr {
        self.start
    }

    /// Returns the first byte after the image.
    ///
    pub const fn end(&self) -> PhysAddr {
        self.end
    }

    /// Returns the first byte after the image and its stack
    /// guard. Allocator metadata is placed here.
    ///
    pub const fn reserved_end(&self) -> PhysAddr {
        PhysAddr::new(self.end.as_usize() + self.stack_guard)
    }
}

/// The physical memory manager.
///
/// One bit per frame records whether the frame is available,
/// and a parallel array of [`Page`] descriptors gives each
/// frame an identity the rest of the kernel can refer to.
/// Both live inside the memory they describe, immediately
/// after the kernel image.
///
/// Frame zero is reserved at initialisation, which lets the
/// zero address double as the "no memory" sentinel.
///
pub struct PhysMemoryManager {
    bitmap: FrameBitmap,
    mem_map: *mut Page,
    mem_map_len: usize,
    mem_total: usize,
    mem_available: usize,
    max_pages: usize,
    used_pages: usize,
}

// The manager is the sole owner of its bitmap and descriptor
// array.
unsafe impl Send for PhysMemoryManager {}

impl PhysMemoryManager {
    /// Returns a manager that tracks no memory and can satisfy
    /// no allocation.
    ///
    pub const fn empty() -> Self {
        PhysMemoryManager {
            bitmap: FrameBitmap::empty(),
            mem_map: ptr::null_mut(),
            mem_map_len: 0,
            mem_total: 0,
            mem_available: 0,
            max_pages: 0,
            used_pages: 0,
        }
    }

    /// Builds the frame allocator from the BIOS memory map.
    ///
    /// The bitmap is placed immediately after the kernel image
    /// (and its stack guard, if any), the descriptor array
    /// immediately after the bitmap, and both are marked used
    /// along with the image itself. Only frames inside
    /// `Available` regions are made allocatable.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the memory map is valid
    /// and complete, that every `Available` frame outside the
    /// kernel image is unused, and that physical memory is
    /// reachable through [`memory::phys_to_virt`].
    ///
    pub unsafe fn new<I>(regions: I, kernel: KernelRegion) -> Self
    where
        I: Iterator<Item = MemoryRegion> + Clone,
    {
        let mut mem_total = 0;
        let mut mem_available = 0;
        for region in regions.clone() {
            debug!(
                "memory region at {:#010x}: {} ({})",
                region.addr,
                Bytes::from_usize(region.len as usize),
                region.kind
            );

            mem_total += region.len as usize;
            if region.is_usable() {
                mem_available += region.len as usize;
            }
        }

        let max_pages = mem_total / PAGE_SIZE;

        // Lay out our own metadata: the bitmap right after the
        // kernel image, the descriptor array right after the
        // bitmap.
        let bitmap_addr = kernel.reserved_end().align_up(mem::align_of::<u32>());
        let bitmap_bytes = FrameBitmap::byte_size(max_pages);
        let mem_map_addr = (bitmap_addr + bitmap_bytes).align_up(mem::align_of::<Page>());
        let mem_map_bytes = max_pages * mem::size_of::<Page>();
        let metadata_end = mem_map_addr + mem_map_bytes;

        // Every frame starts out unavailable.
        let mut bitmap =
            FrameBitmap::from_raw(memory::phys_to_virt(bitmap_addr) as *mut u32, max_pages);
        bitmap.set_all();

        let mem_map = memory::phys_to_virt(mem_map_addr) as *mut Page;
        for pfn in 0..max_pages {
            mem_map.add(pfn).write(Page::new(pfn));
        }

        let mut manager = PhysMemoryManager {
            bitmap,
            mem_map,
            mem_map_len: max_pages,
            mem_total,
            mem_available,
            max_pages,
            used_pages: max_pages,
        };

        // Free the frames the BIOS reports as available, then
        // take back the kernel image and our own footprint.
        for region in regions {
            if region.is_usable() {
                manager.mark_region_free(region.addr, region.len);
            }
        }

        manager.mark_region_used(kernel.start(), kernel.reserved_end() - kernel.start());
        manager.mark_region_used(bitmap_addr, metadata_end - bitmap_addr);

        // Reserve frame zero so the zero address can serve as
        // the "no memory" sentinel.
        if manager.max_pages > 0 {
            if !manager.bitmap.get(0) {
                manager.bitmap.set(0);
                manager.used_pages += 1;
            }

            manager.page_at_mut(0).mark_reserved();
        }

        info!(
            "physical memory: {} total, {} available, {} frames",
            Bytes::from_usize(mem_total),
            Bytes::from_usize(mem_available),
            max_pages
        );
        debug!(
            "kernel image at {:p}-{:p}, allocator metadata at {:p}-{:p}",
            kernel.start(),
            kernel.end(),
            bitmap_addr,
            metadata_end
        );

        manager
    }

    /// Marks every whole frame inside `[addr, addr+len)` as
    /// available.
    ///
    /// Partial frames at either edge are left unavailable, and
    /// frames beyond the representable range are ignored.
    ///
    fn mark_region_free(&mut self, addr: u64, len: u64) {
        let first = ((addr + PAGE_SIZE as u64 - 1) >> PAGE_SHIFT) as usize;
        let last = (((addr + len) >> PAGE_SHIFT) as usize).min(self.max_pages);

        for pfn in first..last {
            if self.bitmap.get(pfn) {
                self.bitmap.unset(pfn);
                self.used_pages -= 1;
            }
        }
    }

    /// Marks every frame touching `[addr, addr+len)` as
    /// unavailable.
    ///
    fn mark_region_used(&mut self, addr: PhysAddr, len: usize) {
        let first = addr.frame_number();
        let last = ((addr.as_usize() + len + PAGE_SIZE - 1) >> PAGE_SHIFT).min(self.max_pages);

        for pfn in first..last {
            if !self.bitmap.get(pfn) {
                self.bitmap.set(pfn);
                self.used_pages += 1;
            }
        }
    }

    #[inline]
    fn page_at(&self, pfn: usize) -> &Page {
        debug_assert!(pfn < self.mem_map_len, "frame {} is not tracked", pfn);
        unsafe { &*self.mem_map.add(pfn) }
    }

    #[inline]
    fn page_at_mut(&mut self, pfn: usize) -> &mut Page {
        debug_assert!(pfn < self.mem_map_len, "frame {} is not tracked", pfn);
        unsafe { &mut *self.mem_map.add(pfn) }
    }

    /// Allocates `1 << order` physically contiguous frames,
    /// returning the descriptor of the first.
    ///
    /// The search is first-fit in address order. Returns `None`
    /// if `mask` lacks [`GfpFlags::KERNEL`] or no suitable run
    /// of frames exists. With [`GfpFlags::ZERO`], the frames
    /// are zero-filled before they are returned.
    ///
    pub fn alloc_pages(&mut self, mask: GfpFlags, order: u32) -> Option<&mut Page> {
        if !mask.contains(GfpFlags::KERNEL) {
            return None;
        }

        let count = 1usize << order;

        // Strictly more free frames than requested must be
        // left; an allocation that would drain the last frame
        // is refused.
        if self.max_pages - self.used_pages <= count {
            return None;
        }

        let start = self.bitmap.find_free_run(count)?;
        for pfn in start..start + count {
            self.bitmap.set(pfn);
        }
        self.used_pages += count;

        if mask.contains(GfpFlags::ZERO) {
            let base = memory::phys_to_virt(PhysAddr::from_frame_number(start));
            unsafe { ptr::write_bytes(base, 0, count << PAGE_SHIFT) };
        }

        Some(self.page_at_mut(start))
    }

    /// Allocates a single zero-filled frame.
    ///
    /// `mask` must include [`GfpFlags::ZERO`]; otherwise the
    /// request is refused.
    ///
    pub fn get_zeroed_page(&mut self, mask: GfpFlags) -> Option<&mut Page> {
        if !mask.contains(GfpFlags::ZERO) {
            return None;
        }

        self.alloc_pages(mask, 0)
    }

    /// Returns `1 << order` frames starting at `addr` to the
    /// allocator.
    ///
    /// The frames are not validated against previous
    /// allocations and adjacent free runs are not coalesced.
    ///
    /// # Panics
    ///
    /// `free_pages` will panic if asked to free the frame at
    /// address zero, which is permanently reserved.
    ///
    /// # Safety
    ///
    /// The caller must own the frames being freed and must not
    /// touch them afterwards.
    ///
    pub unsafe fn free_pages(&mut self, addr: PhysAddr, order: u32) {
        if self.mem_map.is_null() {
            panic!("physical memory manager is not initialised");
        }

        let pfn = addr.frame_number();
        if pfn == 0 {
            panic!("cannot free the first physical frame");
        }

        for i in pfn..pfn + (1usize << order) {
            if i < self.max_pages && self.bitmap.get(i) {
                self.bitmap.unset(i);
                self.used_pages -= 1;
            }
        }
    }

    /// Returns the descriptor of the frame containing `addr`.
    ///
    /// The address is not range-checked in release builds;
    /// callers must pass addresses that originated from
    /// [`alloc_pages`](Self::alloc_pages).
    ///
    #[inline]
    pub fn page(&self, addr: PhysAddr) -> &Page {
        self.page_at(addr.frame_number())
    }

    /// Returns the mutable descriptor of the frame containing
    /// `addr`.
    ///
    /// The address is not range-checked in release builds;
    /// callers must pass addresses that originated from
    /// [`alloc_pages`](Self::alloc_pages).
    ///
    #[inline]
    pub fn page_mut(&mut self, addr: PhysAddr) -> &mut Page {
        self.page_at_mut(addr.frame_number())
    }

    /// Returns the total number of bytes covered by the memory
    /// map.
    ///
    pub fn mem_total(&self) -> usize {
        self.mem_total
    }

    /// Returns the number of bytes in `Available` regions.
    ///
    pub fn mem_available(&self) -> usize {
        self.mem_available
    }

    /// Returns the number of representable frames.
    ///
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Returns the number of frames currently unavailable.
    ///
    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    /// Returns the number of frames currently available.
    ///
    pub fn free_frames(&self) -> usize {
        self.max_pages - self.used_pages
    }

    /// Returns whether frame `pfn` is currently unavailable.
    ///
    pub fn frame_in_use(&self, pfn: usize) -> bool {
        self.bitmap.get(pfn)
    }

    /// Logs the allocator's counters.
    ///
    pub fn debug(&self) {
        info!(
            "physical memory manager: {}/{} frames available",
            self.free_frames(),
            self.max_pages
        );
        info!(
            "{} used, {} free, {} total",
            Bytes::from_usize(self.used_pages * PAGE_SIZE),
            Bytes::from_usize(self.free_frames() * PAGE_SIZE),
            Bytes::from_usize(self.max_pages * PAGE_SIZE)
        );
    }
}

unsafe impl PageAllocator for PhysMemoryManager {
    fn alloc_pages(&mut self, mask: GfpFlags, order: u32) -> Option<&mut Page> {
        PhysMemoryManager::alloc_pages(self, mask, order)
    }

    fn get_zeroed_page(&mut self, mask: GfpFlags) -> Option<&mut Page> {
        PhysMemoryManager::get_zeroed_page(self, mask)
    }

    unsafe fn free_pages(&mut self, addr: PhysAddr, order: u32) {
        PhysMemoryManager::free_pages(self, addr, order)
    }

    fn page(&self, addr: PhysAddr) -> &Page {
        PhysMemoryManager::page(self, addr)
    }

    fn page_mut(&mut self, addr: PhysAddr) -> &mut Page {
        PhysMemoryManager::page_mut(self, addr)
    }
}
