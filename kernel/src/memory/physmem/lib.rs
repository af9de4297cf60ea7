// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical memory management and allocation.
//!
//! This crate implements the kernel's frame allocator: a bitmap
//! with one bit per physical frame, plus a parallel array of
//! [`Page`](memory::Page) descriptors, both self-hosted in the
//! memory they describe, immediately after the kernel image.
//!
//! [`PhysMemoryManager::new`] interprets the BIOS memory map
//! handed over by the bootloader: it sizes the bitmap from the
//! map's total extent, frees the frames of `Available` regions,
//! and re-reserves the kernel image, its own metadata, and frame
//! zero. Reserving frame zero means the zero address can never
//! be a valid allocation, so it doubles as the "no memory"
//! sentinel throughout the kernel.
//!
//! ## Helper functions
//!
//! While the allocator can be used directly via
//! [`ALLOCATOR`](struct@ALLOCATOR), the [`allocate_pages`],
//! [`allocate_zeroed_page`], and [`free_pages`] helpers are
//! typically easier to use. The [`debug`] function prints the
//! allocator's counters.
//!
//! # Examples
//!
//! ```
//! # fn doc(regions: multiboot::MemoryMapIter, kernel: physmem::KernelRegion) {
//! use memory::GfpFlags;
//!
//! unsafe { physmem::init(regions, kernel) };
//!
//! // Allocate and free one frame.
//! let addr = physmem::allocate_pages(GfpFlags::KERNEL, 0).unwrap();
//! unsafe { physmem::free_pages(addr, 0) };
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

mod bitmap;
mod manager;

pub use crate::bitmap::FrameBitmap;
pub use crate::manager::{KernelRegion, PhysMemoryManager, BOOT_STACK_GUARD};

use lazy_static::lazy_static;
use memory::{GfpFlags, PhysAddr};
use multiboot::MemoryRegion;
use spin::Mutex;

lazy_static! {
    /// The physical memory allocator.
    ///
    /// `ALLOCATOR` starts out empty and can satisfy no
    /// allocation until [`init`] has built it from the BIOS
    /// memory map.
    ///
    pub static ref ALLOCATOR: Mutex<PhysMemoryManager> =
        Mutex::new(PhysMemoryManager::empty());
}

/// Builds the physical memory manager from the BIOS memory map.
///
/// # Safety
///
/// The memory map must be valid and complete, every `Available`
/// frame outside the kernel image must be unused, and `init`
/// must be called at most once, before any allocation.
///
pub unsafe fn init<I>(regions: I, kernel: KernelRegion)
where
    I: Iterator<Item = MemoryRegion> + Clone,
{
    *ALLOCATOR.lock() = PhysMemoryManager::new(regions, kernel);
}

/// Allocates `1 << order` physically contiguous frames and
/// returns the address of the first, or `None`.
///
/// If `allocate_pages` is called before [`init`], it returns
/// `None`.
///
pub fn allocate_pages(mask: GfpFlags, order: u32) -> Option<PhysAddr> {
    let mut allocator = ALLOCATOR.lock();
    allocator.alloc_pages(mask, order).map(|page| page.addr())
}

/// Allocates a single zero-filled frame and returns its
/// address, or `None`.
///
/// `mask` must include [`GfpFlags::ZERO`].
///
pub fn allocate_zeroed_page(mask: GfpFlags) -> Option<PhysAddr> {
    let mut allocator = ALLOCATOR.lock();
    allocator.get_zeroed_page(mask).map(|page| page.addr())
}

/// Returns `1 << order` frames starting at `addr` to the
/// allocator.
///
/// # Safety
///
/// The caller must own the frames being freed and must not
/// touch them afterwards.
///
pub unsafe fn free_pages(addr: PhysAddr, order: u32) {
    let mut allocator = ALLOCATOR.lock();
    allocator.free_pages(addr, order);
}

/// Prints debug information about the physical memory manager.
///
pub fn debug() {
    let allocator = ALLOCATOR.lock();
    allocator.debug();
}
