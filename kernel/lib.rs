// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! kernel implements the Ember kernel's memory subsystem wiring.
//!
//! This module covers the initialisation that must happen when
//! the kernel starts, in the order the allocators depend on one
//! another: the physical memory manager is built from the
//! Multiboot memory map first, and the slab allocator is carved
//! out of its pages second.
//!
//! # Kernel subsystems
//!
//! The memory subsystems are provided in separate crates. These
//! are:
//!
//! - [memory](::memory)
//! - [memory/kmem](::kmem)
//! - [memory/physmem](::physmem)
//! - [multiboot](::multiboot)
//! - [utils/align](::align)
//! - [utils/pretty](::pretty)

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![allow(unused_crate_dependencies)] // This is to allow the doc references above.

use multiboot::MemoryRegion;
use physmem::KernelRegion;

/// Initialise the kernel's memory allocators from the boot
/// information.
///
/// `init` checks that the bootloader passed a BIOS memory map,
/// builds the physical memory manager over it, and then builds
/// the slab allocator from the manager's pages. Allocation is
/// possible as soon as `init` returns.
///
/// # Panics
///
/// `init` panics if the boot information carries no memory map,
/// or if physical memory is too scarce to assemble the slab
/// allocator. Neither state is recoverable this early in boot.
///
#[cfg(target_os = "none")]
pub fn init(boot_info: &'static multiboot::MultibootInfo) {
    let regions = unsafe { boot_info.memory_map() }
        .expect("bootloader did not provide a memory map");

    unsafe { init_memory(regions, linker::kernel_image()) };

    physmem::debug();
    kmem::debug();
}

/// Initialise the memory allocators over an explicit memory
/// map and kernel image description.
///
/// This is the layout-independent half of [`init`]; it exists
/// separately so environments that do not read the linker
/// symbols (integration tests in particular) can drive the
/// same initialisation order.
///
/// # Safety
///
/// The memory map must be valid and complete, every available
/// frame outside `kernel` must be unused, and the function must
/// be called at most once, before any allocation.
///
pub unsafe fn init_memory<I>(regions: I, kernel: KernelRegion)
where
    I: Iterator<Item = MemoryRegion> + Clone,
{
    physmem::init(regions, kernel);
    kmem::init();
}

/// Reads the kernel image bounds out of the linker script.
///
#[cfg(target_os = "none")]
mod linker {
    use memory::PhysAddr;
    use physmem::{KernelRegion, BOOT_STACK_GUARD};

    extern "C" {
        static kernel_phys_start: u8;
        static kernel_phys_end: u8;
    }

    /// Returns the kernel image's physical extent, with the
    /// boot stack guard applied.
    ///
    pub fn kernel_image() -> KernelRegion {
        let start = unsafe { &kernel_phys_start as *const u8 as usize };
        let end = unsafe { &kernel_phys_end as *const u8 as usize };

        KernelRegion::new(PhysAddr::new(start), PhysAddr::new(end))
            .with_stack_guard(BOOT_STACK_GUARD)
    }
}
