// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A read-only view over the Multiboot 1 boot information.
//!
//! The bootloader leaves a [`MultibootInfo`] structure in physical
//! memory and passes its address to the kernel entry point. This
//! crate declares that structure with the exact layout defined by
//! the Multiboot 1 specification, along with the [`InfoFlags`] that
//! state which of its fields are meaningful.
//!
//! The only part of the structure the memory manager consumes is the
//! BIOS memory map, exposed here as an iterator of [`MemoryRegion`]s:
//!
//! ```
//! use multiboot::RegionType;
//!
//! # let raw = [0u8; 116];
//! # let info = unsafe { multiboot::MultibootInfo::load(raw.as_ptr() as usize) };
//! if let Some(regions) = unsafe { info.memory_map() } {
//!     for region in regions {
//!         if region.kind == RegionType::Available {
//!             // Hand the region to the frame allocator.
//!         }
//!     }
//! }
//! ```
//!
//! The memory map is a packed sequence of [`MemoryMapEntry`]
//! records whose `size` field does not count itself, so the
//! iterator advances by `size + 4` bytes per entry.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

use bitflags::bitflags;
use core::fmt;
use core::mem::size_of;
use core::ptr;
use static_assertions::const_assert_eq;

/// The magic value the bootloader leaves in `EAX` to
/// identify itself as Multiboot 1 compliant.
///
pub const BOOTLOADER_MAGIC: u32 = 0x2bad_b002;

bitflags! {
    /// The flags at the start of the boot information,
    /// stating which fields are present.
    ///
    pub struct InfoFlags: u32 {
        /// `mem_lower` and `mem_upper` are valid.
        const MEMORY = 1 << 0;

        /// `boot_device` is valid.
        const BOOT_DEVICE = 1 << 1;

        /// `cmdline` is valid.
        const CMDLINE = 1 << 2;

        /// `mods_count` and `mods_addr` are valid.
        const MODULES = 1 << 3;

        /// The a.out symbol table is valid.
        const AOUT_SYMS = 1 << 4;

        /// The ELF section header table is valid.
        const ELF_SECTIONS = 1 << 5;

        /// `mmap_addr` and `mmap_length` describe a
        /// full BIOS memory map.
        const MEMORY_MAP = 1 << 6;

        /// `drives_addr` and `drives_length` are valid.
        const DRIVES = 1 << 7;

        /// `config_table` is valid.
        const CONFIG_TABLE = 1 << 8;

        /// `boot_loader_name` is valid.
        const BOOT_LOADER_NAME = 1 << 9;

        /// `apm_table` is valid.
        const APM_TABLE = 1 << 10;

        /// The VBE fields are valid.
        const VBE = 1 << 11;

        /// The framebuffer fields are valid.
        const FRAMEBUFFER = 1 << 12;
    }
}

/// The Multiboot 1 boot information structure, exactly as the
/// bootloader lays it out in physical memory.
///
/// Only `flags`, `mmap_length`, and `mmap_addr` are consumed by
/// the memory manager; the remaining fields are declared so the
/// structure's layout is complete for the other consumers of the
/// boot information.
///
#[repr(C, packed)]
pub struct MultibootInfo {
    pub flags: u32,

    // Valid if InfoFlags::MEMORY.
    pub mem_lower: u32,
    pub mem_upper: u32,

    pub boot_device: u32,
    pub cmdline: u32,

    pub mods_count: u32,
    pub mods_addr: u32,

    // The a.out symbol table or the ELF section
    // header table, depending on the flags.
    pub syms: [u32; 4],

    // Valid if InfoFlags::MEMORY_MAP.
    pub mmap_length: u32,
    pub mmap_addr: u32,

    pub drives_length: u32,
    pub drives_addr: u32,

    pub config_table: u32,
    pub boot_loader_name: u32,
    pub apm_table: u32,

    pub vbe_control_info: u32,
    pub vbe_mode_info: u32,
    pub vbe_mode: u16,
    pub vbe_interface_seg: u16,
    pub vbe_interface_off: u16,
    pub vbe_interface_len: u16,

    pub framebuffer_addr: u64,
    pub framebuffer_pitch: u32,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_bpp: u8,
    pub framebuffer_type: u8,
    pub color_info: [u8; 6],
}

const_assert_eq!(size_of::<MultibootInfo>(), 116);

impl MultibootInfo {
    /// Returns a view over the boot information left at
    /// the given physical address.
    ///
    /// # Safety
    ///
    /// `addr` must be the address received from a Multiboot 1
    /// compliant bootloader, identity-mapped and left untouched
    /// since boot.
    ///
    pub unsafe fn load(addr: usize) -> &'static MultibootInfo {
        &*(addr as *const MultibootInfo)
    }

    /// Returns the set of fields the bootloader filled in.
    ///
    pub fn info_flags(&self) -> InfoFlags {
        InfoFlags::from_bits_truncate(self.flags)
    }

    /// Returns whether the bootloader provided a full BIOS
    /// memory map.
    ///
    pub fn has_memory_map(&self) -> bool {
        self.info_flags().contains(InfoFlags::MEMORY_MAP)
    }

    /// Returns an iterator over the BIOS memory map, or `None`
    /// if the bootloader did not provide one.
    ///
    /// # Safety
    ///
    /// `mmap_addr` and `mmap_length` must describe a valid,
    /// identity-mapped sequence of memory map entries, as they
    /// do when the structure was produced by the bootloader.
    ///
    pub unsafe fn memory_map(&self) -> Option<MemoryMapIter> {
        if !self.has_memory_map() {
            return None;
        }

        Some(MemoryMapIter::new(
            self.mmap_addr as usize,
            self.mmap_length as usize,
        ))
    }
}

/// A raw memory map record, as the BIOS reports it.
///
/// The `size` field holds the number of bytes in the entry
/// *after* the field itself, so successive entries live
/// `size + 4` bytes apart.
///
#[repr(C, packed)]
pub struct MemoryMapEntry {
    pub size: u32,
    pub addr: u64,
    pub len: u64,
    pub entry_type: u32,
}

const_assert_eq!(size_of::<MemoryMapEntry>(), 24);

/// The kind of memory a map entry describes.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionType {
    /// RAM available for use.
    Available,
    /// Memory reserved by the firmware.
    Reserved,
    /// Memory holding ACPI tables, reclaimable once
    /// they have been parsed.
    AcpiReclaimable,
    /// Non-volatile storage that must be preserved
    /// across reboots.
    Nvs,
    /// Defective RAM.
    BadRam,
}

impl RegionType {
    /// Maps the raw `type` field to a region type.
    ///
    /// Values outside the specified range are treated
    /// as reserved.
    ///
    pub fn from_raw(raw: u32) -> RegionType {
        match raw {
            1 => RegionType::Available,
            3 => RegionType::AcpiReclaimable,
            4 => RegionType::Nvs,
            5 => RegionType::BadRam,
            _ => RegionType::Reserved,
        }
    }
}

impl fmt::Display for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegionType::Available => write!(f, "available"),
            RegionType::Reserved => write!(f, "reserved"),
            RegionType::AcpiReclaimable => write!(f, "ACPI reclaimable"),
            RegionType::Nvs => write!(f, "NVS"),
            RegionType::BadRam => write!(f, "bad RAM"),
        }
    }
}

/// One region of the BIOS memory map, decoded from its
/// packed entry.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// The first physical address in the region.
    pub addr: u64,
    /// The region's length in bytes.
    pub len: u64,
    /// What the region contains.
    pub kind: RegionType,
}

impl MemoryRegion {
    /// Returns whether the region is RAM the kernel
    /// may allocate from.
    ///
    pub fn is_usable(&self) -> bool {
        self.kind == RegionType::Available
    }
}

/// An iterator over the packed memory map entries.
///
#[derive(Clone)]
pub struct MemoryMapIter {
    cursor: usize,
    end: usize,
}

impl MemoryMapIter {
    /// Returns an iterator over the packed entry sequence
    /// starting at `addr` and spanning `length` bytes.
    ///
    /// # Safety
    ///
    /// The sequence must remain valid and unmodified for as
    /// long as the iterator (or any clone of it) is in use.
    ///
    pub unsafe fn new(addr: usize, length: usize) -> MemoryMapIter {
        MemoryMapIter {
            cursor: addr,
            end: addr + length,
        }
    }
}

impl Iterator for MemoryMapIter {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        if self.cursor + size_of::<MemoryMapEntry>() > self.end {
            return None;
        }

        let entry = unsafe { ptr::read_unaligned(self.cursor as *const MemoryMapEntry) };
        if entry.size == 0 {
            // A malformed entry would leave the cursor
            // spinning in place.
            self.cursor = self.end;
            return None;
        }

        self.cursor += entry.size as usize + 4;

        Some(MemoryRegion {
            addr: entry.addr,
            len: entry.len,
            kind: RegionType::from_raw(entry.entry_type),
        })
    }
}
