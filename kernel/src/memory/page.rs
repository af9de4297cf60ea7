// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::PhysAddr;
use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Status bits recorded in a [`Page`] descriptor.
    ///
    pub struct PageFlags: u8 {
        /// The frame must never be returned by the
        /// allocator.
        const RESERVED = 0b1000_0000;
    }
}

/// The descriptor the frame allocator keeps for one frame of
/// physical memory.
///
/// Descriptors are created once, when the frame allocator is
/// initialised, one per representable frame, and live for the
/// rest of the kernel's lifetime. The descriptor at index `i`
/// always describes frame `i`.
///
/// Beyond its status flags, a descriptor records which object
/// cache currently owns the frame, if any. The slab allocator
/// stamps the owner when it claims a frame for a cache and
/// clears it when the frame drains; `kfree` uses the stamp to
/// route an object back to the cache it came from.
///
pub struct Page {
    pfn: usize,
    flags: PageFlags,
    owner: Option<u8>,
}

impl Page {
    /// Returns a fresh descriptor for frame `pfn`.
    ///
    pub const fn new(pfn: usize) -> Self {
        Page {
            pfn,
            flags: PageFlags::empty(),
            owner: None,
        }
    }

    /// Returns the number of the described frame.
    ///
    #[inline]
    pub const fn pfn(&self) -> usize {
        self.pfn
    }

    /// Returns the address of the first byte in the
    /// described frame.
    ///
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        PhysAddr::from_frame_number(self.pfn)
    }

    /// Returns the descriptor's status flags.
    ///
    #[inline]
    pub const fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Returns whether the frame is reserved and must
    /// never be handed out.
    ///
    #[inline]
    pub const fn is_reserved(&self) -> bool {
        self.flags.contains(PageFlags::RESERVED)
    }

    /// Marks the frame as reserved.
    ///
    #[inline]
    pub fn mark_reserved(&mut self) {
        self.flags.insert(PageFlags::RESERVED);
    }

    /// Returns the owner token stamped on the frame, if
    /// any.
    ///
    #[inline]
    pub const fn owner(&self) -> Option<u8> {
        self.owner
    }

    /// Stamps an owner token on the frame.
    ///
    #[inline]
    pub fn set_owner(&mut self, owner: u8) {
        self.owner = Some(owner);
    }

    /// Removes the frame's owner token.
    ///
    #[inline]
    pub fn clear_owner(&mut self) {
        self.owner = None;
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Page")
            .field("pfn", &self.pfn)
            .field("addr", &format_args!("{:#x}", self.addr().as_usize()))
            .field("flags", &self.flags)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let mut page = Page::new(0x208);
        assert_eq!(page.pfn(), 0x208);
        assert_eq!(page.addr(), PhysAddr::new(0x208000));
        assert!(!page.is_reserved());
        assert_eq!(page.owner(), None);

        page.mark_reserved();
        assert!(page.is_reserved());

        page.set_owner(3);
        assert_eq!(page.owner(), Some(3));
        page.clear_owner();
        assert_eq!(page.owner(), None);
    }

    #[test]
    fn test_reserved_bit() {
        // The flag value is part of the ABI with the
        // rest of the kernel.
        assert_eq!(PageFlags::RESERVED.bits(), 0b1000_0000);
    }
}
