// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::{PAGE_SHIFT, PAGE_SIZE};
use align::{align_down_usize, align_up_usize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// An address in the physical address space.
///
/// The zero address doubles as the "no memory" sentinel
/// throughout the allocators: the frame at address zero is
/// reserved at initialisation and never handed out, so no
/// valid allocation can be confused with it.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Creates a new physical memory address.
    ///
    #[inline]
    pub const fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Returns the zero physical memory address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Returns whether this is the zero address.
    ///
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the address's numerical value.
    ///
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    // Frame arithmetic.

    /// Returns the number of the frame containing the
    /// address.
    ///
    #[inline]
    pub const fn frame_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the address of the first byte in frame
    /// `pfn`.
    ///
    #[inline]
    pub const fn from_frame_number(pfn: usize) -> Self {
        PhysAddr(pfn << PAGE_SHIFT)
    }

    /// Returns the address of the first byte in the
    /// frame containing the address.
    ///
    #[inline]
    #[must_use]
    pub const fn frame_base(self) -> Self {
        PhysAddr(align_down_usize(self.0, PAGE_SIZE))
    }

    /// Returns whether the address is the first byte
    /// of its frame.
    ///
    #[inline]
    pub const fn is_frame_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    // Alignment.

    /// Aligns the address upwards to the smallest exact
    /// multiple of `align` that is no smaller than the
    /// address.
    ///
    /// `align` must be an exact power of two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        PhysAddr(align_up_usize(self.0, align))
    }

    /// Aligns the address downwards to the largest exact
    /// multiple of `align` that is no larger than the
    /// address.
    ///
    /// `align` must be an exact power of two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: usize) -> Self {
        PhysAddr(align_down_usize(self.0, align))
    }
}

// Formatting.

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PhysAddr")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl fmt::LowerHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl fmt::Pointer for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&(self.0 as *const ()), f)
    }
}

// Mathematical operators.

impl Add<usize> for PhysAddr {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 + rhs)
    }
}

impl AddAssign<usize> for PhysAddr {
    #[inline]
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl Sub<usize> for PhysAddr {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 - rhs)
    }
}

impl SubAssign<usize> for PhysAddr {
    #[inline]
    fn sub_assign(&mut self, rhs: usize) {
        self.0 -= rhs;
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: PhysAddr) -> Self::Output {
        self.0.checked_sub(rhs.0).expect("physical address underflow")
    }
}
