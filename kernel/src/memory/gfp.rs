// Copyright 2024 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use bitflags::bitflags;

bitflags! {
    /// Flags supplied by the caller of an allocation,
    /// stating who the memory is for and how it must be
    /// prepared.
    ///
    /// An allocation that does not include [`KERNEL`](GfpFlags::KERNEL)
    /// is rejected.
    ///
    pub struct GfpFlags: u8 {
        /// The allocation is for kernel-internal use.
        const KERNEL = 0b0000_0001;

        /// The allocated memory must be zero-filled.
        const ZERO = 0b0000_0010;
    }
}
