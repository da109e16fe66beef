/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Kernel-wide error taxonomy.
//!
//! Every fallible public operation in this crate returns [`KResult`]. Faults
//! that are genuinely kernel-internal invariant violations (a corrupt inode, a
//! frame table that cannot evict anything) are asserted rather than returned,
//! per the source design: the kernel never limps along on a broken invariant.

use core::fmt;

/// An error surfaced by one of the storage/memory subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The free-map has no sectors left to satisfy a `create` or a growing
    /// `write_at`.
    OutOfDisk,
    /// The frame table could not find a victim to evict.
    OutOfFrame,
    /// An on-disk inode failed its magic check, or an indirect/data pointer
    /// was the unallocated sentinel where one was expected.
    CorruptInode,
    /// A user-space address did not pass validation.
    BadUserAddress,
    /// `wait` was called on an unknown or already-joined child id.
    ChildWaitMiss,
    /// The swap device is full.
    SwapExhausted,
    /// A process already has `MAX_CHILDREN` live children.
    TooManyChildren,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OutOfDisk => "out of disk space",
            Self::OutOfFrame => "out of physical frames",
            Self::CorruptInode => "corrupt inode",
            Self::BadUserAddress => "bad user address",
            Self::ChildWaitMiss => "no such child to wait for",
            Self::SwapExhausted => "swap device exhausted",
            Self::TooManyChildren => "too many live children",
        };
        f.write_str(s)
    }
}

impl std::error::Error for KernelError {}

/// Shorthand used throughout the crate, mirroring the teacher's `EResult`.
pub type KResult<T> = Result<T, KernelError>;
