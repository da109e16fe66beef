/*
 * Copyright 2025 Luc Lenôtre
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

//! Build-time configuration constants.

use std::time::Duration;

/// Size in bytes of a disk sector.
pub const SECTOR_SIZE: usize = 512;

/// Number of slots in the buffer cache.
pub const CACHE_SLOTS: usize = 64;

/// Number of 16-bit sector numbers an indirect block can hold.
pub const SECTORS_PER_INDIRECT: usize = 256;

/// Number of indirect-block pointers a disk inode carries. Sized so the
/// on-disk inode (§6) fits in exactly one 512-byte sector:
/// `INDIRECT_COUNT * 2 + 4 (length) + 1 (is_dir) + 2 (parent) + 4 (magic) <= 512`.
pub const INDIRECT_COUNT: usize = 250;

/// Maximum file size addressable by one-level indirect addressing.
pub const MAX_FILE_SIZE: usize = INDIRECT_COUNT * SECTORS_PER_INDIRECT * SECTOR_SIZE;

/// On-disk magic stamped into every valid inode sector (ASCII "INOD").
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Sentinel sector number meaning "unallocated".
pub const UNUSED_SECTOR: u16 = 0xFFFF;

/// Size in bytes of a user virtual page, and of a swap slot.
pub const PAGE_SIZE: usize = 4096;

/// Number of sectors a swap slot occupies.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// Maximum number of children tracked by a single process record.
pub const MAX_CHILDREN: usize = 64;

/// Interval between write-behind passes of the buffer cache.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Reserved low file descriptors (stdin/stdout), never handed out by
/// [`crate::process::FdList::insert`].
pub const FIRST_FD: i32 = 2;
