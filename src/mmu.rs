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

//! Contracts for the two hardware-adjacent collaborators of the VM
//! subsystem: the MMU/TLB primitives and the physical page allocator.
//!
//! Both are out of scope per §1 of the specification; only the shape the
//! frame table and supplemental page table need is declared here.

use crate::config::PAGE_SIZE;

/// A physical frame's kernel-virtual base address, as handed out by the page
/// allocator. Opaque outside of this crate: callers never dereference it
/// directly, they pass it back to [`Mmu`]/[`PageAllocator`] methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelPage(pub usize);

/// A user-space virtual page number (address with the page offset bits
/// masked off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserPage(pub usize);

impl UserPage {
    /// Returns the `n` consecutive pages starting at `self`, per the
    /// addressing convention `install_file`/`unmap` use for multi-page
    /// regions (mmap spans several pages but one call).
    pub fn range(self, n: usize) -> impl Iterator<Item = UserPage> {
        (0..n).map(move |i| UserPage(self.0 + i * PAGE_SIZE))
    }
}

/// The identity of the process a frame or SPT entry belongs to.
pub type Pid = u32;

/// MMU/TLB primitives: installing, clearing, and inspecting the accessed/
/// dirty bits of a page-table entry. Implemented by the rest of the kernel in
/// production (a real page directory); implemented by
/// [`crate::testutil::FakeMmu`] in tests.
pub trait Mmu: Send + Sync {
    /// Installs a mapping from `upage` to `kpage` in `pid`'s address space.
    fn set_page(&self, pid: Pid, upage: UserPage, kpage: KernelPage, writable: bool);

    /// Removes the mapping for `upage` in `pid`'s address space, if any.
    fn clear_page(&self, pid: Pid, upage: UserPage);

    /// Returns the kernel page `upage` is mapped to in `pid`, if mapped.
    fn get_page(&self, pid: Pid, upage: UserPage) -> Option<KernelPage>;

    /// Returns the accessed bit of `upage`'s mapping.
    fn is_accessed(&self, pid: Pid, upage: UserPage) -> bool;

    /// Sets the accessed bit of `upage`'s mapping.
    fn set_accessed(&self, pid: Pid, upage: UserPage, value: bool);

    /// Returns the dirty bit of `upage`'s mapping.
    fn is_dirty(&self, pid: Pid, upage: UserPage) -> bool;

    /// Sets the dirty bit of `upage`'s mapping.
    fn set_dirty(&self, pid: Pid, upage: UserPage, value: bool);
}

/// The physical page allocator's user pool, as seen from the frame table.
pub trait PageAllocator: Send + Sync {
    /// Obtains a zeroed page from the user pool, or `None` if the pool is
    /// exhausted.
    fn get_page(&self) -> Option<KernelPage>;

    /// Returns `page` to the user pool.
    fn free_page(&self, page: KernelPage);
}

/// Raw content access to a physical frame, addressed by the opaque
/// [`KernelPage`] handle. Out of scope in the same sense as [`Mmu`]/
/// [`PageAllocator`]: a real kernel just `memcpy`s through the kernel's direct
/// map of physical memory, which has no equivalent in a hosted test binary.
pub trait KernelMemory: Send + Sync {
    /// Copies the full contents of `page` into `dst` (exactly `PAGE_SIZE`
    /// bytes).
    fn read(&self, page: KernelPage, dst: &mut [u8]);

    /// Overwrites the full contents of `page` with `src` (exactly
    /// `PAGE_SIZE` bytes).
    fn write(&self, page: KernelPage, src: &[u8]);
}
