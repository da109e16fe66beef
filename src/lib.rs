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

//! Buffer cache, inode, paging, and process-lifecycle subsystem of a small
//! teaching kernel.
//!
//! The hardware-adjacent collaborators — the block devices, the free-map
//! bitmap allocator, the MMU, and the physical page allocator — are external
//! to this crate; see [`block`], [`freemap`], and [`mmu`] for their
//! contracts. [`System`] bundles the process-wide subsystems built on top of
//! them (the buffer cache, open-inode table, frame table, and swap store)
//! with an explicit construct/teardown lifecycle.

pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod frame;
pub mod freemap;
pub mod inode;
pub mod logging;
pub mod mmu;
pub mod process;
pub mod spt;
pub mod swap;

#[cfg(test)]
pub mod testutil;

use block::BlockDevice;
use cache::BufferCache;
use freemap::FreeMap;
use frame::FrameTable;
use inode::InodeTable;
use logging::kinfo;
use mmu::{KernelMemory, Mmu, PageAllocator};
use std::sync::Arc;
use swap::Swap;

/// The process-wide subsystems, constructed together and torn down in
/// reverse order. Call sites take `&System`/`Arc<System>` instead of reaching
/// for kernel statics, so the whole stack can be stood up and discarded
/// independently in every test.
pub struct System {
    pub cache: Arc<BufferCache>,
    pub inodes: Arc<InodeTable>,
    pub frames: Arc<FrameTable>,
    pub swap: Arc<Swap>,
}

impl System {
    /// Wires up a fresh system over the given hardware collaborators. The
    /// buffer cache's write-behind thread starts immediately.
    pub fn new(
        filesys_device: Arc<dyn BlockDevice>,
        swap_device: Arc<dyn BlockDevice>,
        free_map: Arc<dyn FreeMap>,
        page_allocator: Arc<dyn PageAllocator>,
        memory: Arc<dyn KernelMemory>,
        mmu: Arc<dyn Mmu>,
    ) -> Arc<Self> {
        let cache = BufferCache::new(filesys_device);
        let inodes = Arc::new(InodeTable::new(cache.clone(), free_map));
        let swap = Arc::new(Swap::new(swap_device));
        let frames = Arc::new(FrameTable::new(page_allocator, memory, mmu, swap.clone()));
        kinfo!("system online");
        Arc::new(Self {
            cache,
            inodes,
            frames,
            swap,
        })
    }

    /// Tears the system down in the reverse of construction order: there is
    /// nothing to stop in the frame table or swap store, so this amounts to
    /// flushing and stopping the buffer cache's writer thread.
    pub fn shutdown(&self) {
        self.cache.close();
        kinfo!("system offline");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutil::{BitmapFreeMap, FakeKernelMemory, FakeMmu, FakePageAllocator, MemBlockDevice};

    #[test]
    fn system_wires_up_and_shuts_down_cleanly() {
        let filesys = Arc::new(MemBlockDevice::new(256));
        let swap_dev = Arc::new(MemBlockDevice::new(64));
        let free_map = Arc::new(BitmapFreeMap::new(256));
        let system = System::new(
            filesys,
            swap_dev,
            free_map.clone(),
            Arc::new(FakePageAllocator::new(4)),
            Arc::new(FakeKernelMemory::new()),
            Arc::new(FakeMmu::new()),
        );

        let sector = free_map.allocate(1).unwrap();
        system.inodes.create(sector, 0, false, 0).unwrap();
        let file = system.inodes.open(sector).unwrap();
        file.write_at(&[1u8; 10], 10, 0).unwrap();
        system.inodes.close(&file);

        system.shutdown();
    }
}
