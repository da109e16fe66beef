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

//! The frame table: a registry of every physical frame currently backing a
//! user mapping, with second-chance clock eviction to swap.

use crate::{
    config::PAGE_SIZE,
    error::{KResult, KernelError},
    inode::Inode,
    logging::kwarn,
    mmu::{KernelMemory, KernelPage, Mmu, PageAllocator, Pid, UserPage},
    swap::{Swap, SwapSlot},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The backing file of a `map`-ed SPT entry, as reported by
/// [`EvictionTarget::mapped_backing`]: its content can always be refetched
/// from `file`, so eviction writes a dirty copy back there instead of
/// spending a swap slot on it.
pub struct MappedBacking {
    pub file: Arc<Inode>,
    pub offset: u32,
    pub bytes: u32,
}

/// Notified by the frame table when one of its pages is evicted, so the
/// owning process's supplemental page table can be updated in place. A
/// process registers its SPT as its `EvictionTarget` for as long as it is
/// alive.
pub trait EvictionTarget: Send + Sync {
    /// Returns the mapped-file backing of `upage`, if it is a `map`-ed entry.
    /// The frame table consults this before choosing swap vs. writeback on
    /// eviction.
    fn mapped_backing(&self, upage: UserPage) -> Option<MappedBacking>;

    /// `upage` was just written to `slot` and unmapped; transition its entry
    /// to `ON_SWAP`.
    fn mark_swapped(&self, upage: UserPage, slot: SwapSlot);

    /// `upage`'s dirty contents (if any) were just written back to its
    /// mapped file instead of swap; transition its entry back to `IN_FILE`.
    fn mark_written_back(&self, upage: UserPage);
}

struct FrameRecord {
    kpage: KernelPage,
    owner: Pid,
    upage: UserPage,
    pinned: bool,
}

struct Inner {
    records: Vec<FrameRecord>,
    index: HashMap<KernelPage, usize>,
    cursor: usize,
}

impl Inner {
    fn remove_at(&mut self, idx: usize) {
        self.records.remove(idx);
        self.index.clear();
        for (i, r) in self.records.iter().enumerate() {
            self.index.insert(r.kpage, i);
        }
        if self.cursor > idx {
            self.cursor -= 1;
        }
        if !self.records.is_empty() {
            self.cursor %= self.records.len();
        } else {
            self.cursor = 0;
        }
    }
}

/// The physical-frame registry, shared by every process in the system.
pub struct FrameTable {
    allocator: Arc<dyn PageAllocator>,
    memory: Arc<dyn KernelMemory>,
    mmu: Arc<dyn Mmu>,
    swap: Arc<Swap>,
    owners: Mutex<HashMap<Pid, Arc<dyn EvictionTarget>>>,
    inner: Mutex<Inner>,
}

impl FrameTable {
    /// Creates an empty frame table over the given collaborators.
    pub fn new(
        allocator: Arc<dyn PageAllocator>,
        memory: Arc<dyn KernelMemory>,
        mmu: Arc<dyn Mmu>,
        swap: Arc<Swap>,
    ) -> Self {
        Self {
            allocator,
            memory,
            mmu,
            swap,
            owners: Mutex::new(HashMap::new()),
            inner: Mutex::new(Inner {
                records: Vec::new(),
                index: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    /// Registers `target` as the eviction notification sink for `pid`. Must
    /// be called before any frame is allocated on the process's behalf.
    pub fn register_owner(&self, pid: Pid, target: Arc<dyn EvictionTarget>) {
        self.owners.lock().unwrap().insert(pid, target);
    }

    /// Drops the eviction notification sink for `pid`, once the process is
    /// gone (called after [`EvictionTarget::mark_swapped`] can no longer be
    /// meaningfully delivered).
    pub fn unregister_owner(&self, pid: Pid) {
        self.owners.lock().unwrap().remove(&pid);
    }

    /// Obtains a frame for `upage` in `pid`'s address space, evicting a
    /// victim if the underlying page pool is exhausted. The returned frame
    /// is pinned; the caller must [`FrameTable::pin_update`] it to `false`
    /// once the page is fully installed.
    pub fn allocate(&self, pid: Pid, upage: UserPage) -> KResult<KernelPage> {
        let mut inner = self.inner.lock().unwrap();
        let kpage = match self.allocator.get_page() {
            Some(kpage) => kpage,
            None => self.evict(&mut inner)?,
        };
        let idx = inner.records.len();
        inner.records.push(FrameRecord {
            kpage,
            owner: pid,
            upage,
            pinned: true,
        });
        inner.index.insert(kpage, idx);
        Ok(kpage)
    }

    /// Releases the frame holding `kpage`. If `release_resource`, the page
    /// is returned to the underlying pool; otherwise the caller retains
    /// ownership of its content (used when a page directory teardown will
    /// free the physical page itself).
    pub fn free(&self, kpage: KernelPage, release_resource: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.index.get(&kpage) {
            inner.remove_at(idx);
        }
        if release_resource {
            self.allocator.free_page(kpage);
        }
    }

    /// Sets the pin flag of the frame holding `kpage`.
    pub fn pin_update(&self, kpage: KernelPage, pinned: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.index.get(&kpage) {
            inner.records[idx].pinned = pinned;
        }
    }

    /// Second-chance clock scan bounded to `2 * len` steps: skips pinned
    /// frames, gives an accessed-but-unpinned frame one pass, and evicts the
    /// first unaccessed one it finds. A `map`-ed victim is written back to
    /// its backing file instead of swap, since its content can always be
    /// refetched from there; every other victim goes to swap. Either way its
    /// MMU mapping is cleared and its owner's SPT is notified before the
    /// reclaimed page is returned.
    fn evict(&self, inner: &mut Inner) -> KResult<KernelPage> {
        let n = inner.records.len();
        if n == 0 {
            return Err(KernelError::OutOfFrame);
        }
        let victim_idx = (0..2 * n).find_map(|_| {
            let idx = inner.cursor;
            inner.cursor = (inner.cursor + 1) % n;
            let record = &inner.records[idx];
            if record.pinned {
                return None;
            }
            if self.mmu.is_accessed(record.owner, record.upage) {
                self.mmu.set_accessed(record.owner, record.upage, false);
                return None;
            }
            Some(idx)
        });
        let victim_idx = victim_idx.ok_or(KernelError::OutOfFrame)?;

        let kpage = inner.records[victim_idx].kpage;
        let owner = inner.records[victim_idx].owner;
        let upage = inner.records[victim_idx].upage;

        let mut contents = vec![0u8; PAGE_SIZE];
        self.memory.read(kpage, &mut contents);
        let target = self.owners.lock().unwrap().get(&owner).cloned();
        let mapped = target.as_ref().and_then(|t| t.mapped_backing(upage));

        if let Some(backing) = mapped {
            if self.mmu.is_dirty(owner, upage) {
                let bytes = backing.bytes as usize;
                if let Err(e) =
                    backing
                        .file
                        .write_at(&contents[..bytes], bytes, backing.offset as usize)
                {
                    kwarn!("eviction writeback failed for upage {:?}: {e}", upage);
                }
            }
            self.mmu.clear_page(owner, upage);
            if let Some(target) = target {
                target.mark_written_back(upage);
            }
        } else {
            let slot = self.swap.save(&contents)?;
            self.mmu.clear_page(owner, upage);
            if let Some(target) = target {
                target.mark_swapped(upage, slot);
            }
        }
        self.memory.write(kpage, &vec![0u8; PAGE_SIZE]);

        inner.remove_at(victim_idx);
        Ok(kpage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeKernelMemory, FakeMmu, FakePageAllocator};
    use std::sync::Mutex as StdMutex;

    fn swap_fixture(slots: u32) -> Arc<Swap> {
        use crate::{config::SECTORS_PER_SLOT, testutil::MemBlockDevice};
        Arc::new(Swap::new(Arc::new(MemBlockDevice::new(
            slots * SECTORS_PER_SLOT as u32,
        ))))
    }

    struct RecordingTarget {
        calls: StdMutex<Vec<(UserPage, SwapSlot)>>,
    }

    impl RecordingTarget {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    impl EvictionTarget for RecordingTarget {
        fn mapped_backing(&self, _upage: UserPage) -> Option<MappedBacking> {
            None
        }

        fn mark_swapped(&self, upage: UserPage, slot: SwapSlot) {
            self.calls.lock().unwrap().push((upage, slot));
        }

        fn mark_written_back(&self, _upage: UserPage) {}
    }

    #[test]
    fn allocate_without_pressure_never_evicts() {
        let table = FrameTable::new(
            Arc::new(FakePageAllocator::new(4)),
            Arc::new(FakeKernelMemory::new()),
            Arc::new(FakeMmu::new()),
            swap_fixture(4),
        );
        let a = table.allocate(1, UserPage(0x1000)).unwrap();
        let b = table.allocate(1, UserPage(0x2000)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn eviction_notifies_owner_and_reuses_the_frame() {
        let mmu = Arc::new(FakeMmu::new());
        let table = FrameTable::new(
            Arc::new(FakePageAllocator::new(1)),
            Arc::new(FakeKernelMemory::new()),
            mmu.clone(),
            swap_fixture(4),
        );
        let target = Arc::new(RecordingTarget::new());
        table.register_owner(1, target.clone());

        let victim_page = UserPage(0x1000);
        let kpage = table.allocate(1, victim_page).unwrap();
        table.pin_update(kpage, false);
        mmu.set_page(1, victim_page, kpage, true);

        // Pool is exhausted: the next allocate must evict the unpinned,
        // unaccessed victim above.
        let reused = table.allocate(2, UserPage(0x2000)).unwrap();
        assert_eq!(reused, kpage);
        assert_eq!(target.calls.lock().unwrap().len(), 1);
        assert!(mmu.get_page(1, victim_page).is_none());
    }

    #[test]
    fn pinned_frame_is_never_evicted() {
        let table = FrameTable::new(
            Arc::new(FakePageAllocator::new(1)),
            Arc::new(FakeKernelMemory::new()),
            Arc::new(FakeMmu::new()),
            swap_fixture(4),
        );
        table.register_owner(1, Arc::new(RecordingTarget::new()));
        table.allocate(1, UserPage(0x1000)).unwrap();
        // The sole frame stays pinned (default on allocate): eviction must
        // find no victim and fail rather than reclaim it.
        let err = table.allocate(2, UserPage(0x2000)).unwrap_err();
        assert_eq!(err, KernelError::OutOfFrame);
    }

    #[test]
    fn free_advances_cursor_safely() {
        let table = FrameTable::new(
            Arc::new(FakePageAllocator::new(4)),
            Arc::new(FakeKernelMemory::new()),
            Arc::new(FakeMmu::new()),
            swap_fixture(4),
        );
        let a = table.allocate(1, UserPage(0x1000)).unwrap();
        let _b = table.allocate(1, UserPage(0x2000)).unwrap();
        table.free(a, true);
        let c = table.allocate(1, UserPage(0x3000)).unwrap();
        assert_ne!(c, a);
    }
}
