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

//! Fakes for the hardware-adjacent collaborators this crate externalizes
//! (§1, §6): a RAM-backed block device, a bitmap free map, and an MMU/page
//! allocator pair driven entirely by in-memory maps. Only ever compiled for
//! `cargo test`.

use crate::{
    block::{BlockDevice, Sector},
    config::{PAGE_SIZE, SECTOR_SIZE},
    freemap::FreeMap,
    mmu::{KernelMemory, KernelPage, Mmu, PageAllocator, Pid, UserPage},
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// A block device backed by a `Vec` of sectors, for deterministic tests.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<Sector>>,
}

impl MemBlockDevice {
    /// Creates a device with `count` zeroed sectors.
    pub fn new(count: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; count as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, sector: u32, buf: &mut Sector) {
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[sector as usize]);
    }

    fn write(&self, sector: u32, buf: &Sector) {
        let mut sectors = self.sectors.lock().unwrap();
        sectors[sector as usize] = *buf;
    }

    fn size(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

/// Wraps another [`BlockDevice`] and counts calls, so tests can assert a
/// cache hit issued zero device reads (distilled spec §8 scenario 1).
pub struct CountingBlockDevice<D> {
    inner: D,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl<D: BlockDevice> CountingBlockDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl<D: BlockDevice> BlockDevice for CountingBlockDevice<D> {
    fn read(&self, sector: u32, buf: &mut Sector) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(sector, buf);
    }

    fn write(&self, sector: u32, buf: &Sector) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(sector, buf);
    }

    fn size(&self) -> u32 {
        self.inner.size()
    }
}

/// A first-fit bitmap free map over `total` sectors.
pub struct BitmapFreeMap {
    used: Mutex<Vec<bool>>,
}

impl BitmapFreeMap {
    pub fn new(total: u32) -> Self {
        Self {
            used: Mutex::new(vec![false; total as usize]),
        }
    }
}

impl FreeMap for BitmapFreeMap {
    fn allocate(&self, n: u32) -> Option<u32> {
        let mut used = self.used.lock().unwrap();
        let n = n as usize;
        if n == 0 {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0usize;
        for (i, slot) in used.iter().enumerate() {
            if *slot {
                run_start = None;
                run_len = 0;
                continue;
            }
            if run_start.is_none() {
                run_start = Some(i);
            }
            run_len += 1;
            if run_len == n {
                let start = run_start.unwrap();
                for s in used.iter_mut().skip(start).take(n) {
                    *s = true;
                }
                return Some(start as u32);
            }
        }
        None
    }

    fn release(&self, start: u32, n: u32) {
        let mut used = self.used.lock().unwrap();
        for s in used.iter_mut().skip(start as usize).take(n as usize) {
            *s = false;
        }
    }
}

/// An in-memory page-table simulation: a map from `(pid, upage)` to
/// `(kpage, writable, accessed, dirty)`.
#[derive(Default)]
pub struct FakeMmu {
    table: Mutex<HashMap<(Pid, UserPage), Entry>>,
}

#[derive(Clone, Copy)]
struct Entry {
    kpage: KernelPage,
    accessed: bool,
    dirty: bool,
}

impl FakeMmu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mmu for FakeMmu {
    fn set_page(&self, pid: Pid, upage: UserPage, kpage: KernelPage, _writable: bool) {
        self.table.lock().unwrap().insert(
            (pid, upage),
            Entry {
                kpage,
                accessed: false,
                dirty: false,
            },
        );
    }

    fn clear_page(&self, pid: Pid, upage: UserPage) {
        self.table.lock().unwrap().remove(&(pid, upage));
    }

    fn get_page(&self, pid: Pid, upage: UserPage) -> Option<KernelPage> {
        self.table.lock().unwrap().get(&(pid, upage)).map(|e| e.kpage)
    }

    fn is_accessed(&self, pid: Pid, upage: UserPage) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(&(pid, upage))
            .map(|e| e.accessed)
            .unwrap_or(false)
    }

    fn set_accessed(&self, pid: Pid, upage: UserPage, value: bool) {
        if let Some(e) = self.table.lock().unwrap().get_mut(&(pid, upage)) {
            e.accessed = value;
        }
    }

    fn is_dirty(&self, pid: Pid, upage: UserPage) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(&(pid, upage))
            .map(|e| e.dirty)
            .unwrap_or(false)
    }

    fn set_dirty(&self, pid: Pid, upage: UserPage, value: bool) {
        if let Some(e) = self.table.lock().unwrap().get_mut(&(pid, upage)) {
            e.dirty = value;
        }
    }
}

/// A page allocator handing out `capacity` distinct fake kernel addresses.
pub struct FakePageAllocator {
    next: AtomicU32,
    capacity: u32,
    free: Mutex<HashSet<u32>>,
}

impl FakePageAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            next: AtomicU32::new(0),
            capacity,
            free: Mutex::new(HashSet::new()),
        }
    }
}

impl PageAllocator for FakePageAllocator {
    fn get_page(&self) -> Option<KernelPage> {
        if let Some(&id) = self.free.lock().unwrap().iter().next() {
            self.free.lock().unwrap().remove(&id);
            return Some(KernelPage(id as usize));
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        if id >= self.capacity {
            return None;
        }
        Some(KernelPage(id as usize))
    }

    fn free_page(&self, page: KernelPage) {
        self.free.lock().unwrap().insert(page.0 as u32);
    }
}

/// A `KernelPage -> PAGE_SIZE` byte array store, standing in for direct
/// access to physical memory.
#[derive(Default)]
pub struct FakeKernelMemory {
    pages: Mutex<HashMap<usize, Vec<u8>>>,
}

impl FakeKernelMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KernelMemory for FakeKernelMemory {
    fn read(&self, page: KernelPage, dst: &mut [u8]) {
        assert_eq!(dst.len(), PAGE_SIZE);
        let pages = self.pages.lock().unwrap();
        match pages.get(&page.0) {
            Some(bytes) => dst.copy_from_slice(bytes),
            None => dst.fill(0),
        }
    }

    fn write(&self, page: KernelPage, src: &[u8]) {
        assert_eq!(src.len(), PAGE_SIZE);
        self.pages.lock().unwrap().insert(page.0, src.to_vec());
    }
}
