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

//! Per-process supplemental page table: lazy-load descriptors keyed by user
//! virtual page, demand-loaded from zero fill, a backing file, or swap.

use crate::{
    config::PAGE_SIZE,
    error::{KResult, KernelError},
    frame::{EvictionTarget, FrameTable, MappedBacking},
    inode::{Inode, InodeTable},
    logging::kwarn,
    mmu::{KernelMemory, KernelPage, Mmu, Pid, UserPage},
    swap::{Swap, SwapSlot},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The lazy-load source of an SPT entry not yet resident in a frame, plus the
/// resident case.
enum Status {
    /// Backed by a live frame.
    Loaded(KernelPage),
    /// Anonymous, zero-filled on first touch.
    Zero,
    /// Demand-loaded from a file: the first `bytes_to_read` bytes of the page
    /// come from `file` at `offset`, the remainder is zeroed.
    InFile {
        file: Arc<Inode>,
        offset: u32,
        bytes_to_read: u32,
    },
    /// Evicted to swap.
    OnSwap(SwapSlot),
}

struct Entry {
    writable: bool,
    /// Set by `map`: on eviction or `unmap`, dirty content is written back
    /// to the file instead of (or in addition to) going to swap.
    mapped: Option<MappedFile>,
    status: Status,
}

struct MappedFile {
    file: Arc<Inode>,
    offset: u32,
    bytes: u32,
}

/// One process's address space of lazily-loaded pages.
pub struct Spt {
    pid: Pid,
    frames: Arc<FrameTable>,
    swap: Arc<Swap>,
    mmu: Arc<dyn Mmu>,
    memory: Arc<dyn KernelMemory>,
    inodes: Arc<InodeTable>,
    entries: Mutex<HashMap<UserPage, Entry>>,
}

impl Spt {
    /// Creates an empty table for `pid`, sharing the system-wide frame
    /// table, swap store, MMU, memory accessor, and open-inode table (the
    /// last is needed only to close a mapped file on `unmap`).
    pub fn new(
        pid: Pid,
        frames: Arc<FrameTable>,
        swap: Arc<Swap>,
        mmu: Arc<dyn Mmu>,
        memory: Arc<dyn KernelMemory>,
        inodes: Arc<InodeTable>,
    ) -> Self {
        Self {
            pid,
            frames,
            swap,
            mmu,
            memory,
            inodes,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records an already-resident mapping. Fails if `upage` already has an
    /// entry.
    pub fn install_page(&self, upage: UserPage, kpage: KernelPage, writable: bool) -> KResult<()> {
        self.insert_new(
            upage,
            Entry {
                writable,
                mapped: None,
                status: Status::Loaded(kpage),
            },
        )
    }

    /// Records a lazy anonymous zero page.
    pub fn install_zero(&self, upage: UserPage, writable: bool) -> KResult<()> {
        self.insert_new(
            upage,
            Entry {
                writable,
                mapped: None,
                status: Status::Zero,
            },
        )
    }

    /// Records a lazy demand-load from `file`.
    pub fn install_file(
        &self,
        upage: UserPage,
        file: Arc<Inode>,
        offset: u32,
        bytes_to_read: u32,
        writable: bool,
    ) -> KResult<()> {
        self.insert_new(
            upage,
            Entry {
                writable,
                mapped: None,
                status: Status::InFile {
                    file,
                    offset,
                    bytes_to_read,
                },
            },
        )
    }

    /// As [`Spt::install_file`], but marks the page `mapped` so a dirty
    /// eviction or [`Spt::unmap`] writes its contents back.
    pub fn map(&self, upage: UserPage, file: Arc<Inode>, offset: u32, bytes: u32) -> KResult<()> {
        self.insert_new(
            upage,
            Entry {
                writable: true,
                mapped: Some(MappedFile {
                    file: file.clone(),
                    offset,
                    bytes,
                }),
                status: Status::InFile {
                    file,
                    offset,
                    bytes_to_read: bytes,
                },
            },
        )
    }

    fn insert_new(&self, upage: UserPage, entry: Entry) -> KResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&upage) {
            return Err(KernelError::CorruptInode);
        }
        entries.insert(upage, entry);
        Ok(())
    }

    /// Removes `n_pages` consecutive entries starting at `upage_begin`,
    /// writing back a dirty mapped page's contents (loaded or already
    /// evicted to swap) and closing the file on the last page.
    pub fn unmap(&self, upage_begin: UserPage, n_pages: usize) {
        let mut entries = self.entries.lock().unwrap();
        let pages: Vec<UserPage> = upage_begin.range(n_pages).collect();
        let last = pages.len().saturating_sub(1);
        for (i, upage) in pages.iter().enumerate() {
            let Some(Entry { mapped, status, .. }) = entries.remove(upage) else {
                continue;
            };
            match status {
                Status::Loaded(kpage) => {
                    if let Some(mapped) = &mapped {
                        if self.mmu.is_dirty(self.pid, *upage) {
                            let mut buf = vec![0u8; PAGE_SIZE];
                            self.memory.read(kpage, &mut buf);
                            if let Err(e) = mapped.file.write_at(
                                &buf[..mapped.bytes as usize],
                                mapped.bytes as usize,
                                mapped.offset as usize,
                            ) {
                                // The mapping is still torn down; the file is just short.
                                kwarn!("mmap writeback failed for upage {:?}: {e}", upage);
                            }
                        }
                    }
                    self.mmu.clear_page(self.pid, *upage);
                    self.frames.free(kpage, true);
                }
                Status::OnSwap(slot) => {
                    if let Some(mapped) = &mapped {
                        let mut buf = vec![0u8; PAGE_SIZE];
                        self.swap.load(slot, &mut buf);
                        if let Err(e) = mapped.file.write_at(
                            &buf[..mapped.bytes as usize],
                            mapped.bytes as usize,
                            mapped.offset as usize,
                        ) {
                            kwarn!("mmap writeback failed for upage {:?}: {e}", upage);
                        }
                    }
                    self.swap.discard(slot);
                }
                Status::Zero | Status::InFile { .. } => {}
            }
            if i == last {
                if let Some(mapped) = &mapped {
                    self.inodes.close(&mapped.file);
                }
            }
        }
    }

    /// Demand-loads `upage`, obtaining a frame and materializing its
    /// content. Idempotent while the entry is already `LOADED`. Returns
    /// `Err` on any failure; the caller terminates the offending process.
    pub fn load(&self, upage: UserPage) -> KResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&upage).ok_or(KernelError::BadUserAddress)?;
        if matches!(entry.status, Status::Loaded(_)) {
            return Ok(());
        }

        let kpage = self.frames.allocate(self.pid, upage)?;
        match &entry.status {
            Status::Zero => {
                self.memory.write(kpage, &vec![0u8; PAGE_SIZE]);
            }
            Status::InFile {
                file,
                offset,
                bytes_to_read,
            } => {
                let mut buf = vec![0u8; PAGE_SIZE];
                let read = file.read_at(
                    &mut buf[..*bytes_to_read as usize],
                    *bytes_to_read as usize,
                    *offset as usize,
                );
                buf[read..].fill(0);
                self.memory.write(kpage, &buf);
            }
            Status::OnSwap(slot) => {
                let mut buf = vec![0u8; PAGE_SIZE];
                self.swap.load(*slot, &mut buf);
                self.swap.discard(*slot);
                self.memory.write(kpage, &buf);
            }
            Status::Loaded(_) => unreachable!(),
        }

        self.mmu.set_page(self.pid, upage, kpage, entry.writable);
        self.mmu.set_dirty(self.pid, upage, false);
        entry.status = Status::Loaded(kpage);
        self.frames.pin_update(kpage, false);
        Ok(())
    }

    /// Tears down every entry on process exit: frees each loaded frame
    /// (without returning its page to the pool — page-directory teardown
    /// does that) and discards any owned swap slot. Callers must have
    /// already unmapped every mapped region.
    pub fn destroy(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (upage, entry) in entries.drain() {
            debug_assert!(entry.mapped.is_none(), "mapped region still present at destroy");
            match entry.status {
                Status::Loaded(kpage) => {
                    self.mmu.clear_page(self.pid, upage);
                    self.frames.free(kpage, false);
                }
                Status::OnSwap(slot) => self.swap.discard(slot),
                Status::Zero | Status::InFile { .. } => {}
            }
        }
    }
}

impl EvictionTarget for Spt {
    fn mapped_backing(&self, upage: UserPage) -> Option<MappedBacking> {
        let entries = self.entries.lock().unwrap();
        entries.get(&upage).and_then(|e| e.mapped.as_ref()).map(|m| MappedBacking {
            file: m.file.clone(),
            offset: m.offset,
            bytes: m.bytes,
        })
    }

    fn mark_swapped(&self, upage: UserPage, slot: SwapSlot) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&upage) {
            assert!(matches!(entry.status, Status::Loaded(_)), "evicting a non-resident entry");
            entry.status = Status::OnSwap(slot);
        }
    }

    /// A dirty mapped page was just written back to its file instead of
    /// swap; its content can always be refetched from there, so the entry
    /// reverts to `IN_FILE` at the same offset rather than `ON_SWAP`.
    fn mark_written_back(&self, upage: UserPage) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&upage) {
            assert!(matches!(entry.status, Status::Loaded(_)), "evicting a non-resident entry");
            if let Some(mapped) = &entry.mapped {
                entry.status = Status::InFile {
                    file: mapped.file.clone(),
                    offset: mapped.offset,
                    bytes_to_read: mapped.bytes,
                };
            }
        }
    }
}
