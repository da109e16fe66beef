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

//! The buffer cache bridges every filesystem access to the block device.
//!
//! It holds [`config::CACHE_SLOTS`] fixed-size slots, replaced with a
//! second-chance clock algorithm, and keeps dirty slots durable via a
//! background write-behind thread in addition to an explicit [`BufferCache::close`].

use crate::{
    block::{BlockDevice, Sector},
    config::{CACHE_SLOTS, FLUSH_INTERVAL, SECTOR_SIZE},
    logging::{kdebug, kinfo},
};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// A single cache slot.
#[derive(Clone)]
struct CacheNode {
    /// The sector resident in this slot, if any.
    sector: Option<u32>,
    /// The cached contents.
    buffer: Sector,
    /// Set when `buffer` differs from what is on disk.
    dirty: bool,
    /// Second-chance clock bit.
    accessed: bool,
    /// Whether this slot currently holds a sector at all.
    in_use: bool,
}

impl CacheNode {
    const fn empty() -> Self {
        Self {
            sector: None,
            buffer: [0; SECTOR_SIZE],
            dirty: false,
            accessed: false,
            in_use: false,
        }
    }
}

struct Inner {
    slots: Vec<CacheNode>,
    /// Clock hand, advanced modulo `CACHE_SLOTS`.
    cursor: usize,
}

/// A 64-entry clock-replacement cache over a block device.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<Inner>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl BufferCache {
    /// Creates a cache over `device` and starts its write-behind thread.
    pub fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let inner = Mutex::new(Inner {
            slots: vec![CacheNode::empty(); CACHE_SLOTS],
            cursor: 0,
        });
        let cache = Arc::new(Self {
            device,
            inner,
            shutdown: Arc::new((Mutex::new(false), Condvar::new())),
            writer: Mutex::new(None),
        });
        let handle = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.writer_loop())
        };
        *cache.writer.lock().unwrap() = Some(handle);
        cache
    }

    /// Reads `length` bytes at `offset` within `sector` into `dst`.
    ///
    /// Requires `offset + length <= SECTOR_SIZE`.
    pub fn read(&self, sector: u32, dst: &mut [u8], offset: usize, length: usize) {
        assert!(offset + length <= SECTOR_SIZE);
        let mut inner = self.inner.lock().unwrap();
        let idx = self.locate_or_load(&mut inner, sector);
        let slot = &mut inner.slots[idx];
        dst[..length].copy_from_slice(&slot.buffer[offset..offset + length]);
        slot.accessed = true;
    }

    /// Writes `length` bytes from `src` at `offset` within `sector`.
    ///
    /// Requires `offset + length <= SECTOR_SIZE`. On a miss, the sector is
    /// first read in full so that bytes outside `[offset, offset+length)`
    /// are preserved.
    pub fn write(&self, sector: u32, src: &[u8], offset: usize, length: usize) {
        assert!(offset + length <= SECTOR_SIZE);
        let mut inner = self.inner.lock().unwrap();
        let idx = self.locate_or_load(&mut inner, sector);
        let slot = &mut inner.slots[idx];
        slot.buffer[offset..offset + length].copy_from_slice(&src[..length]);
        slot.dirty = true;
        slot.accessed = true;
    }

    /// Loads `sector` into the cache without copying it out, so a later
    /// `read`/`write` of the same sector is guaranteed to hit.
    pub fn prefetch(&self, sector: u32) {
        let mut inner = self.inner.lock().unwrap();
        let idx = self.locate_or_load(&mut inner, sector);
        inner.slots[idx].accessed = true;
    }

    /// Flushes every dirty slot and stops the background writer.
    ///
    /// After this returns, no slot is dirty and calling `read`/`write` again
    /// is legal but will no longer benefit from write-behind.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            self.flush_all(&mut inner);
        }
        let (lock, cv) = &*self.shutdown;
        *lock.lock().unwrap() = true;
        cv.notify_all();
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
        kinfo!("buffer cache closed");
    }

    /// Finds the slot holding `sector`, loading it from disk (possibly
    /// evicting a victim) if it is not already resident. Returns the slot
    /// index.
    fn locate_or_load(&self, inner: &mut Inner, sector: u32) -> usize {
        if let Some(idx) = inner
            .slots
            .iter()
            .position(|s| s.in_use && s.sector == Some(sector))
        {
            return idx;
        }
        let idx = self.find_victim(inner);
        let mut buf = [0; SECTOR_SIZE];
        self.device.read(sector, &mut buf);
        let slot = &mut inner.slots[idx];
        *slot = CacheNode {
            sector: Some(sector),
            buffer: buf,
            dirty: false,
            accessed: false,
            in_use: true,
        };
        kdebug!("cache miss on sector {sector}, loaded into slot {idx}");
        idx
    }

    /// Second-chance clock scan: advances the cursor modulo `CACHE_SLOTS`,
    /// clearing the accessed bit of any in-use slot it passes over, and
    /// picks the first slot that is either free or already unaccessed.
    /// Bounded to `2 * CACHE_SLOTS` steps.
    fn find_victim(&self, inner: &mut Inner) -> usize {
        let n = inner.slots.len();
        for _ in 0..2 * n {
            let idx = inner.cursor;
            inner.cursor = (inner.cursor + 1) % n;
            let slot = &mut inner.slots[idx];
            if !slot.in_use {
                return idx;
            }
            if slot.accessed {
                slot.accessed = false;
                continue;
            }
            self.flush_slot(slot);
            slot.in_use = false;
            return idx;
        }
        unreachable!("second-chance clock must find a victim within 2*CACHE_SLOTS steps")
    }

    fn flush_slot(&self, slot: &mut CacheNode) {
        if slot.dirty {
            if let Some(sector) = slot.sector {
                self.device.write(sector, &slot.buffer);
            }
            slot.dirty = false;
        }
    }

    fn flush_all(&self, inner: &mut Inner) {
        for slot in inner.slots.iter_mut() {
            if slot.in_use {
                self.flush_slot(slot);
            }
        }
    }

    fn writer_loop(self: Arc<Self>) {
        let (lock, cv) = &*self.shutdown;
        let mut guard = lock.lock().unwrap();
        loop {
            let (g, timeout) = cv.wait_timeout(guard, FLUSH_INTERVAL).unwrap();
            guard = g;
            if *guard {
                return;
            }
            if timeout.timed_out() {
                drop(guard);
                {
                    let mut inner = self.inner.lock().unwrap();
                    self.flush_all(&mut inner);
                }
                guard = lock.lock().unwrap();
            }
        }
    }
}
