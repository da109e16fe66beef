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

//! On-disk indexed files with one-level indirect addressing and transparent
//! growth.
//!
//! Each inode occupies exactly one sector (§6's bit-exact layout). Data is
//! reached through up to [`config::INDIRECT_COUNT`] indirect blocks, each one
//! sector holding [`config::SECTORS_PER_INDIRECT`] data-sector numbers.

use crate::{
    cache::BufferCache,
    config::{
        INDIRECT_COUNT, INODE_MAGIC, SECTORS_PER_INDIRECT, SECTOR_SIZE, UNUSED_SECTOR,
    },
    error::{KResult, KernelError},
    freemap::FreeMap,
    logging::kwarn,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The fixed-size on-disk representation of an inode (§6).
#[derive(Clone)]
struct DiskInode {
    indirect: [u16; INDIRECT_COUNT],
    length: u32,
    is_dir: bool,
    parent_dir_sector: u16,
}

impl DiskInode {
    fn empty(is_dir: bool, parent_dir_sector: u16) -> Self {
        Self {
            indirect: [UNUSED_SECTOR; INDIRECT_COUNT],
            length: 0,
            is_dir,
            parent_dir_sector,
        }
    }

    fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        let mut off = 0;
        for &s in &self.indirect {
            buf[off..off + 2].copy_from_slice(&s.to_le_bytes());
            off += 2;
        }
        buf[off..off + 4].copy_from_slice(&self.length.to_le_bytes());
        off += 4;
        buf[off] = self.is_dir as u8;
        off += 1;
        buf[off..off + 2].copy_from_slice(&self.parent_dir_sector.to_le_bytes());
        off += 2;
        buf[off..off + 4].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; SECTOR_SIZE]) -> KResult<Self> {
        let mut off = 0;
        let mut indirect = [0u16; INDIRECT_COUNT];
        for s in indirect.iter_mut() {
            *s = u16::from_le_bytes([buf[off], buf[off + 1]]);
            off += 2;
        }
        let length = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let is_dir = buf[off] != 0;
        off += 1;
        let parent_dir_sector = u16::from_le_bytes([buf[off], buf[off + 1]]);
        off += 2;
        let magic = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        if magic != INODE_MAGIC {
            return Err(KernelError::CorruptInode);
        }
        Ok(Self {
            indirect,
            length,
            is_dir,
            parent_dir_sector,
        })
    }

    fn num_data_sectors(length: u32) -> usize {
        (length as usize).div_ceil(SECTOR_SIZE)
    }
}

struct InodeInner {
    disk: DiskInode,
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
}

/// An in-memory, reference-counted handle to a file or directory's inode.
pub struct Inode {
    sector: u32,
    cache: Arc<BufferCache>,
    free_map: Arc<dyn FreeMap>,
    inner: Mutex<InodeInner>,
}

impl Inode {
    /// The sector this inode lives at on disk.
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// The file's length in bytes.
    pub fn length(&self) -> u32 {
        self.inner.lock().unwrap().disk.length
    }

    /// Whether this inode represents a directory.
    pub fn is_dir(&self) -> bool {
        self.inner.lock().unwrap().disk.is_dir
    }

    /// The sector of this inode's parent directory.
    pub fn parent_dir_sector(&self) -> u16 {
        self.inner.lock().unwrap().disk.parent_dir_sector
    }

    /// Marks the inode as denying writes (used to protect a running
    /// executable image).
    pub fn deny_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.deny_write_count += 1;
        debug_assert!(inner.deny_write_count <= inner.open_count);
    }

    /// Reverses one [`Inode::deny_write`] call.
    pub fn allow_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.deny_write_count > 0);
        inner.deny_write_count -= 1;
    }

    /// Marks the inode for deletion: its blocks are released once the last
    /// opener closes it.
    pub fn remove(&self) {
        self.inner.lock().unwrap().removed = true;
    }

    fn byte_to_sector(disk: &DiskInode, pos: usize) -> u32 {
        let data_index = pos / SECTOR_SIZE;
        let indirect_index = data_index / SECTORS_PER_INDIRECT;
        assert!(indirect_index < INDIRECT_COUNT, "position past max file size");
        let indirect_sector = disk.indirect[indirect_index];
        assert_ne!(indirect_sector, UNUSED_SECTOR, "read past an unallocated indirect block");
        indirect_sector as u32
    }

    fn data_sector_at(&self, disk: &DiskInode, pos: usize) -> u32 {
        let indirect_sector = Self::byte_to_sector(disk, pos);
        let block = read_indirect_block(&self.cache, indirect_sector);
        let slot = (pos / SECTOR_SIZE) % SECTORS_PER_INDIRECT;
        let data_sector = block[slot];
        assert_ne!(data_sector, UNUSED_SECTOR, "read past an unallocated data sector");
        data_sector as u32
    }

    /// Reads up to `size` bytes starting at `offset`, stopping at EOF.
    /// Returns the number of bytes actually read.
    pub fn read_at(&self, dst: &mut [u8], size: usize, offset: usize) -> usize {
        let inner = self.inner.lock().unwrap();
        let length = inner.disk.length as usize;
        if offset >= length {
            return 0;
        }
        let size = size.min(length - offset);
        let mut read = 0;
        while read < size {
            let pos = offset + read;
            let sector_offset = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_offset).min(size - read);
            let sector = self.data_sector_at(&inner.disk, pos);
            self.cache
                .read(sector, &mut dst[read..read + chunk], sector_offset, chunk);
            read += chunk;
        }
        read
    }

    /// Writes `size` bytes from `src` starting at `offset`, growing the file
    /// if `offset + size` exceeds the current length.
    ///
    /// Returns `0` without writing anything while the inode denies writes.
    /// On a partial-allocation failure during growth, every sector obtained
    /// during this call is released and `Err(OutOfDisk)` is returned: the
    /// file is left exactly as it was before the call.
    pub fn write_at(&self, src: &[u8], size: usize, offset: usize) -> KResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.deny_write_count > 0 {
            return Ok(0);
        }
        let needed_length = (offset + size) as u32;
        if needed_length > inner.disk.length {
            self.grow(&mut inner, needed_length)?;
        }
        let mut written = 0;
        while written < size {
            let pos = offset + written;
            let sector_offset = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_offset).min(size - written);
            let sector = self.data_sector_at(&inner.disk, pos);
            self.cache
                .write(sector, &src[written..written + chunk], sector_offset, chunk);
            written += chunk;
        }
        Ok(written)
    }

    /// Allocates whatever indirect/data sectors are missing to cover
    /// `new_length`, rolling back everything it allocated on failure.
    fn grow(&self, inner: &mut InodeInner, new_length: u32) -> KResult<()> {
        let mut allocated: Vec<u32> = Vec::new();
        if let Err(e) = allocate_growth(&self.cache, &*self.free_map, inner, new_length, &mut allocated) {
            for sector in allocated {
                self.free_map.release(sector, 1);
            }
            return Err(e);
        }
        inner.disk.length = new_length;
        self.write_disk_inode(&inner.disk);
        Ok(())
    }

    fn write_disk_inode(&self, disk: &DiskInode) {
        self.cache.write(self.sector, &disk.to_bytes(), 0, SECTOR_SIZE);
    }

    /// Releases every indirect and data sector reachable from this inode,
    /// then the inode sector itself. Called only once, by the table, when
    /// the last opener of a removed inode closes it.
    fn release_blocks(&self) {
        let inner = self.inner.lock().unwrap();
        let n_data = DiskInode::num_data_sectors(inner.disk.length);
        let n_indirect = n_data.div_ceil(SECTORS_PER_INDIRECT);
        for indirect_index in 0..n_indirect {
            let indirect_sector = inner.disk.indirect[indirect_index];
            if indirect_sector == UNUSED_SECTOR {
                continue;
            }
            let block = read_indirect_block(&self.cache, indirect_sector as u32);
            let in_this_block = (n_data - indirect_index * SECTORS_PER_INDIRECT)
                .min(SECTORS_PER_INDIRECT);
            for &data_sector in &block[..in_this_block] {
                if data_sector != UNUSED_SECTOR {
                    self.free_map.release(data_sector as u32, 1);
                }
            }
            self.free_map.release(indirect_sector as u32, 1);
        }
        self.free_map.release(self.sector, 1);
    }
}

fn read_indirect_block(cache: &BufferCache, indirect_sector: u32) -> [u16; SECTORS_PER_INDIRECT] {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(indirect_sector, &mut buf, 0, SECTOR_SIZE);
    let mut out = [0u16; SECTORS_PER_INDIRECT];
    for (i, s) in out.iter_mut().enumerate() {
        *s = u16::from_le_bytes([buf[i * 2], buf[i * 2 + 1]]);
    }
    out
}

fn write_indirect_block(cache: &BufferCache, sector: u32, block: &[u16; SECTORS_PER_INDIRECT]) {
    let mut buf = [0u8; SECTOR_SIZE];
    for (i, &s) in block.iter().enumerate() {
        buf[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
    }
    cache.write(sector, &buf, 0, SECTOR_SIZE);
}

/// Allocates whatever indirect/data sectors are missing to cover
/// `new_length` starting from `inner`'s current length, recording every
/// newly-allocated sector in `allocated` so the caller can roll back on
/// failure. Does not update `inner.disk.length` itself.
fn allocate_growth(
    cache: &BufferCache,
    free_map: &dyn FreeMap,
    inner: &mut InodeInner,
    new_length: u32,
    allocated: &mut Vec<u32>,
) -> KResult<()> {
    let old_sectors = DiskInode::num_data_sectors(inner.disk.length);
    let new_sectors = DiskInode::num_data_sectors(new_length);
    for data_index in old_sectors..new_sectors {
        let indirect_index = data_index / SECTORS_PER_INDIRECT;
        let slot = data_index % SECTORS_PER_INDIRECT;
        if indirect_index >= INDIRECT_COUNT {
            return Err(KernelError::OutOfDisk);
        }
        if inner.disk.indirect[indirect_index] == UNUSED_SECTOR {
            let indirect_sector = free_map.allocate(1).ok_or(KernelError::OutOfDisk)?;
            allocated.push(indirect_sector);
            inner.disk.indirect[indirect_index] = indirect_sector as u16;
            let empty = [UNUSED_SECTOR; SECTORS_PER_INDIRECT];
            write_indirect_block(cache, indirect_sector, &empty);
        }
        let indirect_sector = inner.disk.indirect[indirect_index] as u32;
        let data_sector = free_map.allocate(1).ok_or(KernelError::OutOfDisk)?;
        allocated.push(data_sector);
        cache.write(data_sector, &[0u8; SECTOR_SIZE], 0, SECTOR_SIZE);
        let mut block = read_indirect_block(cache, indirect_sector);
        block[slot] = data_sector as u16;
        write_indirect_block(cache, indirect_sector, &block);
    }
    Ok(())
}

/// The process-wide table of in-memory inodes, reference-counted by sector.
pub struct InodeTable {
    cache: Arc<BufferCache>,
    free_map: Arc<dyn FreeMap>,
    open: Mutex<HashMap<u32, Arc<Inode>>>,
}

impl InodeTable {
    /// Creates an empty table over the given cache and free map.
    pub fn new(cache: Arc<BufferCache>, free_map: Arc<dyn FreeMap>) -> Self {
        Self {
            cache,
            free_map,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Writes a fresh, zero-length-extended inode to `sector`: a zeroed disk
    /// inode, followed by allocation of every indirect and data sector
    /// needed for `length` bytes. On partial-allocation failure, every
    /// sector obtained during this call (other than `sector` itself, which
    /// the caller owns) is released.
    pub fn create(
        &self,
        sector: u32,
        length: u32,
        is_dir: bool,
        parent_sector: u16,
    ) -> KResult<()> {
        let disk = DiskInode::empty(is_dir, parent_sector);
        self.cache.write(sector, &disk.to_bytes(), 0, SECTOR_SIZE);
        let mut inner = InodeInner {
            disk,
            open_count: 0,
            removed: false,
            deny_write_count: 0,
        };
        let mut allocated = Vec::new();
        if let Err(e) =
            allocate_growth(&self.cache, &*self.free_map, &mut inner, length, &mut allocated)
        {
            for sector in allocated {
                self.free_map.release(sector, 1);
            }
            return Err(e);
        }
        inner.disk.length = length;
        self.cache.write(sector, &inner.disk.to_bytes(), 0, SECTOR_SIZE);
        Ok(())
    }

    /// Returns the canonical in-memory inode for `sector`, creating it (by
    /// reading the on-disk inode through the cache) the first time it is
    /// opened.
    pub fn open(&self, sector: u32) -> KResult<Arc<Inode>> {
        let mut open = self.open.lock().unwrap();
        if let Some(existing) = open.get(&sector) {
            existing.inner.lock().unwrap().open_count += 1;
            return Ok(existing.clone());
        }
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut buf, 0, SECTOR_SIZE);
        let disk = DiskInode::from_bytes(&buf)?;
        let inode = Arc::new(Inode {
            sector,
            cache: self.cache.clone(),
            free_map: self.free_map.clone(),
            inner: Mutex::new(InodeInner {
                disk,
                open_count: 1,
                removed: false,
                deny_write_count: 0,
            }),
        });
        open.insert(sector, inode.clone());
        Ok(inode)
    }

    /// Closes one reference to `inode`. Once the last opener closes a
    /// removed inode, its blocks are released back to the free map.
    pub fn close(&self, inode: &Arc<Inode>) {
        let mut open = self.open.lock().unwrap();
        let (should_remove, release) = {
            let mut inner = inode.inner.lock().unwrap();
            assert!(inner.open_count > 0);
            inner.open_count -= 1;
            (inner.open_count == 0, inner.open_count == 0 && inner.removed)
        };
        if should_remove {
            open.remove(&inode.sector());
        }
        if release {
            kwarn!("releasing blocks of removed inode at sector {}", inode.sector());
            inode.release_blocks();
        }
    }

    /// Number of inodes currently resident in the table (test/diagnostic
    /// use: the distilled spec's invariant 3 requires exactly one entry per
    /// live inode).
    pub fn resident_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }
}
