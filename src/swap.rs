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

//! The swap device: a bitmap of fixed-size slots, each holding exactly one
//! evicted user page.

use crate::{
    block::{BlockDevice, Sector},
    config::{PAGE_SIZE, SECTORS_PER_SLOT, SECTOR_SIZE},
    error::{KResult, KernelError},
};
use std::sync::{Arc, Mutex};

/// The index of a slot within the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot(pub u32);

/// A bitmap-indexed store of fixed `PAGE_SIZE` slots over a block device.
pub struct Swap {
    device: Arc<dyn BlockDevice>,
    used: Mutex<Vec<bool>>,
}

impl Swap {
    /// Creates a swap store over `device`, whose sector count must be a
    /// multiple of [`SECTORS_PER_SLOT`].
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = device.size() as usize / SECTORS_PER_SLOT;
        Self {
            device,
            used: Mutex::new(vec![false; slot_count]),
        }
    }

    /// Total number of slots this device can hold.
    pub fn capacity(&self) -> usize {
        self.used.lock().unwrap().len()
    }

    /// Writes `page` (exactly `PAGE_SIZE` bytes) to a freshly allocated slot.
    pub fn save(&self, page: &[u8]) -> KResult<SwapSlot> {
        assert_eq!(page.len(), PAGE_SIZE);
        let slot = {
            let mut used = self.used.lock().unwrap();
            let idx = used
                .iter()
                .position(|&b| !b)
                .ok_or(KernelError::SwapExhausted)?;
            used[idx] = true;
            idx as u32
        };
        for (i, chunk) in page.chunks(SECTOR_SIZE).enumerate() {
            let mut buf: Sector = [0; SECTOR_SIZE];
            buf.copy_from_slice(chunk);
            self.device.write(slot * SECTORS_PER_SLOT as u32 + i as u32, &buf);
        }
        Ok(SwapSlot(slot))
    }

    /// Reads the page held in `slot` into `dst` (exactly `PAGE_SIZE` bytes),
    /// without freeing the slot.
    pub fn load(&self, slot: SwapSlot, dst: &mut [u8]) {
        assert_eq!(dst.len(), PAGE_SIZE);
        assert!(self.used.lock().unwrap()[slot.0 as usize], "loading a free swap slot");
        for (i, chunk) in dst.chunks_mut(SECTOR_SIZE).enumerate() {
            let mut buf: Sector = [0; SECTOR_SIZE];
            self.device.read(slot.0 * SECTORS_PER_SLOT as u32 + i as u32, &mut buf);
            chunk.copy_from_slice(&buf);
        }
    }

    /// Frees `slot` without reading it back. Used both after a successful
    /// swap-in and when a process exits with pages still on swap.
    pub fn discard(&self, slot: SwapSlot) {
        let mut used = self.used.lock().unwrap();
        assert!(used[slot.0 as usize], "discarding an already-free swap slot");
        used[slot.0 as usize] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemBlockDevice;

    fn fixture(slots: u32) -> Swap {
        let dev = Arc::new(MemBlockDevice::new(slots * SECTORS_PER_SLOT as u32));
        Swap::new(dev)
    }

    #[test]
    fn save_then_load_round_trips() {
        let swap = fixture(4);
        let page = [0x7Eu8; PAGE_SIZE];
        let slot = swap.save(&page).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        swap.load(slot, &mut out);
        assert_eq!(&out[..], &page[..]);
    }

    #[test]
    fn discard_frees_the_slot_for_reuse() {
        let swap = fixture(1);
        let page = [1u8; PAGE_SIZE];
        let slot = swap.save(&page).unwrap();
        assert_eq!(swap.save(&page).unwrap_err(), KernelError::SwapExhausted);
        swap.discard(slot);
        let slot2 = swap.save(&page).unwrap();
        assert_eq!(slot2, slot);
    }

    #[test]
    fn exhausted_device_errors_instead_of_panicking() {
        let swap = fixture(2);
        let page = [0u8; PAGE_SIZE];
        swap.save(&page).unwrap();
        swap.save(&page).unwrap();
        assert_eq!(swap.save(&page).unwrap_err(), KernelError::SwapExhausted);
    }

    #[test]
    #[should_panic(expected = "loading a free swap slot")]
    fn loading_a_free_slot_panics() {
        let swap = fixture(1);
        let mut out = [0u8; PAGE_SIZE];
        swap.load(SwapSlot(0), &mut out);
    }
}
