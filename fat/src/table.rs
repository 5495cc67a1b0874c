// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Packed allocation-table entries, in all three bit widths, with mirrored
//! writes across every FAT copy.

use fatstow_err::{Error, Result};
use fatstow_io::BlockDevice;
use log::error;

use crate::boot_sector::{FatVariant, Geometry};

/// A decoded allocation-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationEntry {
    Free,
    Reserved,
    Bad,
    EndOfChain,
    Next(u32),
}

/// Reads and writes allocation-table entries for one mounted image.
///
/// Every write goes to all `geometry.fat_count` copies and is read back to
/// confirm they agree; a copy that doesn't match is reported as
/// [`Error::FatMirrorInconsistent`] rather than silently trusted.
pub struct FatTable<'d, D: BlockDevice + ?Sized> {
    device: &'d D,
    geometry: Geometry,
}

// Derived `Clone`/`Copy` would add a spurious `D: Clone`/`D: Copy` bound;
// the struct only ever holds a reference to the device.
impl<'d, D: BlockDevice + ?Sized> Clone for FatTable<'d, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'d, D: BlockDevice + ?Sized> Copy for FatTable<'d, D> {}

impl<'d, D: BlockDevice + ?Sized> FatTable<'d, D> {
    pub fn new(device: &'d D, geometry: Geometry) -> Self {
        Self { device, geometry }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn fat_copy_offset(&self, fat_index: u8) -> u64 {
        self.geometry.fat_start
            + fat_index as u64 * self.geometry.sectors_per_fat as u64 * self.geometry.sector_size as u64
    }

    fn read_raw(&self, fat_index: u8, cluster: u32) -> Result<u32> {
        let base = self.fat_copy_offset(fat_index);
        match self.geometry.variant {
            FatVariant::Fat12 => {
                let byte_off = base + 3 * (cluster as u64 / 2);
                let mut buf = [0u8; 2];
                self.device.read_at(byte_off, &mut buf)?;
                let raw = u16::from_le_bytes(buf) as u32;
                Ok(if cluster % 2 == 0 { raw & 0x0FFF } else { raw >> 4 })
            }
            FatVariant::Fat16 => {
                let byte_off = base + 2 * cluster as u64;
                let mut buf = [0u8; 2];
                self.device.read_at(byte_off, &mut buf)?;
                Ok(u16::from_le_bytes(buf) as u32)
            }
            FatVariant::Fat32 => {
                let byte_off = base + 4 * cluster as u64;
                let mut buf = [0u8; 4];
                self.device.read_at(byte_off, &mut buf)?;
                Ok(u32::from_le_bytes(buf) & 0x0FFF_FFFF)
            }
        }
    }

    /// Read-modify-write: FAT12 packs two entries per three bytes, and
    /// FAT32's top nibble is reserved, so both need the existing byte(s)
    /// to avoid clobbering a neighbor.
    fn write_raw(&self, fat_index: u8, cluster: u32, value: u32) -> Result<()> {
        let base = self.fat_copy_offset(fat_index);
        match self.geometry.variant {
            FatVariant::Fat12 => {
                let byte_off = base + 3 * (cluster as u64 / 2);
                let mut buf = [0u8; 2];
                self.device.read_at(byte_off, &mut buf)?;
                let existing = u16::from_le_bytes(buf);
                let new_raw = if cluster % 2 == 0 {
                    (existing & 0xF000) | (value as u16 & 0x0FFF)
                } else {
                    (existing & 0x000F) | ((value as u16 & 0x0FFF) << 4)
                };
                self.device.write_at(byte_off, &new_raw.to_le_bytes())
            }
            FatVariant::Fat16 => {
                let byte_off = base + 2 * cluster as u64;
                self.device.write_at(byte_off, &(value as u16).to_le_bytes())
            }
            FatVariant::Fat32 => {
                let byte_off = base + 4 * cluster as u64;
                let mut buf = [0u8; 4];
                self.device.read_at(byte_off, &mut buf)?;
                let existing = u32::from_le_bytes(buf);
                let new_raw = (existing & 0xF000_0000) | (value & 0x0FFF_FFFF);
                self.device.write_at(byte_off, &new_raw.to_le_bytes())
            }
        }
    }

    fn bad_marker(&self) -> u32 {
        match self.geometry.variant {
            FatVariant::Fat12 => 0x0FF7,
            FatVariant::Fat16 => 0xFFF7,
            FatVariant::Fat32 => 0x0FFF_FFF7,
        }
    }

    fn eoc_marker(&self) -> u32 {
        match self.geometry.variant {
            FatVariant::Fat12 => 0x0FFF,
            FatVariant::Fat16 => 0xFFFF,
            FatVariant::Fat32 => 0x0FFF_FFFF,
        }
    }

    fn eoc_min(&self) -> u32 {
        match self.geometry.variant {
            FatVariant::Fat12 => 0x0FF8,
            FatVariant::Fat16 => 0xFFF8,
            FatVariant::Fat32 => 0x0FFF_FFF8,
        }
    }

    fn classify(&self, raw: u32) -> AllocationEntry {
        if raw == 0 {
            AllocationEntry::Free
        } else if raw == 1 {
            AllocationEntry::Reserved
        } else if raw == self.bad_marker() {
            AllocationEntry::Bad
        } else if raw >= self.eoc_min() {
            AllocationEntry::EndOfChain
        } else {
            AllocationEntry::Next(raw)
        }
    }

    fn marker_value(&self, entry: AllocationEntry) -> u32 {
        match entry {
            AllocationEntry::Free => 0,
            AllocationEntry::Reserved => 1,
            AllocationEntry::Bad => self.bad_marker(),
            AllocationEntry::EndOfChain => self.eoc_marker(),
            AllocationEntry::Next(n) => n,
        }
    }

    /// Reads `cluster`'s entry from the first FAT copy.
    pub fn get(&self, cluster: u32) -> Result<AllocationEntry> {
        let raw = self.read_raw(0, cluster)?;
        Ok(self.classify(raw))
    }

    /// Writes `cluster`'s entry to every FAT copy and verifies they agree.
    pub fn set(&self, cluster: u32, entry: AllocationEntry) -> Result<()> {
        let value = self.marker_value(entry);
        for fat_index in 0..self.geometry.fat_count {
            if let Err(e) = self.write_raw(fat_index, cluster, value) {
                error!("failed writing FAT copy {fat_index} for cluster {cluster}: {e}");
                let source = match e {
                    Error::IoFailed(io) => io,
                    other => std::io::Error::other(other.to_string()),
                };
                return Err(Error::FatWriteFailed { cluster, source });
            }
        }
        for fat_index in 0..self.geometry.fat_count {
            let raw = self.read_raw(fat_index, cluster)?;
            if raw != value {
                error!("FAT copy {fat_index} diverged from copy 0 at cluster {cluster}");
                return Err(Error::FatMirrorInconsistent { cluster });
            }
        }
        Ok(())
    }

    /// Lazily walks every data cluster in ascending order, yielding the
    /// free ones. A fresh call produces a fresh iterator; nothing here is
    /// cached across calls.
    pub fn iter_free(&self) -> impl Iterator<Item = Result<u32>> + '_ {
        (2..self.geometry.cluster_count as u32 + 2).filter_map(move |cluster| {
            match self.get(cluster) {
                Ok(AllocationEntry::Free) => Some(Ok(cluster)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })
    }

    /// Collects the first `k` free cluster ids in ascending order, or
    /// reports how many were actually available.
    pub fn find_n_free(&self, k: usize) -> Result<Vec<u32>> {
        let mut found = Vec::with_capacity(k);
        for cluster in self.iter_free() {
            found.push(cluster?);
            if found.len() == k {
                return Ok(found);
            }
        }
        Err(Error::OutOfSpace {
            needed: k,
            available: found.len(),
        })
    }
}
