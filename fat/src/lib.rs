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

//! FAT12/16/32 on-disk model: bootsector geometry, the packed allocation
//! table, directory enumeration, and cluster-chain traversal.
//!
//! [`FatFileSystem`] is the entry point: it decodes geometry once at
//! `open` and then hands out [`FatTable`], [`DirWalker`], and
//! [`ChainNavigator`] views that all share it.

pub mod boot_sector;
pub mod chain;
pub mod dir;
pub mod table;

pub use boot_sector::{FatVariant, Geometry};
pub use chain::ChainNavigator;
pub use dir::{DirEntryInfo, DirRegion, DirWalker};
pub use table::{AllocationEntry, FatTable};

use fatstow_err::Result;
use fatstow_io::BlockDevice;

pub struct FatFileSystem<'d, D: BlockDevice + ?Sized> {
    device: &'d D,
    geometry: Geometry,
}

impl<'d, D: BlockDevice + ?Sized> FatFileSystem<'d, D> {
    /// Probes `device`'s boot sector and decodes its geometry. Read-only:
    /// nothing is written during open.
    pub fn open(device: &'d D) -> Result<Self> {
        let len = device.len()?;
        let mut sector0 = vec![0u8; 512];
        device.read_at(0, &mut sector0)?;
        let geometry = Geometry::decode(len, &sector0)?;
        Ok(Self { device, geometry })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn table(&self) -> FatTable<'d, D> {
        FatTable::new(self.device, self.geometry)
    }

    pub fn dir_walker(&self) -> DirWalker<'d, D> {
        DirWalker::new(self.device, self.geometry, self.table())
    }

    pub fn chain_navigator(&self) -> ChainNavigator<'d, D> {
        ChainNavigator::new(self.table())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MemDevice(RefCell<Vec<u8>>);

    impl BlockDevice for MemDevice {
        fn len(&self) -> Result<u64> {
            Ok(self.0.borrow().len() as u64)
        }
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let data = self.0.borrow();
            let offset = offset as usize;
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
            Ok(())
        }
        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            let mut data = self.0.borrow_mut();
            let offset = offset as usize;
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    fn minimal_fat12_image() -> Vec<u8> {
        let mut image = vec![0u8; 100 * 512];
        image[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        image[0x0D] = 1;
        image[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes());
        image[0x10] = 1;
        image[0x11..0x13].copy_from_slice(&16u16.to_le_bytes());
        image[0x13..0x15].copy_from_slice(&100u16.to_le_bytes());
        image[0x16..0x18].copy_from_slice(&1u16.to_le_bytes());
        image
    }

    #[test]
    fn open_decodes_geometry_and_hands_out_shared_views() {
        let device = MemDevice(RefCell::new(minimal_fat12_image()));
        let fs = FatFileSystem::open(&device).unwrap();
        assert_eq!(fs.geometry().variant, FatVariant::Fat12);

        let table = fs.table();
        table.set(2, AllocationEntry::EndOfChain).unwrap();
        // Other views constructed afterwards see the write through the
        // shared device.
        assert_eq!(fs.table().get(2).unwrap(), AllocationEntry::EndOfChain);

        let walker = fs.dir_walker();
        assert!(walker.list(walker.root_region()).unwrap().is_empty());
    }
}
