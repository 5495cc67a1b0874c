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

//! Additional-cluster hiding: extends a cover file's cluster chain with
//! otherwise-free clusters that hold payload. The directory entry's
//! `file_size` is never touched, so the cover file appears unchanged to
//! the host filesystem while the allocation table keeps the extra
//! clusters chained and off-limits to normal allocation.

use std::io::{Read, Write};

use fatstow_err::{Error, Result};
use fatstow_fat::{ChainNavigator, DirWalker, FatTable, Geometry};
use fatstow_io::BlockDevice;
use fatstow_sidecar::{HiddenFragment, Technique};
use log::debug;

pub struct AddClusterAllocator<'d, D: BlockDevice + ?Sized> {
    device: &'d D,
    geometry: Geometry,
    walker: DirWalker<'d, D>,
    table: FatTable<'d, D>,
}

impl<'d, D: BlockDevice + ?Sized> AddClusterAllocator<'d, D> {
    pub fn new(
        device: &'d D,
        geometry: Geometry,
        walker: DirWalker<'d, D>,
        table: FatTable<'d, D>,
    ) -> Self {
        Self {
            device,
            geometry,
            walker,
            table,
        }
    }

    /// Reserves `ceil(len / cluster_size)` free clusters, chains them
    /// after `cover_path`'s current tail, and writes `payload`
    /// sequentially into them. Leaves the cover file's directory entry
    /// untouched.
    pub fn write(&self, payload: &mut impl Read, cover_path: &str) -> Result<HiddenFragment> {
        let mut data = Vec::new();
        payload.read_to_end(&mut data)?;

        let entry = self.walker.resolve(self.walker.root_region(), cover_path)?;
        if entry.is_dir {
            return Err(Error::NotARegularFile(cover_path.to_string()));
        }

        let cluster_size = self.geometry.cluster_size as u64;
        let needed = (data.len() as u64).div_ceil(cluster_size) as usize;
        if needed == 0 {
            return Ok(HiddenFragment {
                technique: Technique::AddCluster,
                cover_path: cover_path.to_string(),
                clusters: Vec::new(),
                offset_in_first: 0,
                length_total: 0,
            });
        }

        let nav = ChainNavigator::new(self.table);
        let tail = nav.tail_cluster(entry.start_cluster)?;
        let new_clusters = nav.extend(tail, needed)?;

        let mut cursor = 0usize;
        for &cluster in &new_clusters {
            let offset = self.geometry.cluster_offset(cluster);
            let take = (cluster_size as usize).min(data.len() - cursor);
            self.device.write_at(offset, &data[cursor..cursor + take])?;
            cursor += take;
        }
        debug!(
            "extended {cover_path}'s chain by {} clusters, {} bytes hidden",
            new_clusters.len(),
            data.len()
        );

        Ok(HiddenFragment {
            technique: Technique::AddCluster,
            cover_path: cover_path.to_string(),
            clusters: new_clusters,
            offset_in_first: 0,
            length_total: data.len() as u64,
        })
    }

    /// Reads exactly the clusters named in `fragment`, skipping the
    /// cover file's pre-existing chain.
    pub fn read(&self, fragment: &HiddenFragment, sink: &mut impl Write) -> Result<()> {
        let cluster_size = self.geometry.cluster_size as u64;
        let mut remaining = fragment.length_total;
        for &cluster in &fragment.clusters {
            if remaining == 0 {
                break;
            }
            let offset = self.geometry.cluster_offset(cluster);
            let take = cluster_size.min(remaining) as usize;
            let mut buf = vec![0u8; take];
            self.device.read_at(offset, &mut buf)?;
            sink.write_all(&buf)?;
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Frees the clusters named in `fragment`, reconnects the cover
    /// file's original chain, and zeros the payload bytes. Fails with
    /// `CoverChainDiverged`, making no mutations, if the on-disk chain no
    /// longer ends with exactly `fragment.clusters` after the cover
    /// file's pre-hide tail, i.e. the cover file has since grown, or one
    /// of the added clusters has been reused.
    pub fn clear(&self, cover_path: &str, fragment: &HiddenFragment) -> Result<()> {
        if fragment.clusters.is_empty() {
            return Ok(());
        }

        let entry = self.walker.resolve(self.walker.root_region(), cover_path)?;
        let nav = ChainNavigator::new(self.table);
        let chain = nav.chain_of(entry.start_cluster)?;

        let added = &fragment.clusters;
        if chain.len() < added.len() {
            return Err(Error::CoverChainDiverged);
        }
        let prior_len = chain.len() - added.len();
        if prior_len == 0 || chain[prior_len..] != added[..] {
            return Err(Error::CoverChainDiverged);
        }

        nav.truncate(&chain, prior_len)?;

        let cluster_size = self.geometry.cluster_size as u64;
        let mut remaining = fragment.length_total;
        for &cluster in added {
            if remaining == 0 {
                break;
            }
            let offset = self.geometry.cluster_offset(cluster);
            let take = cluster_size.min(remaining) as usize;
            self.device.write_at(offset, &vec![0u8; take])?;
            remaining -= take as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatstow_fat::{AllocationEntry, FatVariant};
    use std::cell::RefCell;
    use std::io::Cursor;

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

    fn fat32_geometry(root_start: u64) -> Geometry {
        Geometry {
            sector_size: 512,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            fat_count: 2,
            sectors_per_fat: 32,
            root_entry_count: 0,
            total_sectors: 100_000,
            cluster_count: 90_000,
            variant: FatVariant::Fat32,
            fat_start: 32 * 512,
            root_dir_start: 0,
            data_region_start: root_start,
            cluster_size: 4096,
            root_cluster: 2,
        }
    }

    fn write_short_entry(buf: &mut [u8], name: &[u8; 11], attr: u8, cluster: u32, size: u32) {
        buf[0..11].copy_from_slice(name);
        buf[11] = attr;
        buf[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        buf[26..28].copy_from_slice(&((cluster & 0xFFFF) as u16).to_le_bytes());
        buf[28..32].copy_from_slice(&size.to_le_bytes());
    }

    // Root cluster 2, c.dat's chain [5 -> 7 -> EOC], lowest free is 42.
    fn setup() -> (MemDevice, Geometry) {
        let geometry = fat32_geometry(16 * 1024 * 1024);
        let image = vec![0u8; 64 * 1024 * 1024];
        let device = MemDevice(RefCell::new(image));
        let table = FatTable::new(&device, geometry);

        table.set(2, AllocationEntry::EndOfChain).unwrap(); // root directory, one cluster
        table.set(5, AllocationEntry::Next(7)).unwrap();
        table.set(7, AllocationEntry::EndOfChain).unwrap();
        for c in 3..42u32 {
            if c != 5 && c != 7 {
                table.set(c, AllocationEntry::Bad).unwrap();
            }
        }

        let root_offset = geometry.cluster_offset(2);
        write_short_entry(
            &mut device.0.borrow_mut()[root_offset as usize..],
            b"C       DAT",
            0x20,
            5,
            200,
        );
        (device, geometry)
    }

    #[test]
    fn write_extends_chain_and_preserves_file_size() {
        let (device, geometry) = setup();
        let table = FatTable::new(&device, geometry);
        let walker = DirWalker::new(&device, geometry, table);
        let allocator = AddClusterAllocator::new(&device, geometry, walker, table);

        let payload = vec![0x42u8; 5000];
        let fragment = allocator.write(&mut Cursor::new(payload.clone()), "/c.dat").unwrap();
        assert_eq!(fragment.clusters, vec![42, 43]);
        assert_eq!(fragment.length_total, 5000);

        let walker2 = DirWalker::new(&device, geometry, table);
        let entry = walker2.resolve(walker2.root_region(), "/c.dat").unwrap();
        assert_eq!(entry.file_size, 200, "directory entry size must be unchanged");

        let nav = ChainNavigator::new(table);
        assert_eq!(nav.chain_of(5).unwrap(), vec![5, 7, 42, 43]);

        let mut out = Vec::new();
        allocator.read(&fragment, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn clear_restores_chain_and_zeros_payload() {
        let (device, geometry) = setup();
        let table = FatTable::new(&device, geometry);
        let walker = DirWalker::new(&device, geometry, table);
        let allocator = AddClusterAllocator::new(&device, geometry, walker, table);

        let fragment = allocator
            .write(&mut Cursor::new(vec![0x99u8; 5000]), "/c.dat")
            .unwrap();

        allocator.clear("/c.dat", &fragment).unwrap();

        let nav = ChainNavigator::new(table);
        assert_eq!(nav.chain_of(5).unwrap(), vec![5, 7]);
        assert_eq!(table.get(42).unwrap(), AllocationEntry::Free);
        assert_eq!(table.get(43).unwrap(), AllocationEntry::Free);

        let offset = geometry.cluster_offset(42);
        let bytes = &device.0.borrow()[offset as usize..offset as usize + 5000];
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn clear_fails_when_cover_chain_has_grown() {
        let (device, geometry) = setup();
        let table = FatTable::new(&device, geometry);
        let walker = DirWalker::new(&device, geometry, table);
        let allocator = AddClusterAllocator::new(&device, geometry, walker, table);

        let fragment = allocator
            .write(&mut Cursor::new(vec![0x11u8; 5000]), "/c.dat")
            .unwrap();

        // Simulate the host growing the file by one more cluster after hiding.
        let nav = ChainNavigator::new(table);
        nav.extend(43, 1).unwrap();

        let before = device.0.borrow().clone();
        let err = allocator.clear("/c.dat", &fragment).unwrap_err();
        assert!(matches!(err, Error::CoverChainDiverged));
        assert_eq!(*device.0.borrow(), before);
    }
}
