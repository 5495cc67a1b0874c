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

//! The BIOS Parameter Block and the geometry derived from it.
//!
//! Majority of the field meanings here are sourced from the Microsoft FAT32
//! File System Specification; offsets are given relative to the start of
//! the boot sector.

use fatstow_err::{Error, Result};
use log::error;

/// Which of the three FAT flavors an image uses. Selected from the
/// sector-per-FAT-16 field and, when that's ambiguous, from the resulting
/// cluster count (see [`Geometry::decode`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

/// Everything downstream code needs to translate cluster ids into byte
/// offsets and to know how wide allocation-table entries are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u32,
    pub fat_count: u8,
    pub sectors_per_fat: u32,
    /// Count of 32-byte root directory entries; 0 for FAT32, whose root
    /// directory lives in the data region at `root_cluster` instead.
    pub root_entry_count: u32,
    pub total_sectors: u64,
    pub cluster_count: u64,
    pub variant: FatVariant,

    /// Byte offset of the first FAT copy.
    pub fat_start: u64,
    /// Byte offset of the fixed-size root directory region (FAT12/16 only).
    pub root_dir_start: u64,
    /// Byte offset of cluster 2.
    pub data_region_start: u64,
    pub cluster_size: u32,
    /// Cluster of the root directory (FAT32 only; 0 otherwise).
    pub root_cluster: u32,
}

const VALID_SECTOR_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

impl Geometry {
    /// Decodes geometry from `sector0`, the first sector of the image, and
    /// validates it against `image_len`.
    ///
    /// `sector0` must be at least 512 bytes; every BPB field used here lives
    /// within the first 0x30 bytes regardless of the sector's actual size.
    pub fn decode(image_len: u64, sector0: &[u8]) -> Result<Self> {
        if sector0.len() < 512 {
            return Err(Error::InvalidGeometry(
                "boot sector shorter than 512 bytes".into(),
            ));
        }

        let le16 = |off: usize| u16::from_le_bytes([sector0[off], sector0[off + 1]]);
        let le32 = |off: usize| u32::from_le_bytes(sector0[off..off + 4].try_into().unwrap());

        // exFAT's boot sector reuses bytes [0, 11) of the jump/OEM-name
        // fields for a fixed "EXFAT   " signature instead of a BPB; every
        // other field this decoder reads would be misinterpreted garbage,
        // so this is rejected explicitly rather than silently parsed as
        // (invalid) FAT32 geometry.
        if &sector0[3..11] == b"EXFAT   " {
            error!("boot sector carries the exFAT signature, not a supported FAT variant");
            return Err(Error::UnsupportedVariant);
        }

        let sector_size = le16(0x0B) as u32;
        if !VALID_SECTOR_SIZES.contains(&sector_size) {
            error!("sector size {sector_size} is not one of 512/1024/2048/4096");
            return Err(Error::InvalidGeometry(format!(
                "sector size {sector_size} is not one of 512/1024/2048/4096"
            )));
        }

        let sectors_per_cluster = sector0[0x0D];
        if sectors_per_cluster == 0
            || !sectors_per_cluster.is_power_of_two()
            || sectors_per_cluster > 128
        {
            error!("sectors per cluster {sectors_per_cluster} is not a power of two in [1, 128]");
            return Err(Error::InvalidGeometry(format!(
                "sectors per cluster {sectors_per_cluster} is not a power of two in [1, 128]"
            )));
        }

        let reserved_sectors = le16(0x0E) as u32;
        let fat_count = sector0[0x10];
        let root_entry_count_16 = le16(0x11) as u32;
        let total_sectors_16 = le16(0x13) as u32;
        let sectors_per_fat_16 = le16(0x16) as u32;
        let total_sectors_32 = le32(0x20);
        let sectors_per_fat_32 = le32(0x24);
        let root_cluster_32 = le32(0x2C);

        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16 as u64
        } else {
            total_sectors_32 as u64
        };

        let (is_fat32, sectors_per_fat, root_entry_count, root_cluster) = if sectors_per_fat_16 == 0
        {
            (true, sectors_per_fat_32, 0u32, root_cluster_32)
        } else {
            (false, sectors_per_fat_16, root_entry_count_16, 0u32)
        };

        let root_dir_start =
            (reserved_sectors as u64 + fat_count as u64 * sectors_per_fat as u64) * sector_size as u64;
        let data_region_start = root_dir_start + root_entry_count as u64 * 32;

        if data_region_start > image_len {
            error!("data region start {data_region_start} exceeds image length {image_len}");
            return Err(Error::InvalidGeometry(format!(
                "data region start {data_region_start} exceeds image length {image_len}"
            )));
        }

        let first_data_sector = data_region_start / sector_size as u64;
        let cluster_count = total_sectors
            .saturating_sub(first_data_sector)
            / sectors_per_cluster as u64;

        let variant = if is_fat32 {
            FatVariant::Fat32
        } else if cluster_count < 4085 {
            FatVariant::Fat12
        } else if cluster_count < 65525 {
            FatVariant::Fat16
        } else {
            FatVariant::Fat32
        };

        Ok(Self {
            sector_size,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            sectors_per_fat,
            root_entry_count,
            total_sectors,
            cluster_count,
            variant,
            fat_start: reserved_sectors as u64 * sector_size as u64,
            root_dir_start,
            data_region_start,
            cluster_size: sectors_per_cluster as u32 * sector_size,
            root_cluster,
        })
    }

    /// Byte offset of `cluster` (cluster ids start at 2).
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_region_start + (cluster as u64 - 2) * self.cluster_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_fat12_sector0() -> Vec<u8> {
        // 512B sectors, 1 sector/cluster, 1 reserved sector, 1 FAT,
        // 16 root entries, tiny FAT region -> comfortably under the
        // FAT12 cluster-count threshold.
        let mut s = vec![0u8; 512];
        s[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        s[0x0D] = 1; // sectors per cluster
        s[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes()); // reserved sectors
        s[0x10] = 1; // fat count
        s[0x11..0x13].copy_from_slice(&16u16.to_le_bytes()); // root entries
        s[0x13..0x15].copy_from_slice(&100u16.to_le_bytes()); // total sectors
        s[0x16..0x18].copy_from_slice(&1u16.to_le_bytes()); // sectors per fat (16-bit, nonzero -> not fat32)
        s
    }

    #[test]
    fn decodes_fat12_variant() {
        let sector0 = minimal_fat12_sector0();
        let geo = Geometry::decode(100 * 512, &sector0).unwrap();
        assert_eq!(geo.variant, FatVariant::Fat12);
        assert_eq!(geo.sector_size, 512);
        assert_eq!(geo.cluster_size, 512);
    }

    #[test]
    fn rejects_bad_sector_size() {
        let mut sector0 = minimal_fat12_sector0();
        sector0[0x0B..0x0D].copy_from_slice(&600u16.to_le_bytes());
        assert!(matches!(
            Geometry::decode(100 * 512, &sector0),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_non_power_of_two_cluster_size() {
        let mut sector0 = minimal_fat12_sector0();
        sector0[0x0D] = 3;
        assert!(matches!(
            Geometry::decode(100 * 512, &sector0),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_exfat_signature() {
        let mut sector0 = minimal_fat12_sector0();
        sector0[3..11].copy_from_slice(b"EXFAT   ");
        assert!(matches!(
            Geometry::decode(100 * 512, &sector0),
            Err(Error::UnsupportedVariant)
        ));
    }

    #[test]
    fn fat32_selected_when_fat16_size_is_zero() {
        let mut sector0 = minimal_fat12_sector0();
        s_set_fat32(&mut sector0);
        let geo = Geometry::decode(100_000 * 512, &sector0).unwrap();
        assert_eq!(geo.variant, FatVariant::Fat32);
        assert_eq!(geo.root_entry_count, 0);
    }

    fn s_set_fat32(sector0: &mut [u8]) {
        sector0[0x16..0x18].copy_from_slice(&0u16.to_le_bytes());
        sector0[0x11..0x13].copy_from_slice(&0u16.to_le_bytes());
        sector0[0x24..0x28].copy_from_slice(&200u32.to_le_bytes());
        sector0[0x2C..0x30].copy_from_slice(&2u32.to_le_bytes());
        sector0[0x20..0x24].copy_from_slice(&100_000u32.to_le_bytes());
        sector0[0x13..0x15].copy_from_slice(&0u16.to_le_bytes());
    }
}
