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

//! Directory enumeration: 32-byte directory records, long-filename
//! reassembly, and path resolution.

use fatstow_err::{Error, Result};
use fatstow_io::BlockDevice;

use crate::boot_sector::{FatVariant, Geometry};
use crate::chain::ChainNavigator;
use crate::table::FatTable;

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;
const LAST_LONG_ENTRY: u8 = 0x40;

/// Where a directory's 32-byte records live: the fixed root-directory
/// array on FAT12/16, or an ordinary cluster chain everywhere else.
#[derive(Debug, Clone, Copy)]
pub enum DirRegion {
    Fixed { start: u64, count: u32 },
    Chain { start_cluster: u32 },
}

/// One resolved directory entry: the reassembled long name if present
/// (else the short name), its attributes, and, for files, the data
/// needed to locate its slack and its chain.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub attrs: u8,
    pub start_cluster: u32,
    pub file_size: u32,
    pub is_dir: bool,
}

pub struct DirWalker<'d, D: BlockDevice + ?Sized> {
    device: &'d D,
    geometry: Geometry,
    table: FatTable<'d, D>,
}

impl<'d, D: BlockDevice + ?Sized> DirWalker<'d, D> {
    pub fn new(device: &'d D, geometry: Geometry, table: FatTable<'d, D>) -> Self {
        Self {
            device,
            geometry,
            table,
        }
    }

    pub fn root_region(&self) -> DirRegion {
        match self.geometry.variant {
            FatVariant::Fat32 => DirRegion::Chain {
                start_cluster: self.geometry.root_cluster,
            },
            _ => DirRegion::Fixed {
                start: self.geometry.root_dir_start,
                count: self.geometry.root_entry_count,
            },
        }
    }

    fn region_bytes(&self, region: DirRegion) -> Result<Vec<u8>> {
        match region {
            DirRegion::Fixed { start, count } => {
                let mut buf = vec![0u8; count as usize * 32];
                self.device.read_at(start, &mut buf)?;
                Ok(buf)
            }
            DirRegion::Chain { start_cluster } => {
                let nav = ChainNavigator::new(self.table);
                let chain = nav.chain_of(start_cluster)?;
                let cluster_size = self.geometry.cluster_size as usize;
                let mut buf = Vec::with_capacity(chain.len() * cluster_size);
                for cluster in chain {
                    let offset = self.geometry.cluster_offset(cluster);
                    let mut cluster_buf = vec![0u8; cluster_size];
                    self.device.read_at(offset, &mut cluster_buf)?;
                    buf.extend_from_slice(&cluster_buf);
                }
                Ok(buf)
            }
        }
    }

    /// Enumerates the entries directly in `region`, in on-disk order.
    pub fn list(&self, region: DirRegion) -> Result<Vec<DirEntryInfo>> {
        let buf = self.region_bytes(region)?;
        let mut out = Vec::new();
        // Indexed by ordinal - 1, so the final name can be assembled in
        // forward order regardless of the (descending) on-disk order.
        let mut lfn_units: Vec<u16> = Vec::new();

        for record in buf.chunks_exact(32) {
            match record[0] {
                0x00 => break,
                0xE5 => {
                    lfn_units.clear();
                    continue;
                }
                _ => {}
            }

            let attr = record[11];
            if attr & ATTR_LONG_NAME == ATTR_LONG_NAME {
                let ord = record[0];
                let seq = (ord & 0x3F) as usize;
                if seq == 0 {
                    lfn_units.clear();
                    continue;
                }
                if ord & LAST_LONG_ENTRY != 0 {
                    lfn_units = vec![0u16; seq * 13];
                } else if lfn_units.len() < seq * 13 {
                    lfn_units.resize(seq * 13, 0);
                }
                let mut units = [0u16; 13];
                for i in 0..5 {
                    units[i] = u16::from_le_bytes([record[1 + 2 * i], record[2 + 2 * i]]);
                }
                for i in 0..6 {
                    units[5 + i] = u16::from_le_bytes([record[14 + 2 * i], record[15 + 2 * i]]);
                }
                for i in 0..2 {
                    units[11 + i] = u16::from_le_bytes([record[28 + 2 * i], record[29 + 2 * i]]);
                }
                let base = (seq - 1) * 13;
                lfn_units[base..base + 13].copy_from_slice(&units);
                continue;
            }

            let long_name = if lfn_units.is_empty() {
                None
            } else {
                let end = lfn_units
                    .iter()
                    .position(|&c| c == 0x0000)
                    .unwrap_or(lfn_units.len());
                Some(String::from_utf16_lossy(&lfn_units[..end]))
            };
            lfn_units.clear();

            let short_name = decode_short_name(&record[0..11]);
            let name = long_name.unwrap_or(short_name);

            // DIR_FstClusHI lives at offset 0x14, the reserved field, not
            // the byte after DIR_FstClusLO, which the `fishy` source
            // mislabels `accessRightsBitmap` and reads instead (see
            // spec.md Open Question #2).
            let cluster_hi = u16::from_le_bytes([record[20], record[21]]) as u32;
            let cluster_lo = u16::from_le_bytes([record[26], record[27]]) as u32;
            let start_cluster = (cluster_hi << 16) | cluster_lo;
            let file_size = u32::from_le_bytes(record[28..32].try_into().unwrap());

            out.push(DirEntryInfo {
                name,
                attrs: attr,
                start_cluster,
                file_size,
                is_dir: attr & ATTR_DIRECTORY != 0,
            });
        }

        Ok(out)
    }

    /// Resolves a `/`-separated path from `region` (typically the root).
    /// Comparison is case-insensitive against the reassembled long name,
    /// or the short name when no LFN preceded the entry.
    pub fn resolve(&self, region: DirRegion, path: &str) -> Result<DirEntryInfo> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(Error::PathNotFound(path.to_string()));
        }

        let mut current_region = region;
        let mut found = None;
        for (i, segment) in segments.iter().enumerate() {
            let entries = self.list(current_region)?;
            let entry = entries
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(segment))
                .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
            if i + 1 < segments.len() {
                if !entry.is_dir {
                    return Err(Error::PathNotFound(path.to_string()));
                }
                current_region = DirRegion::Chain {
                    start_cluster: entry.start_cluster,
                };
            }
            found = Some(entry);
        }
        found.ok_or_else(|| Error::PathNotFound(path.to_string()))
    }

    /// Depth-first, directory-order enumeration of every regular file
    /// under `region`, paired with its resolved `/`-separated path
    /// (built from `prefix`). Skips `.`/`..`.
    fn walk_regular_files(&self, region: DirRegion, prefix: &str) -> Result<Vec<(String, DirEntryInfo)>> {
        let mut out = Vec::new();
        for entry in self.list(region)? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let path = format!("{prefix}/{}", entry.name);
            if entry.is_dir {
                let sub = self.walk_regular_files(
                    DirRegion::Chain {
                        start_cluster: entry.start_cluster,
                    },
                    &path,
                )?;
                out.extend(sub);
            } else {
                out.push((path, entry));
            }
        }
        Ok(out)
    }

    /// Resolves `path` (a file or a directory) to the ordered list of
    /// regular cover files it names: itself if it's a file, or every
    /// regular file beneath it (depth-first, directory order) if it's a
    /// directory. An empty or `/` path means the whole volume.
    pub fn regular_files_at(&self, path: &str) -> Result<Vec<(String, DirEntryInfo)>> {
        let root = self.root_region();
        if path.is_empty() || path == "/" {
            return self.walk_regular_files(root, "");
        }
        let entry = self.resolve(root, path)?;
        if entry.is_dir {
            self.walk_regular_files(
                DirRegion::Chain {
                    start_cluster: entry.start_cluster,
                },
                path,
            )
        } else {
            Ok(vec![(path.to_string(), entry)])
        }
    }
}

/// Decodes an 8.3 short name into `NAME.EXT` (or `NAME` with no
/// extension), trimming the space-padding FAT uses and restoring the
/// `0xE5` first byte that's escaped as `0x05` for files that legitimately
/// start with the deleted-entry marker.
fn decode_short_name(raw: &[u8; 11]) -> String {
    let mut raw = *raw;
    if raw[0] == 0x05 {
        raw[0] = 0xE5;
    }
    let (name, ext) = raw.split_at(8);
    let trim = |bytes: &[u8]| -> String {
        let end = bytes.iter().rposition(|&c| c != b' ').map_or(0, |i| i + 1);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    };
    let name = trim(name);
    let ext = trim(ext);
    if ext.is_empty() {
        name
    } else {
        format!("{name}.{ext}")
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

    fn fat16_geometry(root_start: u64, root_entries: u32) -> Geometry {
        Geometry {
            sector_size: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_count: 2,
            sectors_per_fat: 4,
            root_entry_count: root_entries,
            total_sectors: 4096,
            cluster_count: 100,
            variant: FatVariant::Fat16,
            fat_start: 512,
            root_dir_start: root_start,
            data_region_start: root_start + root_entries as u64 * 32,
            cluster_size: 512,
            root_cluster: 0,
        }
    }

    fn write_short_entry(buf: &mut [u8], name: &[u8; 11], attr: u8, cluster: u32, size: u32) {
        buf[0..11].copy_from_slice(name);
        buf[11] = attr;
        buf[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        buf[26..28].copy_from_slice(&((cluster & 0xFFFF) as u16).to_le_bytes());
        buf[28..32].copy_from_slice(&size.to_le_bytes());
    }

    #[test]
    fn lists_short_name_entry() {
        let root_start = 4096u64;
        let geometry = fat16_geometry(root_start, 16);
        let mut image = vec![0u8; 64 * 1024];
        write_short_entry(
            &mut image[root_start as usize..],
            b"A       TXT",
            0x20,
            5,
            400,
        );
        let device = MemDevice(RefCell::new(image));
        let table = FatTable::new(&device, geometry);
        let walker = DirWalker::new(&device, geometry, table);
        let entries = walker.list(walker.root_region()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "A.TXT");
        assert_eq!(entries[0].start_cluster, 5);
        assert_eq!(entries[0].file_size, 400);
        assert!(!entries[0].is_dir);
    }

    #[test]
    fn reassembles_long_file_name() {
        let root_start = 4096u64;
        let geometry = fat16_geometry(root_start, 16);
        let mut image = vec![0u8; 64 * 1024];

        // "longname.txt" -> one LFN record (12 UTF-16 units, fits in 13).
        let name_utf16: Vec<u16> = "longname.txt".encode_utf16().collect();
        let lfn = &mut image[root_start as usize..root_start as usize + 32];
        lfn[0] = 0x41; // ord=1, LAST_LONG_ENTRY
        lfn[11] = ATTR_LONG_NAME;
        let mut units = [0xFFFFu16; 13];
        units[..name_utf16.len()].copy_from_slice(&name_utf16);
        units[name_utf16.len()] = 0x0000;
        for i in 0..5 {
            lfn[1 + 2 * i..3 + 2 * i].copy_from_slice(&units[i].to_le_bytes());
        }
        for i in 0..6 {
            lfn[14 + 2 * i..16 + 2 * i].copy_from_slice(&units[5 + i].to_le_bytes());
        }
        for i in 0..2 {
            lfn[28 + 2 * i..30 + 2 * i].copy_from_slice(&units[11 + i].to_le_bytes());
        }

        write_short_entry(
            &mut image[root_start as usize + 32..],
            b"LONGNA~1TXT",
            0x20,
            9,
            12345,
        );

        let device = MemDevice(RefCell::new(image));
        let table = FatTable::new(&device, geometry);
        let walker = DirWalker::new(&device, geometry, table);
        let entries = walker.list(walker.root_region()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "longname.txt");
    }

    #[test]
    fn resolve_path_is_case_insensitive() {
        let root_start = 4096u64;
        let geometry = fat16_geometry(root_start, 16);
        let mut image = vec![0u8; 64 * 1024];
        write_short_entry(
            &mut image[root_start as usize..],
            b"A       TXT",
            0x20,
            5,
            400,
        );
        let device = MemDevice(RefCell::new(image));
        let table = FatTable::new(&device, geometry);
        let walker = DirWalker::new(&device, geometry, table);
        let entry = walker.resolve(walker.root_region(), "/a.txt").unwrap();
        assert_eq!(entry.start_cluster, 5);
    }
}
