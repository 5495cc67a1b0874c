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

//! File-slack hiding: writes into the unused tail of a cover file's last
//! cluster, between end-of-file and end-of-cluster. Never touches a
//! directory entry or an allocation-table entry.

use std::io::{Read, Write};

use fatstow_err::{Error, Result};
use fatstow_fat::{ChainNavigator, DirEntryInfo, DirWalker, FatTable, Geometry};
use fatstow_io::BlockDevice;
use fatstow_sidecar::{HiddenFragment, Technique};
use log::debug;

/// Read-only capacity report produced by [`FileSlackAllocator::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlackInfo {
    pub total_capacity: u64,
    pub largest_contiguous: u64,
}

pub struct FileSlackAllocator<'d, D: BlockDevice + ?Sized> {
    device: &'d D,
    geometry: Geometry,
    walker: DirWalker<'d, D>,
    table: FatTable<'d, D>,
}

impl<'d, D: BlockDevice + ?Sized> FileSlackAllocator<'d, D> {
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

    /// `[0, cluster_size)` of slack for a file whose size is an exact
    /// multiple of the cluster size: the do-not-clobber invariant.
    fn slack_len(&self, entry: &DirEntryInfo) -> u64 {
        let remainder = entry.file_size as u64 % self.geometry.cluster_size as u64;
        if remainder == 0 {
            0
        } else {
            self.geometry.cluster_size as u64 - remainder
        }
    }

    fn slack_start(&self, entry: &DirEntryInfo) -> Result<(u32, u64)> {
        let nav = ChainNavigator::new(self.table);
        let tail = nav.tail_cluster(entry.start_cluster)?;
        let remainder = entry.file_size as u64 % self.geometry.cluster_size as u64;
        Ok((tail, self.geometry.cluster_offset(tail) + remainder))
    }

    /// Resolves `destinations` to the ordered cover-file list the other
    /// operations walk: each destination that's a directory is expanded
    /// depth-first, in directory order.
    fn resolve_destinations(&self, destinations: &[&str]) -> Result<Vec<(String, DirEntryInfo)>> {
        let mut files = Vec::new();
        for dest in destinations {
            files.extend(self.walker.regular_files_at(dest)?);
        }
        Ok(files)
    }

    /// Total slack capacity and the largest single contiguous slack
    /// region across `destinations`. Makes no writes.
    pub fn info(&self, destinations: &[&str]) -> Result<SlackInfo> {
        let mut total = 0u64;
        let mut largest = 0u64;
        for (_, entry) in self.resolve_destinations(destinations)? {
            let len = self.slack_len(&entry);
            total += len;
            largest = largest.max(len);
        }
        Ok(SlackInfo {
            total_capacity: total,
            largest_contiguous: largest,
        })
    }

    /// Consumes `payload` entirely and writes it across the slack of
    /// `destinations`, in order, one sidecar entry per fill. The whole
    /// payload is buffered up front so capacity can be checked before a
    /// single byte is written, so on `InsufficientCapacity` the image is
    /// left byte-identical.
    pub fn write(
        &self,
        payload: &mut impl Read,
        destinations: &[&str],
    ) -> Result<Vec<HiddenFragment>> {
        let mut data = Vec::new();
        payload.read_to_end(&mut data)?;

        let capacity = self.info(destinations)?.total_capacity;
        if capacity < data.len() as u64 {
            return Err(Error::InsufficientCapacity {
                needed: data.len() as u64,
                available: capacity,
            });
        }

        let mut fragments = Vec::new();
        let mut cursor = 0usize;
        for (cover_path, entry) in self.resolve_destinations(destinations)? {
            if cursor >= data.len() {
                break;
            }
            let slack_len = self.slack_len(&entry) as usize;
            if slack_len == 0 {
                continue;
            }
            let (tail, offset) = self.slack_start(&entry)?;
            let take = slack_len.min(data.len() - cursor);
            self.device.write_at(offset, &data[cursor..cursor + take])?;
            debug!("wrote {take} slack bytes into {cover_path} at cluster {tail}");
            fragments.push(HiddenFragment {
                technique: Technique::Slack,
                cover_path,
                clusters: vec![tail],
                offset_in_first: (entry.file_size as u64 % self.geometry.cluster_size as u64) as u32,
                length_total: take as u64,
            });
            cursor += take;
        }

        Ok(fragments)
    }

    /// Emits the concatenated slack bytes named by `fragments`, in order.
    pub fn read(&self, fragments: &[HiddenFragment], sink: &mut impl Write) -> Result<()> {
        for fragment in fragments.iter().filter(|f| f.technique == Technique::Slack) {
            let offset =
                self.geometry.cluster_offset(fragment.clusters[0]) + fragment.offset_in_first as u64;
            let mut buf = vec![0u8; fragment.length_total as usize];
            self.device.read_at(offset, &mut buf)?;
            sink.write_all(&buf)?;
        }
        Ok(())
    }

    /// Overwrites each recorded slack region with zeros. Idempotent: a
    /// second call writes the same zeros again.
    pub fn clear(&self, fragments: &[HiddenFragment]) -> Result<()> {
        for fragment in fragments.iter().filter(|f| f.technique == Technique::Slack) {
            let offset =
                self.geometry.cluster_offset(fragment.clusters[0]) + fragment.offset_in_first as u64;
            let zeros = vec![0u8; fragment.length_total as usize];
            self.device.write_at(offset, &zeros)?;
        }
        Ok(())
    }
}
