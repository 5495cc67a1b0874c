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

//! Seekable random-access storage for a FAT image.

use fatstow_err::{Error, Result};
use log::warn;

/// Random read/write access to the bytes of a block image.
///
/// Implementors are expected to be backed by something seekable (a file, a
/// loop device, an in-memory buffer for tests); `read_at`/`write_at` never
/// move an implicit cursor, so callers may interleave calls freely.
pub trait BlockDevice {
    fn len(&self) -> Result<u64>;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
}

/// Wraps a [`BlockDevice`] and enforces sector-aligned access, per the
/// "Block I/O" component of the design: reads and writes must start on a
/// sector boundary and cover a whole number of sectors.
pub struct SectorDevice<'d, D: BlockDevice + ?Sized> {
    device: &'d D,
    sector_size: u32,
}

impl<'d, D: BlockDevice + ?Sized> SectorDevice<'d, D> {
    pub fn new(device: &'d D, sector_size: u32) -> Self {
        Self { device, sector_size }
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(buf.len())?;
        self.device.read_at(sector * self.sector_size as u64, buf)
    }

    pub fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(buf.len())?;
        self.device.write_at(sector * self.sector_size as u64, buf)
    }

    fn check_alignment(&self, len: usize) -> Result<()> {
        if len % self.sector_size as usize != 0 {
            warn!(
                "buffer length {len} is not a multiple of sector size {}",
                self.sector_size
            );
            return Err(Error::InvalidGeometry(format!(
                "buffer length {len} is not a multiple of sector size {}",
                self.sector_size
            )));
        }
        Ok(())
    }
}
