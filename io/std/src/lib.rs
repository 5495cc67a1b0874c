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

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use fatstow_io::BlockDevice;
use log::debug;

use fatstow_err::Result;

/// A block image backed by a regular file, opened exclusively for the
/// duration of one operation (no cross-process locking, per the
/// concurrency model: the caller is expected not to run two operations
/// against the same image concurrently).
pub struct FileBlockDevice {
    file: File,
}

impl FileBlockDevice {
    /// Opens `path` read-only, for `read`-style operations.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("opening {} read-only", path.display());
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    /// Opens `path` read-write, for `hide`/`clear`-style operations.
    pub fn open_read_write(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("opening {} read-write", path.display());
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl BlockDevice for FileBlockDevice {
    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }
}
