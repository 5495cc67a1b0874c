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

//! The sidecar: an append-only, versioned list of hidden-fragment
//! descriptors (spec.md §3, §6).
//!
//! Confidentiality is an external collaborator's concern: this crate
//! only ever produces and consumes plaintext bytes through a generic
//! [`Read`]/[`Write`], so a caller that wants encryption wraps the
//! stream it passes in; this crate neither mandates nor inspects that.

use std::io::{Read, Write};
use std::mem::size_of;

use fatstow_err::{Error, Result};
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, IntoBytes, KnownLayout,
};

const MAGIC: u32 = 0x574F_5453;
const VERSION: u16 = 1;

/// Which hiding technique produced a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technique {
    Slack,
    AddCluster,
}

/// One hidden-fragment descriptor. Concatenating the bytes named by
/// `clusters`, starting at `offset_in_first` within the first cluster,
/// for `length_total` bytes total, reproduces the payload that one
/// write call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenFragment {
    pub technique: Technique,
    pub cover_path: String,
    pub clusters: Vec<u32>,
    pub offset_in_first: u32,
    pub length_total: u64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct Header {
    magic: U32,
    version: U16,
    entry_count: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct EntryHeader {
    technique: u8,
    _reserved: [u8; 3],
    cover_path_len: U16,
    cluster_count: U32,
    offset_in_first: U32,
    length_total: U64,
}

/// Serializes `entries`, in write order, as the finalized sidecar byte
/// sequence. Called once per hide, per the "WritingSidecar" stage of the
/// per-hide lifecycle (spec.md §4.7).
pub fn write_all(sink: &mut impl Write, entries: &[HiddenFragment]) -> Result<()> {
    let header = Header {
        magic: MAGIC.into(),
        version: VERSION.into(),
        entry_count: (entries.len() as u32).into(),
    };
    sink.write_all(header.as_bytes())?;

    for entry in entries {
        let path_bytes = entry.cover_path.as_bytes();
        let entry_header = EntryHeader {
            technique: match entry.technique {
                Technique::Slack => 0,
                Technique::AddCluster => 1,
            },
            _reserved: [0; 3],
            cover_path_len: (path_bytes.len() as u16).into(),
            cluster_count: (entry.clusters.len() as u32).into(),
            offset_in_first: entry.offset_in_first.into(),
            length_total: entry.length_total.into(),
        };
        sink.write_all(entry_header.as_bytes())?;
        sink.write_all(path_bytes)?;
        for &cluster in &entry.clusters {
            sink.write_all(U32::from(cluster).as_bytes())?;
        }
    }
    Ok(())
}

/// Parses a sidecar byte sequence back into its descriptor list, in the
/// original write order.
pub fn read_all(source: &mut impl Read) -> Result<Vec<HiddenFragment>> {
    let mut header_buf = [0u8; size_of::<Header>()];
    source
        .read_exact(&mut header_buf)
        .map_err(|_| Error::SidecarCorrupt("truncated sidecar header".into()))?;
    let header = Header::read_from_bytes(&header_buf)
        .map_err(|_| Error::SidecarCorrupt("malformed sidecar header".into()))?;

    if header.magic.get() != MAGIC {
        return Err(Error::SidecarCorrupt(format!(
            "bad magic {:#010x}",
            header.magic.get()
        )));
    }
    if header.version.get() != VERSION {
        return Err(Error::SidecarCorrupt(format!(
            "unsupported sidecar version {}",
            header.version.get()
        )));
    }

    let count = header.entry_count.get();
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut entry_header_buf = [0u8; size_of::<EntryHeader>()];
        source
            .read_exact(&mut entry_header_buf)
            .map_err(|_| Error::SidecarCorrupt("truncated entry header".into()))?;
        let entry_header = EntryHeader::read_from_bytes(&entry_header_buf)
            .map_err(|_| Error::SidecarCorrupt("malformed entry header".into()))?;

        let technique = match entry_header.technique {
            0 => Technique::Slack,
            1 => Technique::AddCluster,
            other => {
                return Err(Error::SidecarCorrupt(format!(
                    "unknown technique tag {other}"
                )))
            }
        };

        let mut path_buf = vec![0u8; entry_header.cover_path_len.get() as usize];
        source
            .read_exact(&mut path_buf)
            .map_err(|_| Error::SidecarCorrupt("truncated cover path".into()))?;
        let cover_path = String::from_utf8(path_buf)
            .map_err(|_| Error::SidecarCorrupt("cover path is not valid UTF-8".into()))?;

        let mut clusters = Vec::with_capacity(entry_header.cluster_count.get() as usize);
        for _ in 0..entry_header.cluster_count.get() {
            let mut cluster_buf = [0u8; 4];
            source
                .read_exact(&mut cluster_buf)
                .map_err(|_| Error::SidecarCorrupt("truncated cluster list".into()))?;
            clusters.push(u32::from_le_bytes(cluster_buf));
        }

        entries.push(HiddenFragment {
            technique,
            cover_path,
            clusters,
            offset_in_first: entry_header.offset_in_first.get(),
            length_total: entry_header.length_total.get(),
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_entries() -> Vec<HiddenFragment> {
        vec![
            HiddenFragment {
                technique: Technique::Slack,
                cover_path: "/a.txt".into(),
                clusters: vec![5],
                offset_in_first: 400,
                length_total: 100,
            },
            HiddenFragment {
                technique: Technique::AddCluster,
                cover_path: "/dir/c.dat".into(),
                clusters: vec![42, 43],
                offset_in_first: 0,
                length_total: 5000,
            },
        ]
    }

    #[test]
    fn round_trips_mixed_entries() {
        let entries = sample_entries();
        let mut buf = Vec::new();
        write_all(&mut buf, &entries).unwrap();
        let decoded = read_all(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn empty_entry_list_round_trips() {
        let mut buf = Vec::new();
        write_all(&mut buf, &[]).unwrap();
        let decoded = read_all(&mut Cursor::new(buf)).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        write_all(&mut buf, &sample_entries()).unwrap();
        buf[0] ^= 0xFF;
        let err = read_all(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::SidecarCorrupt(_)));
    }

    #[test]
    fn rejects_truncated_stream() {
        let mut buf = Vec::new();
        write_all(&mut buf, &sample_entries()).unwrap();
        buf.truncate(buf.len() - 4);
        let err = read_all(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::SidecarCorrupt(_)));
    }
}
