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

//! Cluster-chain traversal and the two mutations the allocators need:
//! extending a chain with fresh clusters and truncating one back down.

use fatstow_err::{Error, Result};
use fatstow_io::BlockDevice;
use log::warn;

use crate::table::{AllocationEntry, FatTable};

/// Follows chains rooted at a starting cluster and mutates the allocation
/// table on extend/truncate. Holds its [`FatTable`] by value: `FatTable`
/// is just a device reference plus a `Copy` geometry, so this is cheap to
/// construct per call.
pub struct ChainNavigator<'d, D: BlockDevice + ?Sized> {
    table: FatTable<'d, D>,
}

impl<'d, D: BlockDevice + ?Sized> ChainNavigator<'d, D> {
    pub fn new(table: FatTable<'d, D>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> FatTable<'d, D> {
        self.table
    }

    /// Walks `start`'s chain to `EndOfChain`, inclusive. Fails on a `Free`
    /// or `Bad` entry mid-chain, and on a chain longer than the volume has
    /// clusters (cycle detection).
    pub fn chain_of(&self, start: u32) -> Result<Vec<u32>> {
        let cluster_count = self.table.geometry().cluster_count;
        let mut chain = Vec::new();
        let mut current = start;
        loop {
            chain.push(current);
            if chain.len() as u64 > cluster_count {
                warn!("chain rooted at {start} exceeds {cluster_count} clusters, likely a cycle");
                return Err(Error::ChainCorrupt {
                    cluster: current,
                    reason: "chain length exceeds cluster count",
                });
            }
            match self.table.get(current)? {
                AllocationEntry::EndOfChain => return Ok(chain),
                AllocationEntry::Next(next) => current = next,
                AllocationEntry::Free => {
                    warn!("chain rooted at {start} hit a free cluster at {current}");
                    return Err(Error::ChainCorrupt {
                        cluster: current,
                        reason: "free cluster mid-chain",
                    })
                }
                AllocationEntry::Bad => {
                    warn!("chain rooted at {start} hit a bad cluster at {current}");
                    return Err(Error::ChainCorrupt {
                        cluster: current,
                        reason: "bad cluster mid-chain",
                    })
                }
                AllocationEntry::Reserved => {
                    warn!("chain rooted at {start} hit a reserved cluster at {current}");
                    return Err(Error::ChainCorrupt {
                        cluster: current,
                        reason: "reserved cluster mid-chain",
                    })
                }
            }
        }
    }

    pub fn tail_cluster(&self, start: u32) -> Result<u32> {
        // chain_of always pushes at least `start`, so `last` never panics.
        Ok(*self.chain_of(start)?.last().unwrap())
    }

    /// Appends `k` free clusters after `tail`, linking them in ascending
    /// order and terminating with `EndOfChain`. `OutOfSpace` is detected
    /// before any write (`find_n_free` enumerates first); an I/O failure
    /// partway through a write is rolled back using the fact that every
    /// touched entry's pre-write value is known (`tail` was `EndOfChain`,
    /// every new cluster was `Free`).
    pub fn extend(&self, tail: u32, k: usize) -> Result<Vec<u32>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let new_clusters = self.table.find_n_free(k)?;

        let mut written = Vec::new();
        let write_result = (|| -> Result<()> {
            let mut prev = tail;
            for &cluster in &new_clusters {
                self.table.set(prev, AllocationEntry::Next(cluster))?;
                written.push(prev);
                prev = cluster;
            }
            self.table.set(prev, AllocationEntry::EndOfChain)?;
            written.push(prev);
            Ok(())
        })();

        if let Err(e) = write_result {
            for &cluster in &written {
                let restore = if cluster == tail {
                    AllocationEntry::EndOfChain
                } else {
                    AllocationEntry::Free
                };
                let _ = self.table.set(cluster, restore);
            }
            return Err(e);
        }

        Ok(new_clusters)
    }

    /// Truncates `chain` (as returned by [`Self::chain_of`]) to its first
    /// `keep` entries: the entry at `keep - 1` becomes `EndOfChain`, and
    /// everything after it is freed.
    pub fn truncate(&self, chain: &[u32], keep: usize) -> Result<()> {
        assert!(keep >= 1 && keep <= chain.len(), "keep out of range");
        self.table.set(chain[keep - 1], AllocationEntry::EndOfChain)?;
        for &cluster in &chain[keep..] {
            self.table.set(cluster, AllocationEntry::Free)?;
        }
        Ok(())
    }
}
