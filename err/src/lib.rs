//! Shared error type for every crate in the workspace.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("unsupported FAT variant")]
    UnsupportedVariant,

    #[error("FAT mirror copies diverged at cluster {cluster}")]
    FatMirrorInconsistent { cluster: u32 },

    #[error("cluster chain corrupt at cluster {cluster}: {reason}")]
    ChainCorrupt { cluster: u32, reason: &'static str },

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("not a regular file: {0}")]
    NotARegularFile(String),

    #[error("out of space: need {needed} free clusters, {available} available")]
    OutOfSpace { needed: usize, available: usize },

    #[error("insufficient capacity: need {needed} bytes, {available} available")]
    InsufficientCapacity { needed: u64, available: u64 },

    #[error("failed to write FAT entry for cluster {cluster}")]
    FatWriteFailed {
        cluster: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("cover file chain diverged since hiding")]
    CoverChainDiverged,

    #[error("sidecar corrupt: {0}")]
    SidecarCorrupt(String),
}

pub type Result<T> = core::result::Result<T, Error>;
