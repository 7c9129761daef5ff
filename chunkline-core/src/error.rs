use thiserror::Error;

use crate::coords::ChunkPosition;

pub type ChunkResult<T> = Result<T, ChunkError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("lz4: {0}")]
    Compression(#[from] std::io::Error),
    #[error("stored chunk has {found} voxels, expected {expected}")]
    Corrupt { found: usize, expected: usize },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("terrain: {0}")]
    Terrain(String),
    #[error("features: {0}")]
    Features(String),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("chunk {0} was unloaded before its mesh was built")]
    ChunkGone(ChunkPosition),
    #[error("mesh builder: {0}")]
    Builder(String),
    #[error("mesh build panicked")]
    Panicked,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device out of memory")]
    OutOfMemory,
    #[error("device lost")]
    Lost,
    #[error("device: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("loading chunk {pos} failed")]
    Load {
        pos: ChunkPosition,
        #[source]
        source: StorageError,
    },
    #[error("generating chunk {pos} failed")]
    Generate {
        pos: ChunkPosition,
        #[source]
        source: GenerationError,
    },
    #[error("saving chunk {pos} failed")]
    Save {
        pos: ChunkPosition,
        #[source]
        source: StorageError,
    },
    #[error("population task for chunk {0} panicked")]
    TaskPanicked(ChunkPosition),
    #[error("population task for chunk {0} was cancelled")]
    Cancelled(ChunkPosition),
    #[error("chunk {0} is not loaded")]
    NotLoaded(ChunkPosition),
    #[error("chunk store is shut down")]
    ShutDown,
    #[error("building the worker pool failed")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ChunkError {
    pub fn position(&self) -> Option<ChunkPosition> {
        match self {
            ChunkError::Load { pos, .. }
            | ChunkError::Generate { pos, .. }
            | ChunkError::Save { pos, .. }
            | ChunkError::TaskPanicked(pos)
            | ChunkError::Cancelled(pos)
            | ChunkError::NotLoaded(pos) => Some(*pos),
            _ => None,
        }
    }
}

/// `outer: inner: innermost`, for log lines.
pub fn report(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
