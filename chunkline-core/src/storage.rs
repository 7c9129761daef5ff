use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use bincode::config::{BigEndian, Configuration};
use dashmap::DashMap;
use lz4::block::{compress, decompress};
use serde::{Deserialize, Serialize};

use crate::{
    block::BlockId,
    chunk::{ChunkBlocks, ChunkMetadata},
    coords::ChunkPosition,
    error::StorageError,
};

/// Everything needed to bring a chunk back exactly as it was saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedChunk {
    pub blocks: ChunkBlocks,
    pub features_populated: bool,
    pub metadata: ChunkMetadata,
}

/// Save service. Calls block; the store runs them on its worker pool.
pub trait ChunkPersistence: Send + Sync {
    fn load_chunk(&self, pos: ChunkPosition) -> Result<Option<PersistedChunk>, StorageError>;

    fn save_chunk(&self, pos: ChunkPosition, chunk: &PersistedChunk) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub struct SledChunkStore {
    db: sled::Db,
    bincode_config: Configuration<BigEndian>,
}

impl SledChunkStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path.as_ref())?;
        Ok(Self::with_db(sled::open(path)?))
    }

    /// Backed by a temporary directory removed on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::with_db(db))
    }

    fn with_db(db: sled::Db) -> Self {
        Self {
            db,
            bincode_config: bincode::config::standard().with_big_endian(),
        }
    }

    pub fn save_chunks<'a>(
        &self,
        chunks: impl IntoIterator<Item = (ChunkPosition, &'a PersistedChunk)>,
    ) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for (pos, chunk) in chunks {
            let compressed = encode_compress(chunk, self.bincode_config)?;
            batch.insert(&position_to_key(pos), compressed);
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    pub fn stored_positions(&self) -> impl Iterator<Item = Result<ChunkPosition, StorageError>> {
        self.db.iter().keys().map(|key| {
            let key = key?;
            Ok(key_to_position(&key))
        })
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl ChunkPersistence for SledChunkStore {
    fn load_chunk(&self, pos: ChunkPosition) -> Result<Option<PersistedChunk>, StorageError> {
        self.db
            .get(position_to_key(pos))?
            .map(|compressed| decompress_decode(&compressed, self.bincode_config))
            .transpose()
    }

    fn save_chunk(&self, pos: ChunkPosition, chunk: &PersistedChunk) -> Result<(), StorageError> {
        let compressed = encode_compress(chunk, self.bincode_config)?;
        self.db.insert(position_to_key(pos), compressed)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Keeps encoded chunks in memory. Goes through the same codec as the sled store.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: DashMap<ChunkPosition, Vec<u8>>,
    saves: AtomicUsize,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pos: ChunkPosition) -> bool {
        self.chunks.contains_key(&pos)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }
}

impl ChunkPersistence for MemoryChunkStore {
    fn load_chunk(&self, pos: ChunkPosition) -> Result<Option<PersistedChunk>, StorageError> {
        let config = bincode::config::standard().with_big_endian();
        self.chunks
            .get(&pos)
            .map(|bytes| decompress_decode(&bytes, config))
            .transpose()
    }

    fn save_chunk(&self, pos: ChunkPosition, chunk: &PersistedChunk) -> Result<(), StorageError> {
        let config = bincode::config::standard().with_big_endian();
        self.chunks.insert(pos, encode_compress(chunk, config)?);
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// Sign-flipped big-endian keys sort the same way the integers do.
fn position_to_key(pos: ChunkPosition) -> [u8; 8] {
    const SIGN_FLIP: u32 = 1 << 31;
    let mut key = [0u8; 8];
    key[0..4].copy_from_slice(&(pos.x as u32 ^ SIGN_FLIP).to_be_bytes());
    key[4..8].copy_from_slice(&(pos.z as u32 ^ SIGN_FLIP).to_be_bytes());
    key
}

fn key_to_position(key: &[u8]) -> ChunkPosition {
    const SIGN_FLIP: u32 = 1 << 31;
    let mut x = [0u8; 4];
    let mut z = [0u8; 4];
    x.copy_from_slice(&key[0..4]);
    z.copy_from_slice(&key[4..8]);
    ChunkPosition::new(
        (u32::from_be_bytes(x) ^ SIGN_FLIP) as i32,
        (u32::from_be_bytes(z) ^ SIGN_FLIP) as i32,
    )
}

/// Columns are mostly long runs of stone or air, so voxels are stored run-length encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedChunkPacked {
    runs: Vec<(u16, BlockId)>,
    features_populated: bool,
    metadata: ChunkMetadata,
}

impl From<&PersistedChunk> for PersistedChunkPacked {
    fn from(value: &PersistedChunk) -> Self {
        let mut runs: Vec<(u16, BlockId)> = Vec::new();
        for block in value.blocks.as_slice() {
            match runs.last_mut() {
                Some((len, last)) if *last == *block && *len < u16::MAX => *len += 1,
                _ => runs.push((1, *block)),
            }
        }

        PersistedChunkPacked {
            runs,
            features_populated: value.features_populated,
            metadata: value.metadata.clone(),
        }
    }
}

impl TryFrom<PersistedChunkPacked> for PersistedChunk {
    type Error = StorageError;

    fn try_from(value: PersistedChunkPacked) -> Result<Self, Self::Error> {
        let total: usize = value.runs.iter().map(|(len, _)| *len as usize).sum();
        let mut voxels = Vec::with_capacity(total);
        for (len, block) in value.runs {
            voxels.extend(std::iter::repeat_n(block, len as usize));
        }

        Ok(PersistedChunk {
            blocks: ChunkBlocks::from_voxels(voxels)?,
            features_populated: value.features_populated,
            metadata: value.metadata,
        })
    }
}

fn encode_compress(
    chunk: &PersistedChunk,
    config: Configuration<BigEndian>,
) -> Result<Vec<u8>, StorageError> {
    let packed = PersistedChunkPacked::from(chunk);
    let encoded = bincode::serde::encode_to_vec(&packed, config)?;
    Ok(compress(&encoded, None, true)?)
}

fn decompress_decode(
    compressed: &[u8],
    config: Configuration<BigEndian>,
) -> Result<PersistedChunk, StorageError> {
    let encoded = decompress(compressed, None)?;
    let (packed, _): (PersistedChunkPacked, _) =
        bincode::serde::decode_from_slice(&encoded, config)?;
    packed.try_into()
}

#[cfg(test)]
mod tests {
    use glam::IVec3;

    use super::*;
    use crate::coords::CHUNK_VOLUME;

    fn sample() -> PersistedChunk {
        let mut blocks = ChunkBlocks::default();
        for x in 0..16 {
            for z in 0..16 {
                for y in 0..40 {
                    blocks.set(IVec3::new(x, y, z), BlockId::of_type(1));
                }
            }
        }
        blocks.set(IVec3::new(3, 41, 9), BlockId::new(7, 4));

        PersistedChunk {
            blocks,
            features_populated: true,
            metadata: ChunkMetadata {
                created_at: 11,
                last_modified: 22,
                seed: 0xC0FFEE,
                has_structures: true,
                needs_decoration: false,
                has_entities: true,
            },
        }
    }

    #[test]
    fn keys_sort_like_integers() {
        let positions = [
            ChunkPosition::new(-3, 7),
            ChunkPosition::new(-1, -1),
            ChunkPosition::new(0, 0),
            ChunkPosition::new(0, 5),
            ChunkPosition::new(2, -9),
        ];
        let keys: Vec<_> = positions.iter().map(|p| position_to_key(*p)).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        for (pos, key) in positions.iter().zip(&keys) {
            assert_eq!(key_to_position(key), *pos);
        }
    }

    #[test]
    fn sled_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pos = ChunkPosition::new(-4, 12);
        let chunk = sample();

        let store = SledChunkStore::open(dir.path().join("world")).unwrap();
        assert!(store.load_chunk(pos).unwrap().is_none());
        store.save_chunk(pos, &chunk).unwrap();
        store.flush().unwrap();

        let loaded = store.load_chunk(pos).unwrap().unwrap();
        assert_eq!(loaded, chunk);
        assert_eq!(loaded.blocks.get(IVec3::new(3, 41, 9)).meta(), 4);
        assert_eq!(store.stored_positions().next().unwrap().unwrap(), pos);
    }

    #[test]
    fn batch_save() {
        let store = SledChunkStore::temporary().unwrap();
        let chunk = sample();
        let positions = [ChunkPosition::new(0, 0), ChunkPosition::new(1, 0)];
        store
            .save_chunks(positions.iter().map(|p| (*p, &chunk)))
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn memory_roundtrip() {
        let store = MemoryChunkStore::new();
        let pos = ChunkPosition::new(1, 1);
        store.save_chunk(pos, &sample()).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load_chunk(pos).unwrap(), Some(sample()));
        assert_eq!(store.load_chunk(ChunkPosition::ORIGIN).unwrap(), None);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let packed = PersistedChunkPacked {
            runs: vec![(10, BlockId::AIR)],
            features_populated: false,
            metadata: ChunkMetadata::default(),
        };
        let err = PersistedChunk::try_from(packed).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Corrupt { found: 10, expected: CHUNK_VOLUME }
        ));
    }

    #[test]
    fn garbage_bytes_are_an_error() {
        let config = bincode::config::standard().with_big_endian();
        assert!(decompress_decode(&[1, 2, 3], config).is_err());
    }
}
