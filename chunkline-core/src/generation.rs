use std::marker::PhantomData;

use glam::IVec3;

use crate::{
    access::BlockWriter,
    block::{BlockId, ChunkVoxel},
    chunk::ChunkBlocks,
    coords::{CHUNK_SIZE, ChunkPosition},
    error::GenerationError,
};

/// What terrain generation learned about a column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerrainInfo {
    pub has_structures: bool,
    pub needs_decoration: bool,
    pub has_entities: bool,
}

pub trait TerrainGenerator: Send + Sync {
    fn seed(&self) -> u64;

    /// Fills a fresh column. Runs on a worker; must only touch `blocks`.
    fn generate_terrain(
        &self,
        pos: ChunkPosition,
        blocks: &mut ChunkBlocks,
    ) -> Result<TerrainInfo, GenerationError>;

    /// Decorates a column once its east, south and south-east neighbours exist, so
    /// features may spill over those seams.
    fn populate_features(&self, ctx: &mut FeatureContext<'_>) -> Result<(), GenerationError>;
}

/// 2×2 window of writable chunks anchored at the chunk being decorated.
/// Local x and z run over `0..2 * CHUNK_SIZE`.
pub struct FeatureContext<'a> {
    origin: ChunkPosition,
    seed: u64,
    // [origin, east, south, south_east]
    writers: [BlockWriter<'a>; 4],
    touched: [bool; 4],
}

impl<'a> FeatureContext<'a> {
    pub const SPAN: i32 = CHUNK_SIZE * 2;

    pub(crate) fn new(origin: ChunkPosition, seed: u64, writers: [BlockWriter<'a>; 4]) -> Self {
        Self {
            origin,
            seed,
            writers,
            touched: [false; 4],
        }
    }

    pub fn origin(&self) -> ChunkPosition {
        self.origin
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn locate(x: i32, z: i32) -> Option<(usize, i32, i32)> {
        if !(0..Self::SPAN).contains(&x) || !(0..Self::SPAN).contains(&z) {
            return None;
        }
        let slot = (x / CHUNK_SIZE) as usize + 2 * (z / CHUNK_SIZE) as usize;
        Some((slot, x % CHUNK_SIZE, z % CHUNK_SIZE))
    }

    pub fn get(&self, x: i32, y: i32, z: i32) -> BlockId {
        match Self::locate(x, z) {
            Some((slot, lx, lz)) => self.writers[slot].get(lx, y, lz),
            None => BlockId::AIR,
        }
    }

    pub fn set(&mut self, x: i32, y: i32, z: i32, block: BlockId) -> bool {
        let Some((slot, lx, lz)) = Self::locate(x, z) else {
            return false;
        };
        let changed = self.writers[slot].set(lx, y, lz, block);
        self.touched[slot] |= changed;
        changed
    }

    /// Places `block` only over air, so features never carve terrain.
    pub fn place(&mut self, pos: IVec3, block: BlockId) -> bool {
        self.get(pos.x, pos.y, pos.z).is_air() && self.set(pos.x, pos.y, pos.z, block)
    }

    /// Highest non-air y in a column of the window.
    pub fn surface_height(&self, x: i32, z: i32, max_y: i32) -> Option<i32> {
        (0..=max_y).rev().find(|y| !self.get(x, *y, z).is_air())
    }

    pub(crate) fn touched(&self) -> impl Iterator<Item = ChunkPosition> + '_ {
        let positions = [
            self.origin,
            self.origin.east(),
            self.origin.south(),
            self.origin.south_east(),
        ];
        positions
            .into_iter()
            .zip(self.touched)
            .filter_map(|(pos, touched)| touched.then_some(pos))
    }
}

/// Decides whether freshly generated content must be saved even though nobody
/// edited it (e.g. transient simulated blocks that cannot be regenerated).
pub trait PersistPolicy: Send + Sync {
    fn must_persist(&self, pos: ChunkPosition, blocks: &ChunkBlocks, info: &TerrainInfo) -> bool;
}

impl<F> PersistPolicy for F
where
    F: Fn(ChunkPosition, &ChunkBlocks, &TerrainInfo) -> bool + Send + Sync,
{
    fn must_persist(&self, pos: ChunkPosition, blocks: &ChunkBlocks, info: &TerrainInfo) -> bool {
        self(pos, blocks, info)
    }
}

/// Generated terrain is reproducible from the seed.
pub struct RegenerateOnLoad;

impl PersistPolicy for RegenerateOnLoad {
    fn must_persist(&self, _: ChunkPosition, _: &ChunkBlocks, _: &TerrainInfo) -> bool {
        false
    }
}

/// Persists any column holding a block the catalogue marks transient.
pub struct PersistTransient<V>(PhantomData<fn() -> V>);

impl<V> Default for PersistTransient<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<V: ChunkVoxel> PersistPolicy for PersistTransient<V> {
    fn must_persist(&self, _: ChunkPosition, blocks: &ChunkBlocks, _: &TerrainInfo) -> bool {
        blocks
            .as_slice()
            .iter()
            .any(|block| V::from(block.type_id()).is_transient(block.meta()))
    }
}
