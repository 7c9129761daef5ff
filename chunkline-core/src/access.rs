use glam::{I64Vec3, IVec3};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::{
    block::BlockId,
    chunk::{Chunk, ChunkBlocks},
    coords::{CHUNK_HEIGHT, CHUNK_SIZE, LocalVector, lv_to_idx},
};

/// Inclusive box of local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub min: LocalVector,
    pub max: LocalVector,
}

impl Region {
    pub fn new(a: LocalVector, b: LocalVector) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn whole_chunk() -> Self {
        Self {
            min: IVec3::ZERO,
            max: IVec3::new(CHUNK_SIZE - 1, CHUNK_HEIGHT - 1, CHUNK_SIZE - 1),
        }
    }

    /// Intersection with the chunk, `None` when nothing is left.
    pub fn clamped(self) -> Option<Self> {
        let bounds = Self::whole_chunk();
        let min = self.min.max(bounds.min);
        let max = self.max.min(bounds.max);
        (min.cmple(max).all()).then_some(Self { min, max })
    }

    pub fn iter(self) -> impl Iterator<Item = LocalVector> {
        let Self { min, max } = self;
        (min.y..=max.y).flat_map(move |y| {
            (min.z..=max.z).flat_map(move |z| (min.x..=max.x).map(move |x| IVec3::new(x, y, z)))
        })
    }
}

/// Shared view over a chunk's voxels. Any number may coexist.
pub struct BlockReader<'a> {
    blocks: RwLockReadGuard<'a, ChunkBlocks>,
}

impl<'a> BlockReader<'a> {
    pub(crate) fn new(blocks: RwLockReadGuard<'a, ChunkBlocks>) -> Self {
        Self { blocks }
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32, z: i32) -> BlockId {
        self.blocks.get(IVec3::new(x, y, z))
    }

    #[inline]
    pub fn get_lv(&self, lv: LocalVector) -> BlockId {
        self.blocks.get(lv)
    }

    pub fn blocks(&self) -> &ChunkBlocks {
        &self.blocks
    }

    pub fn count(&self, block: BlockId) -> usize {
        self.blocks.as_slice().iter().filter(|b| **b == block).count()
    }
}

/// Exclusive view. Every write that changes a voxel marks the chunk block-changed;
/// bulk operations mark it once for the whole batch.
pub struct BlockWriter<'a> {
    blocks: RwLockWriteGuard<'a, ChunkBlocks>,
    chunk: &'a Chunk,
}

impl<'a> BlockWriter<'a> {
    pub(crate) fn new(blocks: RwLockWriteGuard<'a, ChunkBlocks>, chunk: &'a Chunk) -> Self {
        Self { blocks, chunk }
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32, z: i32) -> BlockId {
        self.blocks.get(IVec3::new(x, y, z))
    }

    #[inline]
    pub fn get_lv(&self, lv: LocalVector) -> BlockId {
        self.blocks.get(lv)
    }

    pub fn set(&mut self, x: i32, y: i32, z: i32, block: BlockId) -> bool {
        self.set_lv(IVec3::new(x, y, z), block)
    }

    pub fn set_lv(&mut self, lv: LocalVector, block: BlockId) -> bool {
        let changed = self.blocks.set(lv, block).is_some();
        if changed {
            self.chunk.mark_block_changed();
        }
        changed
    }

    /// Hot-path write without coordinate validation. Panics if the coordinates
    /// index past the voxel buffer.
    pub fn set_unchecked(&mut self, x: i32, y: i32, z: i32, block: BlockId) -> bool {
        let idx = lv_to_idx(IVec3::new(x, y, z));
        let changed = self.blocks.set_idx_unchecked(idx, block);
        if changed {
            self.chunk.mark_block_changed();
        }
        changed
    }

    pub fn fill(&mut self, region: Region, block: BlockId) -> usize {
        let Some(region) = region.clamped() else {
            return 0;
        };
        let changed = region
            .iter()
            .filter(|lv| self.blocks.set(*lv, block).is_some())
            .count();
        self.finish_bulk(changed)
    }

    pub fn replace_all(&mut self, from: BlockId, to: BlockId) -> usize {
        if from == to {
            return 0;
        }
        let mut changed = 0;
        for slot in self.blocks.as_mut_slice() {
            if *slot == from {
                *slot = to;
                changed += 1;
            }
        }
        self.finish_bulk(changed)
    }

    /// Fills every voxel whose centre lies within `radius` of `center`.
    pub fn fill_sphere(&mut self, center: LocalVector, radius: i32, block: BlockId) -> usize {
        if radius < 0 {
            return 0;
        }
        // far centres and huge radii must not wrap
        let c = center.as_i64vec3();
        let r = radius as i64;
        let lo = (c - I64Vec3::splat(r)).max(I64Vec3::ZERO);
        let hi = (c + I64Vec3::splat(r)).min(Region::whole_chunk().max.as_i64vec3());
        if !lo.cmple(hi).all() {
            return 0;
        }
        let region = Region {
            min: lo.as_ivec3(),
            max: hi.as_ivec3(),
        };
        let radius_sq = r * r;
        let changed = region
            .iter()
            .filter(|lv| (lv.as_i64vec3() - c).length_squared() <= radius_sq)
            .filter(|lv| self.blocks.set(*lv, block).is_some())
            .count();
        self.finish_bulk(changed)
    }

    pub fn clear(&mut self) -> usize {
        let mut changed = 0;
        for slot in self.blocks.as_mut_slice() {
            if !slot.is_air() {
                *slot = BlockId::AIR;
                changed += 1;
            }
        }
        self.finish_bulk(changed)
    }

    fn finish_bulk(&self, changed: usize) -> usize {
        if changed > 0 {
            self.chunk.mark_block_changed();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::ChunkMetadata,
        coords::{CHUNK_VOLUME, ChunkPosition},
        state::ChunkState,
    };

    const STONE: BlockId = BlockId::of_type(1);
    const DIRT: BlockId = BlockId::of_type(2);

    fn chunk() -> Chunk {
        Chunk::new(
            ChunkPosition::ORIGIN,
            ChunkBlocks::default(),
            ChunkMetadata::default(),
            true,
            ChunkState::CREATED | ChunkState::BLOCKS_POPULATED | ChunkState::READY,
        )
    }

    fn edits(chunk: &Chunk) -> u64 {
        chunk.dirty().data_epoch().edits()
    }

    #[test]
    fn out_of_bounds_get_is_air() {
        let chunk = chunk();
        chunk.write().fill(Region::whole_chunk(), STONE);
        let reader = chunk.read();
        assert_eq!(reader.get(0, 0, 0), STONE);
        assert_eq!(reader.get(-1, 0, 0), BlockId::AIR);
        assert_eq!(reader.get(0, CHUNK_HEIGHT, 0), BlockId::AIR);
        assert_eq!(reader.get(CHUNK_SIZE, 0, 0), BlockId::AIR);
    }

    #[test]
    fn set_only_marks_on_change() {
        let chunk = chunk();
        {
            let mut writer = chunk.write();
            assert!(!writer.set(1, 1, 1, BlockId::AIR));
        }
        assert!(!chunk.is_data_dirty());
        assert!(!chunk.dirty().is_mesh_dirty());

        assert!(chunk.write().set(1, 1, 1, STONE));
        assert!(chunk.is_data_dirty());
        assert!(chunk.dirty().is_mesh_dirty());
        assert!(chunk.state().needs_mesh_rebuild());
        assert_eq!(chunk.read().get(1, 1, 1), STONE);

        assert!(!chunk.write().set(99, 1, 1, STONE));
    }

    #[test]
    #[should_panic]
    fn set_unchecked_panics_out_of_range() {
        let chunk = chunk();
        chunk.write().set_unchecked(0, CHUNK_HEIGHT, 0, STONE);
    }

    #[test]
    fn set_unchecked_writes() {
        let chunk = chunk();
        assert!(chunk.write().set_unchecked(3, 4, 5, DIRT));
        assert_eq!(chunk.read().get(3, 4, 5), DIRT);
    }

    #[test]
    fn bulk_ops_mark_once() {
        let chunk = chunk();

        let before = edits(&chunk);
        let filled = chunk
            .write()
            .fill(Region::new(IVec3::new(0, 0, 0), IVec3::new(3, 1, 3)), STONE);
        assert_eq!(filled, 4 * 2 * 4);
        assert_eq!(edits(&chunk), before + 1);

        let before = edits(&chunk);
        assert_eq!(chunk.write().replace_all(STONE, DIRT), 32);
        assert_eq!(edits(&chunk), before + 1);
        assert_eq!(chunk.read().count(DIRT), 32);

        let before = edits(&chunk);
        assert_eq!(chunk.write().replace_all(STONE, DIRT), 0);
        assert_eq!(edits(&chunk), before);

        let before = edits(&chunk);
        assert_eq!(chunk.write().clear(), 32);
        assert_eq!(edits(&chunk), before + 1);
        assert_eq!(chunk.read().count(BlockId::AIR), CHUNK_VOLUME);
    }

    #[test]
    fn fill_clamps_to_chunk() {
        let chunk = chunk();
        let region = Region::new(IVec3::new(-5, -5, -5), IVec3::new(0, 0, 0));
        assert_eq!(chunk.write().fill(region, STONE), 1);

        let outside = Region::new(IVec3::new(-5, 0, 0), IVec3::new(-1, 0, 0));
        assert_eq!(chunk.write().fill(outside, STONE), 0);
    }

    #[test]
    fn sphere() {
        let chunk = chunk();
        let center = IVec3::new(8, 64, 8);
        // radius 1 covers the centre and its six face neighbours
        assert_eq!(chunk.write().fill_sphere(center, 1, STONE), 7);
        assert_eq!(chunk.read().get(8, 65, 8), STONE);
        assert_eq!(chunk.read().get(9, 65, 8), BlockId::AIR);

        assert_eq!(chunk.write().fill_sphere(center, 1, STONE), 0);
        assert_eq!(chunk.write().fill_sphere(center, -1, STONE), 0);
    }

    #[test]
    fn sphere_with_extreme_inputs() {
        let chunk = chunk();
        let far = IVec3::new(i32::MAX, i32::MAX, i32::MIN);
        assert_eq!(chunk.write().fill_sphere(far, 4, STONE), 0);
        assert_eq!(chunk.write().fill_sphere(far, i32::MAX, STONE), 0);
        assert!(!chunk.is_data_dirty());

        let filled = chunk.write().fill_sphere(IVec3::new(8, 64, 8), i32::MAX, STONE);
        assert_eq!(filled, CHUNK_VOLUME);
        assert_eq!(chunk.read().count(STONE), CHUNK_VOLUME);
    }

    #[test]
    fn clearing_air_leaves_chunk_clean() {
        let chunk = chunk();
        let before = edits(&chunk);
        let region = Region::new(IVec3::new(0, 0, 0), IVec3::new(15, 10, 15));
        assert_eq!(chunk.write().fill(region, BlockId::AIR), 0);

        assert_eq!(edits(&chunk), before);
        assert!(!chunk.is_data_dirty());
        assert!(!chunk.dirty().is_mesh_dirty());
    }
}
