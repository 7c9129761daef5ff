use std::marker::PhantomData;

use block_mesh::{
    GreedyQuadsBuffer, MergeVoxel, OrientedBlockFace, RIGHT_HANDED_Y_UP_CONFIG, UnorientedQuad,
    Voxel, VoxelVisibility, greedy_quads,
    ndshape::{ConstShape, ConstShape3u32},
};
use crossbeam::queue::ArrayQueue;
use glam::{IVec3, Vec3};

use crate::{
    block::{BlockFace, BlockId, ChunkVoxel, HORIZONTAL_FACES},
    chunk::ChunkBlocks,
    coords::{CHUNK_HEIGHT, CHUNK_SIZE, ChunkPosition},
    error::MeshError,
};

const PADDED_SIDE: u32 = CHUNK_SIZE as u32 + 2;
const PADDED_HEIGHT: u32 = CHUNK_HEIGHT as u32 + 2;
type PaddedShape = ConstShape3u32<PADDED_SIDE, PADDED_HEIGHT, PADDED_SIDE>;
const PADDED_VOLUME: usize = (PADDED_SIDE * PADDED_HEIGHT * PADDED_SIDE) as usize;
const SEAM_LEN: usize = (CHUNK_SIZE * CHUNK_HEIGHT) as usize;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChunkMeshData {
    pub indices: Vec<u32>,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub layers: Vec<f32>,
}

impl ChunkMeshData {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn quad_count(&self) -> usize {
        self.indices.len() / 6
    }

    fn with_capacity(quads: usize) -> Self {
        Self {
            indices: Vec::with_capacity(quads * 6),
            positions: Vec::with_capacity(quads * 4),
            normals: Vec::with_capacity(quads * 4),
            uvs: Vec::with_capacity(quads * 4),
            layers: Vec::with_capacity(quads * 4),
        }
    }
}

/// Immutable CPU-side geometry for one chunk, in world space.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChunkMesh {
    pub opaque: ChunkMeshData,
    pub translucent: ChunkMeshData,
}

impl ChunkMesh {
    pub fn is_empty(&self) -> bool {
        self.opaque.is_empty() && self.translucent.is_empty()
    }

    pub fn quad_count(&self) -> usize {
        self.opaque.quad_count() + self.translucent.quad_count()
    }
}

/// The single voxel layer of each horizontal neighbour that touches this chunk.
/// Missing neighbours read as air.
#[derive(Debug, Default, Clone)]
pub struct NeighborBoundaries {
    // indexed like HORIZONTAL_FACES
    seams: [Option<Box<[BlockId]>>; 4],
}

fn seam_slot(face: BlockFace) -> Option<usize> {
    HORIZONTAL_FACES.iter().position(|f| *f == face)
}

impl NeighborBoundaries {
    /// Copies the layer of `neighbor` that faces a chunk lying across `face`
    /// from it. `face` is given from this chunk's point of view.
    pub fn capture(&mut self, face: BlockFace, neighbor: &ChunkBlocks) {
        let Some(slot) = seam_slot(face) else {
            return;
        };
        let mut seam = Vec::with_capacity(SEAM_LEN);
        for y in 0..CHUNK_HEIGHT {
            for i in 0..CHUNK_SIZE {
                let lv = match face {
                    BlockFace::Right => IVec3::new(0, y, i),
                    BlockFace::Left => IVec3::new(CHUNK_SIZE - 1, y, i),
                    BlockFace::Back => IVec3::new(i, y, 0),
                    _ => IVec3::new(i, y, CHUNK_SIZE - 1),
                };
                seam.push(neighbor.get(lv));
            }
        }
        self.seams[slot] = Some(seam.into_boxed_slice());
    }

    pub fn has(&self, face: BlockFace) -> bool {
        seam_slot(face).is_some_and(|slot| self.seams[slot].is_some())
    }

    /// `i` runs along the seam (z for east/west, x for north/south).
    pub fn get(&self, face: BlockFace, i: i32, y: i32) -> BlockId {
        seam_slot(face)
            .and_then(|slot| self.seams[slot].as_ref())
            .and_then(|seam| seam.get((i + y * CHUNK_SIZE) as usize).copied())
            .unwrap_or(BlockId::AIR)
    }
}

#[derive(Clone, Copy)]
struct PaddedVoxel {
    id: BlockId,
    visibility: VoxelVisibility,
}

impl Default for PaddedVoxel {
    fn default() -> Self {
        Self {
            id: BlockId::AIR,
            visibility: VoxelVisibility::Empty,
        }
    }
}

impl Voxel for PaddedVoxel {
    fn get_visibility(&self) -> VoxelVisibility {
        self.visibility
    }
}

impl MergeVoxel for PaddedVoxel {
    type MergeValue = BlockId;

    fn merge_value(&self) -> Self::MergeValue {
        self.id
    }
}

/// Reusable buffers for one mesh build. Handed out by a [`MeshScratchPool`].
pub struct MeshScratch {
    padded: Vec<PaddedVoxel>,
    quads: GreedyQuadsBuffer,
}

impl Default for MeshScratch {
    fn default() -> Self {
        Self {
            padded: vec![PaddedVoxel::default(); PADDED_VOLUME],
            quads: GreedyQuadsBuffer::new(PADDED_VOLUME),
        }
    }
}

/// Bounded free list of scratch buffers shared by mesh workers.
pub struct MeshScratchPool {
    free: ArrayQueue<MeshScratch>,
}

impl MeshScratchPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn acquire(&self) -> MeshScratch {
        self.free.pop().unwrap_or_default()
    }

    /// Returns a buffer to the pool; dropped if the pool is already full.
    pub fn release(&self, scratch: MeshScratch) {
        let _ = self.free.push(scratch);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

pub trait MeshBuilder: Send + Sync {
    fn build_mesh(
        &self,
        pos: ChunkPosition,
        blocks: &ChunkBlocks,
        neighbors: &NeighborBoundaries,
        scratch: &mut MeshScratch,
    ) -> Result<ChunkMesh, MeshError>;
}

/// Greedy quad mesher over the block catalogue `V`.
pub struct GreedyMesher<V>(PhantomData<fn() -> V>);

impl<V> Default for GreedyMesher<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<V: ChunkVoxel> GreedyMesher<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn padded(id: BlockId) -> PaddedVoxel {
        PaddedVoxel {
            id,
            visibility: V::from(id.type_id()).visibility(),
        }
    }

    fn fill_padded(
        blocks: &ChunkBlocks,
        neighbors: &NeighborBoundaries,
        padded: &mut [PaddedVoxel],
    ) {
        padded.fill(PaddedVoxel::default());
        let idx = |x: i32, y: i32, z: i32| {
            <PaddedShape as ConstShape<3>>::linearize([x as u32, y as u32, z as u32]) as usize
        };

        for y in 0..CHUNK_HEIGHT {
            for z in 0..CHUNK_SIZE {
                for x in 0..CHUNK_SIZE {
                    padded[idx(x + 1, y + 1, z + 1)] =
                        Self::padded(blocks.get(IVec3::new(x, y, z)));
                }
            }
        }

        let far = CHUNK_SIZE + 1;
        for face in HORIZONTAL_FACES {
            if !neighbors.has(face) {
                continue;
            }
            for y in 0..CHUNK_HEIGHT {
                for i in 0..CHUNK_SIZE {
                    let (px, pz) = match face {
                        BlockFace::Right => (far, i + 1),
                        BlockFace::Left => (0, i + 1),
                        BlockFace::Back => (i + 1, far),
                        _ => (i + 1, 0),
                    };
                    padded[idx(px, y + 1, pz)] = Self::padded(neighbors.get(face, i, y));
                }
            }
        }
    }
}

impl<V: ChunkVoxel> MeshBuilder for GreedyMesher<V> {
    #[cfg_attr(feature = "profile", tracing::instrument(skip_all))]
    fn build_mesh(
        &self,
        pos: ChunkPosition,
        blocks: &ChunkBlocks,
        neighbors: &NeighborBoundaries,
        scratch: &mut MeshScratch,
    ) -> Result<ChunkMesh, MeshError> {
        if blocks.is_released() {
            return Err(MeshError::ChunkGone(pos));
        }

        let MeshScratch { padded, quads } = scratch;
        Self::fill_padded(blocks, neighbors, padded);

        greedy_quads(
            padded.as_slice(),
            &PaddedShape {},
            [0; 3],
            [PADDED_SIDE - 1, PADDED_HEIGHT - 1, PADDED_SIDE - 1],
            &RIGHT_HANDED_Y_UP_CONFIG.faces,
            quads,
        );

        let num_quads = quads.quads.num_quads();
        let mut mesh = ChunkMesh {
            opaque: ChunkMeshData::with_capacity(num_quads),
            translucent: ChunkMeshData::default(),
        };
        let origin = pos.world_origin().as_vec3();

        for (face, group) in RIGHT_HANDED_Y_UP_CONFIG
            .faces
            .iter()
            .zip(quads.quads.groups.iter())
        {
            for quad in group {
                let voxel = padded[<PaddedShape as ConstShape<3>>::linearize(quad.minimum) as usize];
                let target = if voxel.visibility == VoxelVisibility::Opaque {
                    &mut mesh.opaque
                } else {
                    &mut mesh.translucent
                };
                push_quad(target, quad, face, origin, voxel.id);
            }
        }

        Ok(mesh)
    }
}

fn push_quad(
    mesh: &mut ChunkMeshData,
    quad: &UnorientedQuad,
    face: &OrientedBlockFace,
    origin: Vec3,
    id: BlockId,
) {
    let start_vertex = mesh.positions.len() as u32;
    let positions = face
        .quad_mesh_positions(quad, 1.0)
        .map(|p| (Vec3::from(p) - Vec3::ONE + origin).to_array());

    mesh.indices
        .extend_from_slice(&face.quad_mesh_indices(start_vertex));
    mesh.positions.extend_from_slice(&positions);
    mesh.normals.extend_from_slice(&face.quad_mesh_normals());
    mesh.uvs
        .extend_from_slice(&face.tex_coords(RIGHT_HANDED_Y_UP_CONFIG.u_flip_face, true, quad));
    mesh.layers.extend_from_slice(&[id.type_id() as f32; 4]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestVoxels;

    const STONE: BlockId = BlockId::of_type(TestVoxels::STONE);
    const WATER: BlockId = BlockId::of_type(TestVoxels::WATER);

    fn build(blocks: &ChunkBlocks, neighbors: &NeighborBoundaries) -> ChunkMesh {
        let mut scratch = MeshScratch::default();
        GreedyMesher::<TestVoxels>::new()
            .build_mesh(ChunkPosition::new(1, -1), blocks, neighbors, &mut scratch)
            .unwrap()
    }

    #[test]
    fn empty_chunk_has_no_geometry() {
        let mesh = build(&ChunkBlocks::default(), &NeighborBoundaries::default());
        assert!(mesh.is_empty());
    }

    #[test]
    fn lone_block_has_six_faces() {
        let mut blocks = ChunkBlocks::default();
        blocks.set(IVec3::new(5, 60, 5), STONE);
        let mesh = build(&blocks, &NeighborBoundaries::default());

        assert_eq!(mesh.opaque.quad_count(), 6);
        assert_eq!(mesh.opaque.positions.len(), 24);
        assert!(mesh.translucent.is_empty());

        // world space: chunk (1, -1) starts at x=16, z=-16
        let min = mesh
            .opaque
            .positions
            .iter()
            .fold(Vec3::splat(f32::MAX), |acc, p| acc.min(Vec3::from(*p)));
        assert_eq!(min, Vec3::new(21.0, 60.0, -11.0));
    }

    #[test]
    fn slab_merges_into_large_quads() {
        let mut blocks = ChunkBlocks::default();
        for x in 0..CHUNK_SIZE {
            for z in 0..CHUNK_SIZE {
                blocks.set(IVec3::new(x, 0, z), STONE);
            }
        }
        let mesh = build(&blocks, &NeighborBoundaries::default());
        assert_eq!(mesh.opaque.quad_count(), 6);
    }

    #[test]
    fn neighbor_seam_culls_faces() {
        let mut blocks = ChunkBlocks::default();
        blocks.set(IVec3::new(CHUNK_SIZE - 1, 10, 4), STONE);

        let mut east = ChunkBlocks::default();
        east.set(IVec3::new(0, 10, 4), STONE);

        let mut neighbors = NeighborBoundaries::default();
        neighbors.capture(BlockFace::Right, &east);
        assert!(neighbors.has(BlockFace::Right));
        assert_eq!(neighbors.get(BlockFace::Right, 4, 10), STONE);

        let mesh = build(&blocks, &neighbors);
        assert_eq!(mesh.opaque.quad_count(), 5);
    }

    #[test]
    fn translucent_goes_to_its_own_buffer() {
        let mut blocks = ChunkBlocks::default();
        blocks.set(IVec3::new(2, 2, 2), WATER);
        let mesh = build(&blocks, &NeighborBoundaries::default());
        assert!(mesh.opaque.is_empty());
        assert_eq!(mesh.translucent.quad_count(), 6);
        assert!(mesh.translucent.layers.iter().all(|l| *l == TestVoxels::WATER as f32));
    }

    #[test]
    fn scratch_pool_reuses() {
        let pool = MeshScratchPool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.available(), 2);
        let _ = pool.acquire();
        assert_eq!(pool.available(), 1);
    }
}
