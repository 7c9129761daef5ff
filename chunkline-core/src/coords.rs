use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::block::BlockFace;

pub const CHUNK_SIZE: i32 = 16;
pub const CHUNK_HEIGHT: i32 = 128;
pub const CHUNK_VOLUME: usize = (CHUNK_SIZE * CHUNK_SIZE * CHUNK_HEIGHT) as usize;

pub type WorldVector = IVec3;
pub type LocalVector = IVec3;

/// Column coordinate of a chunk. Chunks span the full world height so only x/z key them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ChunkPosition {
    pub x: i32,
    pub z: i32,
}

impl ChunkPosition {
    pub const ORIGIN: Self = Self::new(0, 0);

    #[inline(always)]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    #[inline(always)]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.z + dz)
    }

    #[inline(always)]
    pub const fn east(self) -> Self {
        self.offset(1, 0)
    }

    #[inline(always)]
    pub const fn west(self) -> Self {
        self.offset(-1, 0)
    }

    #[inline(always)]
    pub const fn south(self) -> Self {
        self.offset(0, 1)
    }

    #[inline(always)]
    pub const fn north(self) -> Self {
        self.offset(0, -1)
    }

    #[inline(always)]
    pub const fn south_east(self) -> Self {
        self.offset(1, 1)
    }

    /// West, east, north, south.
    pub const fn cardinal_neighbors(self) -> [Self; 4] {
        [self.west(), self.east(), self.north(), self.south()]
    }

    /// Neighbour across a horizontal block face. Vertical faces stay in the column.
    pub fn across(self, face: BlockFace) -> Self {
        let n = face.into_normal();
        self.offset(n.x, n.z)
    }

    #[inline]
    pub fn chebyshev_distance(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).max(self.z.abs_diff(other.z))
    }

    #[inline(always)]
    pub fn world_origin(self) -> WorldVector {
        IVec3::new(self.x * CHUNK_SIZE, 0, self.z * CHUNK_SIZE)
    }
}

impl std::fmt::Display for ChunkPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

#[inline(always)]
pub fn wv_to_cp(wv: WorldVector) -> ChunkPosition {
    ChunkPosition::new(wv.x.div_euclid(CHUNK_SIZE), wv.z.div_euclid(CHUNK_SIZE))
}

#[inline(always)]
pub fn wv_to_lv(wv: WorldVector) -> LocalVector {
    IVec3::new(wv.x.rem_euclid(CHUNK_SIZE), wv.y, wv.z.rem_euclid(CHUNK_SIZE))
}

#[inline(always)]
pub fn cp_lv_to_wv(cp: ChunkPosition, lv: LocalVector) -> WorldVector {
    cp.world_origin() + lv
}

#[inline(always)]
pub fn lv_in_bounds(lv: LocalVector) -> bool {
    (0..CHUNK_SIZE).contains(&lv.x)
        && (0..CHUNK_HEIGHT).contains(&lv.y)
        && (0..CHUNK_SIZE).contains(&lv.z)
}

// y-major so a horizontal slice is contiguous
#[inline(always)]
pub fn lv_to_idx(lv: LocalVector) -> usize {
    (lv.x + lv.z * CHUNK_SIZE + lv.y * CHUNK_SIZE * CHUNK_SIZE) as usize
}

#[inline(always)]
pub fn idx_to_lv(idx: usize) -> LocalVector {
    let idx = idx as i32;
    IVec3 {
        x: idx % CHUNK_SIZE,
        z: (idx / CHUNK_SIZE) % CHUNK_SIZE,
        y: idx / (CHUNK_SIZE * CHUNK_SIZE),
    }
}

#[inline(always)]
pub fn camera_vec3_to_cp(pos: Vec3) -> ChunkPosition {
    wv_to_cp(pos.floor().as_ivec3())
}

/// Horizontal faces whose neighbour chunk shares a seam with `lv`.
/// At most two apply (a column corner).
pub fn edge_faces(lv: LocalVector) -> [Option<BlockFace>; 2] {
    let x_face = match lv.x {
        0 => Some(BlockFace::Left),
        x if x == CHUNK_SIZE - 1 => Some(BlockFace::Right),
        _ => None,
    };
    let z_face = match lv.z {
        0 => Some(BlockFace::Front),
        z if z == CHUNK_SIZE - 1 => Some(BlockFace::Back),
        _ => None,
    };

    [x_face, z_face]
}
