use std::fmt;

use block_mesh::VoxelVisibility;
use glam::IVec3;
use serde::{Deserialize, Serialize};

pub type BlockTypeId = u8;
/// Per-block auxiliary state, e.g. a fluid level or growth stage.
pub type BlockMeta = u8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockId(u16);

mod layout {
    pub const TYPE_ID_BITS: u32 = 8;
    pub const META_BITS: u32 = 5;

    pub const TYPE_ID_SHIFT: u32 = 0;
    pub const META_SHIFT: u32 = TYPE_ID_SHIFT + TYPE_ID_BITS;

    pub const TYPE_ID_MASK: u16 = (1 << TYPE_ID_BITS) - 1;
    pub const META_MASK: u16 = (1 << META_BITS) - 1;
}

const _: () = {
    let total_bits = layout::TYPE_ID_BITS + layout::META_BITS;
    assert!(total_bits <= 16, "BlockId fields exceed 16 bits");
};

impl BlockId {
    pub const AIR: Self = Self(0);

    pub const fn new(type_id: BlockTypeId, meta: BlockMeta) -> Self {
        let type_id_part = type_id as u16 & layout::TYPE_ID_MASK;
        let meta_part = meta as u16 & layout::META_MASK;
        Self((type_id_part << layout::TYPE_ID_SHIFT) | (meta_part << layout::META_SHIFT))
    }

    pub const fn of_type(type_id: BlockTypeId) -> Self {
        Self::new(type_id, 0)
    }

    #[inline(always)]
    pub fn type_id(self) -> BlockTypeId {
        ((self.0 >> layout::TYPE_ID_SHIFT) & layout::TYPE_ID_MASK) as BlockTypeId
    }

    #[inline(always)]
    pub fn with_type_id(mut self, type_id: BlockTypeId) -> Self {
        self.0 &= !(layout::TYPE_ID_MASK << layout::TYPE_ID_SHIFT);
        self.0 |= (type_id as u16 & layout::TYPE_ID_MASK) << layout::TYPE_ID_SHIFT;
        self
    }

    #[inline(always)]
    pub fn meta(self) -> BlockMeta {
        ((self.0 >> layout::META_SHIFT) & layout::META_MASK) as BlockMeta
    }

    #[inline(always)]
    pub fn with_meta(mut self, meta: BlockMeta) -> Self {
        self.0 &= !(layout::META_MASK << layout::META_SHIFT);
        self.0 |= (meta as u16 & layout::META_MASK) << layout::META_SHIFT;
        self
    }

    #[inline(always)]
    pub fn is_air(self) -> bool {
        self.type_id() == 0
    }

    #[inline(always)]
    pub fn to_bits(self) -> u16 {
        self.0
    }

    #[inline(always)]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits & ((layout::META_MASK << layout::META_SHIFT) | layout::TYPE_ID_MASK))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "BlockId(AIR)");
        }
        f.debug_struct("BlockId")
            .field("type", &self.type_id())
            .field("meta", &self.meta())
            .finish()
    }
}

// number is used to represent neighbor_mask bit locations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockFace {
    Bottom = 0, // -Y
    Top = 1,    // +Y
    Front = 2,  // -Z, north
    Back = 3,   // +Z, south
    Left = 4,   // -X, west
    Right = 5,  // +X, east
}

impl BlockFace {
    pub fn into_normal(&self) -> IVec3 {
        match self {
            BlockFace::Bottom => IVec3::NEG_Y,
            BlockFace::Top => IVec3::Y,
            BlockFace::Front => IVec3::NEG_Z,
            BlockFace::Back => IVec3::Z,
            BlockFace::Left => IVec3::NEG_X,
            BlockFace::Right => IVec3::X,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            BlockFace::Bottom => BlockFace::Top,
            BlockFace::Top => BlockFace::Bottom,
            BlockFace::Front => BlockFace::Back,
            BlockFace::Back => BlockFace::Front,
            BlockFace::Left => BlockFace::Right,
            BlockFace::Right => BlockFace::Left,
        }
    }

    pub fn is_horizontal(&self) -> bool {
        !matches!(self, BlockFace::Bottom | BlockFace::Top)
    }
}

pub const HORIZONTAL_FACES: [BlockFace; 4] = [
    BlockFace::Front,
    BlockFace::Back,
    BlockFace::Left,
    BlockFace::Right,
];

/// Game-side block catalogue. The chunk core stores [`BlockId`]s and only asks the
/// catalogue how a type should mesh and whether it must survive a reload.
pub trait ChunkVoxel:
    Copy + Default + From<BlockTypeId> + Into<BlockTypeId> + Send + Sync + 'static
{
    fn name(&self) -> &'static str;

    fn visibility(&self) -> VoxelVisibility;

    /// Content that only exists while simulated (e.g. flowing fluid). A generated
    /// chunk holding it keeps its data-dirty flag so the simulated state is saved.
    fn is_transient(&self, _meta: BlockMeta) -> bool {
        false
    }
}
