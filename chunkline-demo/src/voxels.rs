use chunkline_core::{
    block::{BlockMeta, BlockTypeId, ChunkVoxel},
    block_mesh::VoxelVisibility,
};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DemoVoxels {
    #[default]
    Air = 0,
    Grass,
    Dirt,
    Stone,
    Sand,
    Snow,
    Water,
    Log,
    Leaves,
}

impl From<BlockTypeId> for DemoVoxels {
    fn from(value: BlockTypeId) -> Self {
        match value {
            1 => DemoVoxels::Grass,
            2 => DemoVoxels::Dirt,
            3 => DemoVoxels::Stone,
            4 => DemoVoxels::Sand,
            5 => DemoVoxels::Snow,
            6 => DemoVoxels::Water,
            7 => DemoVoxels::Log,
            8 => DemoVoxels::Leaves,
            _ => DemoVoxels::Air,
        }
    }
}

impl From<DemoVoxels> for BlockTypeId {
    fn from(value: DemoVoxels) -> Self {
        value as BlockTypeId
    }
}

impl ChunkVoxel for DemoVoxels {
    fn name(&self) -> &'static str {
        match self {
            DemoVoxels::Air => "air",
            DemoVoxels::Grass => "grass",
            DemoVoxels::Dirt => "dirt",
            DemoVoxels::Stone => "stone",
            DemoVoxels::Sand => "sand",
            DemoVoxels::Snow => "snow",
            DemoVoxels::Water => "water",
            DemoVoxels::Log => "log",
            DemoVoxels::Leaves => "leaves",
        }
    }

    fn visibility(&self) -> VoxelVisibility {
        match self {
            DemoVoxels::Air => VoxelVisibility::Empty,
            DemoVoxels::Water | DemoVoxels::Leaves => VoxelVisibility::Translucent,
            _ => VoxelVisibility::Opaque,
        }
    }

    // meta 0 is still water; anything above is a flow level
    fn is_transient(&self, meta: BlockMeta) -> bool {
        matches!(self, DemoVoxels::Water) && meta > 0
    }
}
