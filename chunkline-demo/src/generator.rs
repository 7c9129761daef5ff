use chunkline_core::{
    block::BlockId,
    chunk::ChunkBlocks,
    coords::{CHUNK_HEIGHT, CHUNK_SIZE, ChunkPosition},
    error::GenerationError,
    generation::{FeatureContext, TerrainGenerator, TerrainInfo},
    glam::IVec3,
};
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};

use crate::voxels::DemoVoxels;

const SEA_LEVEL: f32 = 40.0;
const BEACH_HEIGHT: f32 = 2.0;
const COLUMN_AREA: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;
// room for the tallest tree above the highest peak
const MAX_TERRAIN: f32 = (CHUNK_HEIGHT - 12) as f32;
const WORLD_BORDER: i32 = 1 << 20;

const TREE_ATTEMPTS: u64 = 3;
const TREE_MARGIN: i32 = 2;

struct ColumnData {
    height_map: [f32; COLUMN_AREA],
    biome_jitter_map: [f32; COLUMN_AREA],
}

pub struct WorldGenerator {
    seed: u64,
    continent_noise: Fbm<Perlin>,
    terrain_noise: Fbm<Perlin>,
    cave_noise_1: Fbm<Perlin>,
    cave_noise_2: Fbm<Perlin>,
    biome_noise: Fbm<Perlin>,
}

impl WorldGenerator {
    pub fn new(seed: u64) -> Self {
        let base = seed as u32;
        let continent_noise = Fbm::new(base.wrapping_add(1000))
            .set_frequency(0.002)
            .set_octaves(6);

        let terrain_noise = Fbm::new(base.wrapping_add(2000))
            .set_frequency(0.006)
            .set_octaves(7)
            .set_lacunarity(2.2)
            .set_persistence(0.5);

        let cave_noise_1 = Fbm::new(base.wrapping_add(3000))
            .set_frequency(0.02)
            .set_octaves(5);
        let cave_noise_2 = Fbm::new(base.wrapping_add(3001))
            .set_frequency(0.02)
            .set_octaves(5);

        let biome_noise = Fbm::new(base.wrapping_add(4000))
            .set_frequency(0.02)
            .set_octaves(2);

        Self {
            seed,
            continent_noise,
            terrain_noise,
            cave_noise_1,
            cave_noise_2,
            biome_noise,
        }
    }

    fn column_data(&self, pos: ChunkPosition) -> ColumnData {
        let origin = pos.world_origin();
        let mut height_map = [0.0; COLUMN_AREA];
        let mut biome_jitter_map = [0.0; COLUMN_AREA];

        for x in 0..CHUNK_SIZE {
            for z in 0..CHUNK_SIZE {
                let world_x = (origin.x + x) as f64;
                let world_z = (origin.z + z) as f64;
                let idx = (x + z * CHUNK_SIZE) as usize;

                let cont_val = self.continent_noise.get([world_x, world_z]);
                let continent_mask = ((cont_val + 1.0) / 2.0).clamp(0.0, 1.0).powf(0.9);
                let terrain_val = self.terrain_noise.get([world_x, world_z]);
                let elevation = ((terrain_val + 1.0) / 2.0).max(0.0);
                let final_terrain = elevation.powf(2.5);
                let base_height = SEA_LEVEL as f64 - 16.0;
                let land_height = 24.0 * continent_mask;
                let mountain_height = final_terrain * 110.0 * continent_mask;

                height_map[idx] =
                    ((base_height + land_height + mountain_height) as f32).min(MAX_TERRAIN);
                biome_jitter_map[idx] = self.biome_noise.get([world_x, world_z]) as f32 * 6.0;
            }
        }

        ColumnData {
            height_map,
            biome_jitter_map,
        }
    }

    fn surface_block(&self, terrain_height: f32, jitter: f32) -> DemoVoxels {
        if terrain_height <= SEA_LEVEL + BEACH_HEIGHT + jitter * 0.2 {
            DemoVoxels::Sand
        } else if terrain_height > 100.0 + jitter {
            DemoVoxels::Snow
        } else if terrain_height > 80.0 + jitter {
            DemoVoxels::Stone
        } else {
            DemoVoxels::Grass
        }
    }

    fn tree_roll(&self, pos: ChunkPosition, attempt: u64) -> u64 {
        let mut h = self.seed
            ^ (pos.x as u32 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (pos.z as u32 as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
            ^ attempt.wrapping_mul(0x1656_67B1_9E37_79F9);
        // splitmix64 finaliser
        h = (h ^ (h >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        h = (h ^ (h >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        h ^ (h >> 31)
    }
}

impl TerrainGenerator for WorldGenerator {
    fn seed(&self) -> u64 {
        self.seed
    }

    fn generate_terrain(
        &self,
        pos: ChunkPosition,
        blocks: &mut ChunkBlocks,
    ) -> Result<TerrainInfo, GenerationError> {
        if pos.x.abs() > WORLD_BORDER || pos.z.abs() > WORLD_BORDER {
            return Err(GenerationError::Terrain(format!(
                "{pos} is beyond the world border"
            )));
        }

        let origin = pos.world_origin();
        let column_data = self.column_data(pos);
        let plane = (CHUNK_SIZE * CHUNK_HEIGHT) as usize;

        // x/y and y/z slices, combined per voxel into a cheap 3d cave field
        let mut cave_noise_xy = vec![0.0; plane];
        let mut cave_noise_zy = vec![0.0; plane];
        for y in 0..CHUNK_HEIGHT {
            for i in 0..CHUNK_SIZE {
                let idx = (i + y * CHUNK_SIZE) as usize;
                cave_noise_xy[idx] = self.cave_noise_1.get([(origin.x + i) as f64, y as f64]);
                cave_noise_zy[idx] = self.cave_noise_2.get([y as f64, (origin.z + i) as f64]);
            }
        }

        let mut info = TerrainInfo {
            needs_decoration: true,
            ..Default::default()
        };

        for x in 0..CHUNK_SIZE {
            for z in 0..CHUNK_SIZE {
                let col_idx = (x + z * CHUNK_SIZE) as usize;
                let terrain_height = column_data.height_map[col_idx];
                let jitter = column_data.biome_jitter_map[col_idx];

                for y in 0..CHUNK_HEIGHT {
                    let fy = y as f32;
                    if fy > terrain_height && fy > SEA_LEVEL {
                        break;
                    }

                    let mut block = DemoVoxels::Air;
                    let mut meta = 0;
                    if fy <= terrain_height {
                        if fy + 1.0 > terrain_height {
                            block = if fy > SEA_LEVEL {
                                self.surface_block(terrain_height, jitter)
                            } else {
                                DemoVoxels::Sand
                            };
                        } else if fy > terrain_height - 3.0 {
                            block = DemoVoxels::Dirt;
                        } else {
                            block = DemoVoxels::Stone;
                        }
                    } else if fy + 1.0 <= SEA_LEVEL {
                        block = DemoVoxels::Water;
                        // shallows are still settling
                        if terrain_height > SEA_LEVEL - 2.0 {
                            meta = 1;
                        }
                    }

                    if !matches!(block, DemoVoxels::Water | DemoVoxels::Air) && y > 0 {
                        let n1 = cave_noise_xy[(x + y * CHUNK_SIZE) as usize];
                        let n2 = cave_noise_zy[(z + y * CHUNK_SIZE) as usize];
                        let cave_density = n1.abs() * n2.abs();
                        let depth = (terrain_height - fy).max(0.0) as f64;
                        let threshold = 0.1 + (1.0 - depth / 40.0).clamp(0.0, 1.0).powi(2) * 0.3;
                        if cave_density > threshold {
                            block = DemoVoxels::Air;
                        }
                    }

                    if block != DemoVoxels::Air {
                        blocks.set(IVec3::new(x, y, z), BlockId::new(block.into(), meta));
                    }
                    if block == DemoVoxels::Grass && x == CHUNK_SIZE / 2 && z == CHUNK_SIZE / 2 {
                        info.has_entities = true;
                    }
                }
            }
        }

        Ok(info)
    }

    /// Scatters a few trees rooted in the origin chunk. Canopies may hang over the
    /// east and south seams.
    fn populate_features(&self, ctx: &mut FeatureContext<'_>) -> Result<(), GenerationError> {
        let log = BlockId::of_type(DemoVoxels::Log.into());
        let leaves = BlockId::of_type(DemoVoxels::Leaves.into());
        let roots = (CHUNK_SIZE - TREE_MARGIN) as u64;

        for attempt in 0..TREE_ATTEMPTS {
            let roll = self.tree_roll(ctx.origin(), attempt);
            if roll % 3 == 0 {
                continue;
            }
            let x = TREE_MARGIN + ((roll >> 8) % roots) as i32;
            let z = TREE_MARGIN + ((roll >> 16) % roots) as i32;
            let trunk = 4 + ((roll >> 24) % 3) as i32;

            let Some(ground) = ctx.surface_height(x, z, CHUNK_HEIGHT - 1) else {
                continue;
            };
            if DemoVoxels::from(ctx.get(x, ground, z).type_id()) != DemoVoxels::Grass
                || ground + trunk + 2 >= CHUNK_HEIGHT
            {
                continue;
            }

            ctx.set(x, ground, z, BlockId::of_type(DemoVoxels::Dirt.into()));
            for dy in 1..=trunk {
                ctx.set(x, ground + dy, z, log);
            }

            let top = ground + trunk;
            for dy in -2..=1 {
                let radius: i32 = if dy > 0 { 1 } else { 2 };
                for dz in -radius..=radius {
                    for dx in -radius..=radius {
                        if dx.abs() == 2 && dz.abs() == 2 {
                            continue;
                        }
                        ctx.place(IVec3::new(x + dx, top + dy, z + dz), leaves);
                    }
                }
            }
        }
        Ok(())
    }
}
