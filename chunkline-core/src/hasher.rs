use std::hash::{BuildHasherDefault, Hasher};

use dashmap::DashMap;

use crate::coords::ChunkPosition;

// Morton encoding keeps neighbouring columns close in the hash space
fn interleave_bits(input: u32) -> u64 {
    let mut x = input as u64;
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

fn morton_encode(x: i32, z: i32) -> u64 {
    const SIGN_FLIP: u32 = 1 << 31;
    interleave_bits(x as u32 ^ SIGN_FLIP) | (interleave_bits(z as u32 ^ SIGN_FLIP) << 1)
}

/// Hasher for [`ChunkPosition`] keys. Expects exactly two `write_i32` calls, which is
/// what the derived `Hash` on a two-field struct produces.
#[derive(Default)]
pub struct MortonHasher {
    components: [i32; 2],
    count: usize,
}

impl Hasher for MortonHasher {
    fn finish(&self) -> u64 {
        debug_assert!(self.count == 2, "Incomplete ChunkPosition provided to hasher");
        morton_encode(self.components[0], self.components[1])
    }

    fn write(&mut self, _bytes: &[u8]) {
        unreachable!("MortonHasher only hashes ChunkPosition");
    }

    fn write_i32(&mut self, i: i32) {
        if self.count < 2 {
            self.components[self.count] = i;
            self.count += 1;
        }
    }
}

pub type BuildMortonHasher = BuildHasherDefault<MortonHasher>;
pub type PositionMap<T> = DashMap<ChunkPosition, T, BuildMortonHasher>;

pub fn position_map<T>() -> PositionMap<T> {
    DashMap::with_hasher(BuildMortonHasher::default())
}
