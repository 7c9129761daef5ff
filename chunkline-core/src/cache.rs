use std::sync::Arc;

use crate::{
    coords::ChunkPosition,
    hasher::{PositionMap, position_map},
};

/// Per-position values derived from the coordinates alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionInfo {
    /// West, east, north, south.
    pub neighbors: [ChunkPosition; 4],
}

impl PositionInfo {
    fn compute(pos: ChunkPosition) -> Self {
        Self {
            neighbors: pos.cardinal_neighbors(),
        }
    }
}

/// Memoized [`PositionInfo`]. Safe to clear at any time; entries are recomputed on demand.
pub struct PositionCache {
    entries: PositionMap<Arc<PositionInfo>>,
}

impl Default for PositionCache {
    fn default() -> Self {
        Self {
            entries: position_map(),
        }
    }
}

impl PositionCache {
    const GROWTH_FACTOR: usize = 4;
    const SLACK: usize = 64;

    pub fn get(&self, pos: ChunkPosition) -> Arc<PositionInfo> {
        if let Some(info) = self.entries.get(&pos) {
            return info.clone();
        }
        self.entries
            .entry(pos)
            .or_insert_with(|| Arc::new(PositionInfo::compute(pos)))
            .clone()
    }

    pub fn remove(&self, pos: ChunkPosition) {
        self.entries.remove(&pos);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries that `keep` rejects once the cache outgrows the loaded set.
    /// Returns how many were removed.
    pub fn prune(&self, loaded: usize, keep: impl Fn(ChunkPosition) -> bool) -> usize {
        if self.entries.len() <= loaded * Self::GROWTH_FACTOR + Self::SLACK {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|pos, _| keep(*pos));
        before.saturating_sub(self.entries.len())
    }
}
