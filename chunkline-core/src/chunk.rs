use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    access::{BlockReader, BlockWriter},
    block::BlockId,
    coords::{CHUNK_VOLUME, ChunkPosition, LocalVector, lv_in_bounds, lv_to_idx},
    error::StorageError,
    meshing::ChunkMesh,
    state::{ChunkState, ChunkStateMachine, DataEpoch, DirtyTracker},
    storage::PersistedChunk,
    upload::GpuHandle,
};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Dense voxel column. An empty buffer means the chunk released its data on unload;
/// reads then see air and writes are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBlocks {
    voxels: Box<[BlockId]>,
}

impl Default for ChunkBlocks {
    fn default() -> Self {
        Self::filled(BlockId::AIR)
    }
}

impl ChunkBlocks {
    pub fn filled(block: BlockId) -> Self {
        Self {
            voxels: vec![block; CHUNK_VOLUME].into_boxed_slice(),
        }
    }

    pub fn from_voxels(voxels: Vec<BlockId>) -> Result<Self, StorageError> {
        if voxels.len() != CHUNK_VOLUME {
            return Err(StorageError::Corrupt {
                found: voxels.len(),
                expected: CHUNK_VOLUME,
            });
        }
        Ok(Self {
            voxels: voxels.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn get(&self, lv: LocalVector) -> BlockId {
        if !lv_in_bounds(lv) {
            return BlockId::AIR;
        }
        self.get_idx(lv_to_idx(lv))
    }

    #[inline]
    pub fn get_idx(&self, idx: usize) -> BlockId {
        self.voxels.get(idx).copied().unwrap_or(BlockId::AIR)
    }

    /// Returns the previous block when the write changed something.
    #[inline]
    pub fn set(&mut self, lv: LocalVector, block: BlockId) -> Option<BlockId> {
        if !lv_in_bounds(lv) {
            return None;
        }
        let slot = self.voxels.get_mut(lv_to_idx(lv))?;
        if *slot == block {
            return None;
        }
        Some(std::mem::replace(slot, block))
    }

    /// Panics on an index past the buffer.
    #[inline]
    pub fn set_idx_unchecked(&mut self, idx: usize, block: BlockId) -> bool {
        let slot = &mut self.voxels[idx];
        if *slot == block {
            return false;
        }
        *slot = block;
        true
    }

    pub fn as_slice(&self) -> &[BlockId] {
        &self.voxels
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [BlockId] {
        &mut self.voxels
    }

    pub fn non_air_count(&self) -> usize {
        self.voxels.iter().filter(|b| !b.is_air()).count()
    }

    pub fn is_released(&self) -> bool {
        self.voxels.is_empty()
    }

    fn release(&mut self) {
        self.voxels = Box::default();
    }
}

/// Facts recorded when a chunk's terrain is first produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub created_at: u64,
    pub last_modified: u64,
    pub seed: u64,
    pub has_structures: bool,
    pub needs_decoration: bool,
    pub has_entities: bool,
}

pub struct Chunk {
    position: ChunkPosition,
    blocks: RwLock<ChunkBlocks>,
    metadata: ChunkMetadata,
    last_modified: AtomicU64,
    needs_decoration: AtomicBool,
    features_populated: AtomicBool,
    pub(crate) state: ChunkStateMachine,
    pub(crate) dirty: DirtyTracker,
    mesh: ArcSwapOption<ChunkMesh>,
    gpu_handle: Mutex<Option<GpuHandle>>,
    // serializes capture+write so saves reach storage in capture order
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("position", &self.position)
            .field("state", &self.state.load())
            .field("mesh_dirty", &self.dirty.is_mesh_dirty())
            .field("data_dirty", &self.dirty.is_data_dirty())
            .finish()
    }
}

impl Chunk {
    pub(crate) fn new(
        position: ChunkPosition,
        blocks: ChunkBlocks,
        metadata: ChunkMetadata,
        features_populated: bool,
        state: ChunkState,
    ) -> Self {
        Self {
            position,
            blocks: RwLock::new(blocks),
            last_modified: AtomicU64::new(metadata.last_modified),
            needs_decoration: AtomicBool::new(metadata.needs_decoration),
            features_populated: AtomicBool::new(features_populated),
            metadata,
            state: ChunkStateMachine::new(state),
            dirty: DirtyTracker::default(),
            mesh: ArcSwapOption::empty(),
            gpu_handle: Mutex::new(None),
            save_lock: Mutex::new(()),
        }
    }

    pub(crate) fn from_persisted(position: ChunkPosition, persisted: PersistedChunk) -> Self {
        let PersistedChunk {
            blocks,
            features_populated,
            metadata,
        } = persisted;
        Self::new(
            position,
            blocks,
            metadata,
            features_populated,
            ChunkState::CREATED | ChunkState::BLOCKS_POPULATED,
        )
    }

    #[inline]
    pub fn position(&self) -> ChunkPosition {
        self.position
    }

    #[inline]
    pub fn state(&self) -> &ChunkStateMachine {
        &self.state
    }

    #[inline]
    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    pub fn read(&self) -> BlockReader<'_> {
        BlockReader::new(self.blocks.read())
    }

    pub fn write(&self) -> BlockWriter<'_> {
        BlockWriter::new(self.blocks.write(), self)
    }

    pub fn get_block(&self, lv: LocalVector) -> BlockId {
        self.blocks.read().get(lv)
    }

    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            last_modified: self.last_modified.load(Ordering::Relaxed),
            needs_decoration: self.needs_decoration.load(Ordering::Acquire),
            ..self.metadata.clone()
        }
    }

    pub fn features_populated(&self) -> bool {
        self.features_populated.load(Ordering::Acquire)
    }

    pub(crate) fn set_features_populated(&self) {
        self.features_populated.store(true, Ordering::Release);
        self.needs_decoration.store(false, Ordering::Release);
    }

    pub fn needs_decoration(&self) -> bool {
        self.needs_decoration.load(Ordering::Acquire) && !self.features_populated()
    }

    /// Both dirty flags, the mesh path and the modification stamp move together.
    pub(crate) fn mark_block_changed(&self) {
        self.dirty.mark_block_changed();
        self.state.mark_mesh_dirty();
        self.state.add(ChunkState::DATA_MODIFIED);
        self.last_modified.store(now_millis(), Ordering::Relaxed);
    }

    /// Seam changes next door: rebuild geometry, nothing to save.
    pub(crate) fn mark_mesh_dirty_only(&self) {
        self.dirty.mark_mesh_dirty_only();
        self.state.mark_mesh_dirty();
    }

    pub fn is_data_dirty(&self) -> bool {
        self.dirty.is_data_dirty()
    }

    pub(crate) fn save_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.save_lock.lock()
    }

    /// Copies the voxels for a save together with the edit epoch they correspond to.
    pub(crate) fn capture_for_save(&self) -> (PersistedChunk, DataEpoch) {
        let blocks = self.blocks.read();
        let epoch = self.dirty.data_epoch();
        let persisted = PersistedChunk {
            blocks: blocks.clone(),
            features_populated: self.features_populated(),
            metadata: self.metadata(),
        };
        (persisted, epoch)
    }

    pub(crate) fn acknowledge_save(&self, epoch: DataEpoch) -> bool {
        let cleared = self.dirty.clear_data_if_unchanged(epoch);
        if cleared {
            self.state.remove(ChunkState::DATA_MODIFIED);
        }
        cleared
    }

    pub fn mesh(&self) -> Option<Arc<ChunkMesh>> {
        self.mesh.load_full()
    }

    pub(crate) fn store_mesh(&self, mesh: Arc<ChunkMesh>) {
        self.mesh.store(Some(mesh));
    }

    pub(crate) fn is_current_mesh(&self, mesh: &Arc<ChunkMesh>) -> bool {
        match &*self.mesh.load() {
            Some(current) => Arc::ptr_eq(current, mesh),
            None => false,
        }
    }

    pub fn gpu_handle(&self) -> Option<GpuHandle> {
        *self.gpu_handle.lock()
    }

    /// Installs a new device handle and hands back the one it replaced.
    pub(crate) fn swap_gpu_handle(&self, handle: Option<GpuHandle>) -> Option<GpuHandle> {
        std::mem::replace(&mut *self.gpu_handle.lock(), handle)
    }

    /// Drops CPU-side data on unload. Returns the device handle still owed a release.
    pub(crate) fn release_resources(&self) -> Option<GpuHandle> {
        self.mesh.store(None);
        self.blocks.write().release();
        self.swap_gpu_handle(None)
    }
}

#[cfg(test)]
mod tests {
    use glam::IVec3;

    use super::*;

    fn chunk() -> Chunk {
        Chunk::new(
            ChunkPosition::new(1, 2),
            ChunkBlocks::default(),
            ChunkMetadata::default(),
            false,
            ChunkState::CREATED | ChunkState::BLOCKS_POPULATED,
        )
    }

    #[test]
    fn blocks_out_of_bounds_read_air() {
        let mut blocks = ChunkBlocks::filled(BlockId::of_type(3));
        assert_eq!(blocks.get(IVec3::new(0, 0, 0)), BlockId::of_type(3));
        assert_eq!(blocks.get(IVec3::new(16, 0, 0)), BlockId::AIR);
        assert_eq!(blocks.get(IVec3::new(0, -1, 0)), BlockId::AIR);
        assert_eq!(blocks.set(IVec3::new(0, 200, 0), BlockId::AIR), None);
        assert_eq!(blocks.set(IVec3::new(0, 0, 0), BlockId::of_type(3)), None);
        assert_eq!(
            blocks.set(IVec3::new(0, 0, 0), BlockId::AIR),
            Some(BlockId::of_type(3))
        );
    }

    #[test]
    fn from_voxels_checks_length() {
        assert!(ChunkBlocks::from_voxels(vec![BlockId::AIR; 10]).is_err());
        assert!(ChunkBlocks::from_voxels(vec![BlockId::AIR; CHUNK_VOLUME]).is_ok());
    }

    #[test]
    fn block_change_marks_everything() {
        let chunk = chunk();
        chunk.mark_block_changed();
        assert!(chunk.dirty().is_mesh_dirty());
        assert!(chunk.is_data_dirty());
        assert!(chunk.state().has_all(ChunkState::MESH_DIRTY | ChunkState::DATA_MODIFIED));
        assert!(chunk.metadata().last_modified > 0);
    }

    #[test]
    fn save_ack_respects_later_edits() {
        let chunk = chunk();
        chunk.mark_block_changed();
        let (_, epoch) = chunk.capture_for_save();
        chunk.mark_block_changed();
        assert!(!chunk.acknowledge_save(epoch));
        assert!(chunk.is_data_dirty());

        let (_, epoch) = chunk.capture_for_save();
        assert!(chunk.acknowledge_save(epoch));
        assert!(!chunk.is_data_dirty());
        assert!(!chunk.state().has_any(ChunkState::DATA_MODIFIED));
    }

    #[test]
    fn release_keeps_reads_safe() {
        let chunk = chunk();
        chunk.store_mesh(Arc::new(ChunkMesh::default()));
        chunk.swap_gpu_handle(Some(GpuHandle(7)));

        assert_eq!(chunk.release_resources(), Some(GpuHandle(7)));
        assert!(chunk.mesh().is_none());
        assert!(chunk.gpu_handle().is_none());
        assert_eq!(chunk.get_block(IVec3::new(1, 1, 1)), BlockId::AIR);
    }

    #[test]
    fn current_mesh_identity() {
        let chunk = chunk();
        let first = Arc::new(ChunkMesh::default());
        let second = Arc::new(ChunkMesh::default());
        chunk.store_mesh(first.clone());
        assert!(chunk.is_current_mesh(&first));
        chunk.store_mesh(second.clone());
        assert!(!chunk.is_current_mesh(&first));
        assert!(chunk.is_current_mesh(&second));
    }
}
