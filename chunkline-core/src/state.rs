use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Lifecycle tags carried by a chunk. Tags are not exclusive; a chunk usually
    /// carries several at once (e.g. `ACTIVE | READY | MESH_GPU_UPLOADED | MESH_DIRTY`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChunkState: u16 {
        const CREATED            = 1 << 0;
        const BLOCKS_POPULATED   = 1 << 1;
        const FEATURES_POPULATED = 1 << 2;
        const MESH_DIRTY         = 1 << 3;
        const MESH_GENERATING    = 1 << 4;
        const MESH_CPU_READY     = 1 << 5;
        const MESH_GPU_UPLOADED  = 1 << 6;
        const DATA_MODIFIED      = 1 << 7;
        const UNLOADING          = 1 << 8;
        const READY              = 1 << 9;
        const ACTIVE             = 1 << 10;
        const UNLOADED           = 1 << 11;
    }
}

impl ChunkState {
    pub const EMPTY: Self = Self::empty();

    #[inline]
    pub fn is_renderable(self) -> bool {
        self.contains(Self::MESH_GPU_UPLOADED) && !self.contains(Self::UNLOADING)
    }

    #[inline]
    pub fn needs_mesh_rebuild(self) -> bool {
        self.contains(Self::MESH_DIRTY) && !self.intersects(Self::MESH_GENERATING | Self::UNLOADING)
    }

    #[inline]
    pub fn is_mesh_upload_ready(self) -> bool {
        self.contains(Self::MESH_CPU_READY)
            && !self.intersects(Self::MESH_GENERATING | Self::UNLOADING)
    }
}

/// Lock-free tag set. Every mutation is a compare-and-swap over the whole set so
/// readers never observe a half-applied transition.
#[derive(Debug)]
pub struct ChunkStateMachine {
    bits: AtomicU16,
}

impl Default for ChunkStateMachine {
    fn default() -> Self {
        Self::new(ChunkState::EMPTY)
    }
}

impl ChunkStateMachine {
    pub fn new(initial: ChunkState) -> Self {
        Self {
            bits: AtomicU16::new(initial.bits()),
        }
    }

    #[inline]
    pub fn load(&self) -> ChunkState {
        ChunkState::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    /// Applies `f` in a CAS retry loop. `f` returning `None` aborts without writing.
    /// Returns the previous set on success, the observed set on abort.
    pub fn update<F>(&self, mut f: F) -> Result<ChunkState, ChunkState>
    where
        F: FnMut(ChunkState) -> Option<ChunkState>,
    {
        self.bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                f(ChunkState::from_bits_retain(bits)).map(|next| next.bits())
            })
            .map(ChunkState::from_bits_retain)
            .map_err(ChunkState::from_bits_retain)
    }

    pub fn add(&self, tags: ChunkState) -> ChunkState {
        match self.update(|state| Some(state | tags)) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    pub fn remove(&self, tags: ChunkState) -> ChunkState {
        match self.update(|state| Some(state - tags)) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Swaps `from` for `to` in one step. Fails if any tag of `from` is absent.
    pub fn transition(&self, from: ChunkState, to: ChunkState) -> bool {
        self.update(|state| state.contains(from).then(|| (state - from) | to))
            .is_ok()
    }

    #[inline]
    pub fn has_any(&self, tags: ChunkState) -> bool {
        self.load().intersects(tags)
    }

    #[inline]
    pub fn has_all(&self, tags: ChunkState) -> bool {
        self.load().contains(tags)
    }

    #[inline]
    pub fn is_renderable(&self) -> bool {
        self.load().is_renderable()
    }

    #[inline]
    pub fn needs_mesh_rebuild(&self) -> bool {
        self.load().needs_mesh_rebuild()
    }

    #[inline]
    pub fn is_mesh_upload_ready(&self) -> bool {
        self.load().is_mesh_upload_ready()
    }

    /// Re-enters the mesh path after an edit. The uploaded mesh tag survives so the
    /// previous geometry keeps rendering while the rebuild runs.
    pub fn mark_mesh_dirty(&self) {
        let _ = self.update(|state| Some((state | ChunkState::MESH_DIRTY) - ChunkState::MESH_CPU_READY));
    }

    /// `MESH_DIRTY -> MESH_GENERATING`, only when a rebuild is actually owed.
    pub fn begin_mesh_build(&self) -> bool {
        self.update(|state| {
            state
                .needs_mesh_rebuild()
                .then(|| (state - ChunkState::MESH_DIRTY) | ChunkState::MESH_GENERATING)
        })
        .is_ok()
    }

    /// `MESH_GENERATING -> MESH_CPU_READY`.
    pub fn complete_mesh_build(&self) -> bool {
        self.transition(ChunkState::MESH_GENERATING, ChunkState::MESH_CPU_READY)
    }

    /// `MESH_GENERATING -> MESH_DIRTY`, leaving the chunk retryable.
    pub fn fail_mesh_build(&self) -> bool {
        self.transition(ChunkState::MESH_GENERATING, ChunkState::MESH_DIRTY)
    }

    /// Records a finished device upload. `MESH_CPU_READY` may already be gone if an
    /// edit landed after the build; the upload still counts.
    pub fn mark_uploaded(&self) {
        let _ = self.update(|state| {
            Some((state - ChunkState::MESH_CPU_READY) | ChunkState::MESH_GPU_UPLOADED)
        });
    }

    /// Tags the chunk as leaving the store. Returns `false` if it already was.
    pub fn begin_unload(&self) -> bool {
        self.update(|state| {
            (!state.contains(ChunkState::UNLOADING))
                .then(|| (state | ChunkState::UNLOADING) - ChunkState::ACTIVE)
        })
        .is_ok()
    }

    /// Terminal state once resources are gone.
    pub fn finish_unload(&self) {
        let _ = self.update(|state| {
            Some(
                (state | ChunkState::UNLOADED)
                    - (ChunkState::MESH_GPU_UPLOADED
                        | ChunkState::MESH_CPU_READY
                        | ChunkState::MESH_DIRTY
                        | ChunkState::DATA_MODIFIED),
            )
        });
    }
}

const DATA_DIRTY_BIT: u64 = 1 << 63;
const EPOCH_MASK: u64 = !DATA_DIRTY_BIT;

/// Snapshot of the data-dirty word taken when a save captures the voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEpoch(u64);

impl DataEpoch {
    pub fn is_dirty(self) -> bool {
        self.0 & DATA_DIRTY_BIT != 0
    }

    /// Number of data edits recorded so far (wrapping).
    pub fn edits(self) -> u64 {
        self.0 & EPOCH_MASK
    }
}

/// Two independent dirty flags. The data flag shares its atomic word with an edit
/// counter so a finished save can clear it only if nothing changed since the snapshot.
#[derive(Debug)]
pub struct DirtyTracker {
    mesh: AtomicBool,
    data: AtomicU64,
}

impl Default for DirtyTracker {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl DirtyTracker {
    pub fn new(mesh_dirty: bool, data_dirty: bool) -> Self {
        Self {
            mesh: AtomicBool::new(mesh_dirty),
            data: AtomicU64::new(if data_dirty { DATA_DIRTY_BIT } else { 0 }),
        }
    }

    pub fn mark_block_changed(&self) {
        self.mark_mesh_dirty_only();
        self.mark_data_dirty_only();
    }

    pub fn mark_mesh_dirty_only(&self) {
        self.mesh.store(true, Ordering::Release);
    }

    pub fn mark_data_dirty_only(&self) {
        let _ = self
            .data
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(((word & EPOCH_MASK).wrapping_add(1) & EPOCH_MASK) | DATA_DIRTY_BIT)
            });
    }

    #[inline]
    pub fn is_mesh_dirty(&self) -> bool {
        self.mesh.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_data_dirty(&self) -> bool {
        self.data.load(Ordering::Acquire) & DATA_DIRTY_BIT != 0
    }

    pub fn check_and_clear_mesh(&self) -> bool {
        self.mesh.swap(false, Ordering::AcqRel)
    }

    pub fn check_and_clear_data(&self) -> bool {
        self.data.fetch_and(!DATA_DIRTY_BIT, Ordering::AcqRel) & DATA_DIRTY_BIT != 0
    }

    pub fn data_epoch(&self) -> DataEpoch {
        DataEpoch(self.data.load(Ordering::Acquire))
    }

    /// Clears the data flag after a save acknowledged the snapshot taken at `epoch`.
    /// Returns `false` when an edit landed in between; the chunk stays dirty.
    pub fn clear_data_if_unchanged(&self, epoch: DataEpoch) -> bool {
        if !epoch.is_dirty() {
            return true;
        }

        self.data
            .compare_exchange(
                epoch.0,
                epoch.0 & !DATA_DIRTY_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
