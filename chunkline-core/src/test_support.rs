//! Fixtures shared by the in-crate tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use block_mesh::VoxelVisibility;
use dashmap::DashMap;
use glam::IVec3;
use parking_lot::{Condvar, Mutex};

use crate::{
    block::{BlockId, BlockMeta, BlockTypeId, ChunkVoxel},
    chunk::{Chunk, ChunkBlocks},
    coords::{CHUNK_SIZE, ChunkPosition},
    error::{DeviceError, GenerationError, StorageError},
    generation::{FeatureContext, TerrainGenerator, TerrainInfo},
    meshing::ChunkMesh,
    storage::{ChunkPersistence, MemoryChunkStore, PersistedChunk},
    store::ChunkListener,
    upload::{GpuHandle, GraphicsDevice},
};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum TestVoxels {
    #[default]
    Air,
    Stone,
    Water,
    Log,
}

impl TestVoxels {
    pub const STONE: BlockTypeId = TestVoxels::Stone as BlockTypeId;
    pub const WATER: BlockTypeId = TestVoxels::Water as BlockTypeId;
    pub const LOG: BlockTypeId = TestVoxels::Log as BlockTypeId;
}

impl From<BlockTypeId> for TestVoxels {
    fn from(value: BlockTypeId) -> Self {
        match value {
            1 => TestVoxels::Stone,
            2 => TestVoxels::Water,
            3 => TestVoxels::Log,
            _ => TestVoxels::Air,
        }
    }
}

impl From<TestVoxels> for BlockTypeId {
    fn from(value: TestVoxels) -> Self {
        value as BlockTypeId
    }
}

impl ChunkVoxel for TestVoxels {
    fn name(&self) -> &'static str {
        match self {
            TestVoxels::Air => "air",
            TestVoxels::Stone => "stone",
            TestVoxels::Water => "water",
            TestVoxels::Log => "log",
        }
    }

    fn visibility(&self) -> VoxelVisibility {
        match self {
            TestVoxels::Air => VoxelVisibility::Empty,
            TestVoxels::Water => VoxelVisibility::Translucent,
            _ => VoxelVisibility::Opaque,
        }
    }

    fn is_transient(&self, meta: BlockMeta) -> bool {
        matches!(self, TestVoxels::Water) && meta > 0
    }
}

/// Blocks every caller until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cvar: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pass(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.cvar.wait(&mut open);
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cvar.notify_all();
    }

    /// Spins until `n` callers have reached the gate.
    pub fn wait_for_waiters(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.waiting.load(Ordering::SeqCst) < n {
            assert!(Instant::now() < deadline, "nobody reached the gate");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Stone up to `height`, optionally asking for decoration. Decoration stamps a
/// log at the far corner of the 2×2 window so it lands in the south-east chunk.
pub struct FlatGenerator {
    pub height: i32,
    pub decorate: bool,
    pub gate: Option<Arc<Gate>>,
    pub fail_at: Option<ChunkPosition>,
    pub panic_at: Option<ChunkPosition>,
    pub generated: DashMap<ChunkPosition, usize>,
    pub decorated: DashMap<ChunkPosition, usize>,
}

impl Default for FlatGenerator {
    fn default() -> Self {
        Self {
            height: 4,
            decorate: false,
            gate: None,
            fail_at: None,
            panic_at: None,
            generated: DashMap::new(),
            decorated: DashMap::new(),
        }
    }
}

impl FlatGenerator {
    pub const SEED: u64 = 77;

    pub fn decorating() -> Self {
        Self {
            decorate: true,
            ..Default::default()
        }
    }

    pub fn gated(gate: Arc<Gate>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    pub fn generated_at(&self, pos: ChunkPosition) -> usize {
        self.generated.get(&pos).map(|n| *n).unwrap_or(0)
    }

    pub fn total_generated(&self) -> usize {
        self.generated.iter().map(|n| *n.value()).sum()
    }

    pub fn decorated_at(&self, pos: ChunkPosition) -> usize {
        self.decorated.get(&pos).map(|n| *n).unwrap_or(0)
    }
}

impl TerrainGenerator for FlatGenerator {
    fn seed(&self) -> u64 {
        Self::SEED
    }

    fn generate_terrain(
        &self,
        pos: ChunkPosition,
        blocks: &mut ChunkBlocks,
    ) -> Result<TerrainInfo, GenerationError> {
        *self.generated.entry(pos).or_insert(0) += 1;
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if self.panic_at == Some(pos) {
            panic!("generator blew up at {pos}");
        }
        if self.fail_at == Some(pos) {
            return Err(GenerationError::Terrain(format!("no terrain at {pos}")));
        }

        let stone = BlockId::of_type(TestVoxels::STONE);
        for y in 0..self.height {
            for z in 0..CHUNK_SIZE {
                for x in 0..CHUNK_SIZE {
                    blocks.set(IVec3::new(x, y, z), stone);
                }
            }
        }

        Ok(TerrainInfo {
            needs_decoration: self.decorate,
            ..Default::default()
        })
    }

    fn populate_features(&self, ctx: &mut FeatureContext<'_>) -> Result<(), GenerationError> {
        *self.decorated.entry(ctx.origin()).or_insert(0) += 1;
        let corner = FeatureContext::SPAN - 1;
        ctx.place(
            IVec3::new(corner, self.height, corner),
            BlockId::of_type(TestVoxels::LOG),
        );
        Ok(())
    }
}

/// In-memory persistence whose saves can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryChunkStore,
    pub fail_saves: AtomicBool,
    pub fail_loads: AtomicBool,
}

impl FlakyStore {
    fn broken() -> StorageError {
        StorageError::Compression(std::io::Error::other("disk unplugged"))
    }
}

impl ChunkPersistence for FlakyStore {
    fn load_chunk(&self, pos: ChunkPosition) -> Result<Option<PersistedChunk>, StorageError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Self::broken());
        }
        self.inner.load_chunk(pos)
    }

    fn save_chunk(&self, pos: ChunkPosition, chunk: &PersistedChunk) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Self::broken());
        }
        self.inner.save_chunk(pos, chunk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    Loaded(ChunkPosition),
    Unloaded(ChunkPosition),
}

/// Records listener callbacks, whether the chunk was already on disk when its
/// unload was announced, and how many solid blocks it still held at that point.
pub struct RecordingListener {
    pub events: Mutex<Vec<ListenerEvent>>,
    pub saved_before_unload: Mutex<Vec<bool>>,
    pub solid_at_unload: Mutex<Vec<usize>>,
    store: Option<Arc<FlakyStore>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            saved_before_unload: Mutex::new(Vec::new()),
            solid_at_unload: Mutex::new(Vec::new()),
            store: None,
        })
    }

    pub fn watching(store: Arc<FlakyStore>) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            saved_before_unload: Mutex::new(Vec::new()),
            solid_at_unload: Mutex::new(Vec::new()),
            store: Some(store),
        })
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }
}

impl ChunkListener for RecordingListener {
    fn on_chunk_loaded(&self, chunk: &Arc<Chunk>) {
        self.events
            .lock()
            .push(ListenerEvent::Loaded(chunk.position()));
    }

    fn on_chunk_unloaded(&self, chunk: &Arc<Chunk>) {
        let pos = chunk.position();
        if let Some(store) = &self.store {
            self.saved_before_unload
                .lock()
                .push(store.inner.contains(pos));
        }
        self.solid_at_unload
            .lock()
            .push(chunk.read().blocks().non_air_count());
        self.events.lock().push(ListenerEvent::Unloaded(pos));
    }
}

/// Hands out sequential handles and remembers every call.
#[derive(Default)]
pub struct FakeDevice {
    pub uploads: Vec<ChunkPosition>,
    pub released: Vec<GpuHandle>,
    pub fail_uploads: bool,
    pub next: u64,
}

impl FakeDevice {
    /// Handles uploaded and not yet released.
    pub fn live(&self) -> usize {
        self.uploads.len() - self.released.len()
    }
}

impl GraphicsDevice for FakeDevice {
    fn upload(&mut self, pos: ChunkPosition, _mesh: &ChunkMesh) -> Result<GpuHandle, DeviceError> {
        if self.fail_uploads {
            return Err(DeviceError::OutOfMemory);
        }
        self.uploads.push(pos);
        self.next += 1;
        Ok(GpuHandle(self.next))
    }

    fn release(&mut self, handle: GpuHandle) {
        self.released.push(handle);
    }
}

/// Polls `cond` until it holds or a generous deadline passes.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
