mod generator;
mod voxels;

use std::{
    collections::HashMap,
    env,
    fmt::Display,
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chunkline_core::{
    block::BlockId,
    chunk::Chunk,
    config::WorldConfig,
    coords::{CHUNK_HEIGHT, ChunkPosition},
    error::{ChunkError, DeviceError, report},
    generation::PersistTransient,
    glam::{IVec3, Vec3},
    meshing::{ChunkMesh, GreedyMesher},
    metrics::MetricsPrinter,
    storage::SledChunkStore,
    store::{ChunkListener, ChunkStore},
    upload::{GpuHandle, GraphicsDevice},
    world::ChunkWorld,
};
use dashmap::DashMap;
use log::{debug, error, info};

use crate::{generator::WorldGenerator, voxels::DemoVoxels};

const SEED: u64 = 0x5EED;
const FRAMES: u32 = 600;
const FRAME_TIME: Duration = Duration::from_millis(16);
const WALK_SPEED: f32 = 0.6;
const DIG_EVERY: u32 = 90;
const DEVICE_QUAD_BUDGET: usize = 4_000_000;

#[derive(Debug, Clone, Copy)]
struct Entity {
    id: u64,
    position: Vec3,
}

/// Spawns a critter on grassy columns and despawns it with its chunk.
#[derive(Default)]
struct EntityTracker {
    entities: DashMap<ChunkPosition, Vec<Entity>>,
    next_id: AtomicU64,
}

impl EntityTracker {
    fn live(&self) -> usize {
        self.entities.iter().map(|e| e.value().len()).sum()
    }

    fn despawn(&self, pos: ChunkPosition) -> usize {
        self.entities
            .remove(&pos)
            .map_or(0, |(_, gone)| gone.len())
    }
}

impl ChunkListener for EntityTracker {
    fn on_chunk_loaded(&self, chunk: &Arc<Chunk>) {
        if !chunk.metadata().has_entities {
            return;
        }
        let origin = chunk.position().world_origin();
        let entity = Entity {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            position: origin.as_vec3() + Vec3::new(8.5, CHUNK_HEIGHT as f32, 8.5),
        };
        debug!("spawned entity {} at {}", entity.id, entity.position);
        self.entities
            .entry(chunk.position())
            .or_default()
            .push(entity);
    }

    fn on_chunk_unloaded(&self, chunk: &Arc<Chunk>) {
        let pos = chunk.position();
        let gone = self.despawn(pos);
        if gone > 0 {
            debug!("despawned {gone} entities with {pos}");
        }
    }
}

/// Stand-in for a GPU: hands out handles and tracks how many quads are resident.
struct CountingDevice {
    next: u64,
    resident: HashMap<GpuHandle, usize>,
    resident_quads: usize,
    budget_quads: usize,
}

impl CountingDevice {
    fn new(budget_quads: usize) -> Self {
        Self {
            next: 0,
            resident: HashMap::new(),
            resident_quads: 0,
            budget_quads,
        }
    }
}

impl GraphicsDevice for CountingDevice {
    fn upload(&mut self, _pos: ChunkPosition, mesh: &ChunkMesh) -> Result<GpuHandle, DeviceError> {
        let quads = mesh.quad_count();
        if self.resident_quads + quads > self.budget_quads {
            return Err(DeviceError::OutOfMemory);
        }
        self.next += 1;
        let handle = GpuHandle(self.next);
        self.resident.insert(handle, quads);
        self.resident_quads += quads;
        Ok(handle)
    }

    fn release(&mut self, handle: GpuHandle) {
        if let Some(quads) = self.resident.remove(&handle) {
            self.resident_quads -= quads;
        }
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        error!("{}", report(e.as_ref()));
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let config: WorldConfig = match args.next() {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => WorldConfig::default(),
    };
    let persistence = Arc::new(match args.next().map(PathBuf::from) {
        Some(world_dir) => {
            let store = SledChunkStore::open(&world_dir)?;
            info!("opened {} ({} chunks on disk)", world_dir.display(), store.len());
            store
        }
        None => {
            info!("no world directory given, using a throwaway one");
            SledChunkStore::temporary()?
        }
    });

    let builder = ChunkStore::builder(Arc::new(WorldGenerator::new(SEED)), persistence)
        .with_policy(PersistTransient::<DemoVoxels>::default());
    let mut world = ChunkWorld::new(config, builder, Arc::new(GreedyMesher::<DemoVoxels>::new()))?;
    let tracker = Arc::new(EntityTracker::default());
    world.store().add_listener(tracker.clone());

    let spawn = Vec3::new(8.0, 64.0, 8.0);
    let loaded = world.bootstrap(spawn, 1)?;
    info!("bootstrapped {loaded} chunks around spawn");

    let mut device = CountingDevice::new(DEVICE_QUAD_BUDGET);
    let mut printer = MetricsPrinter::new(Duration::from_secs(2));
    let mut player = spawn;
    let mut last_frame = Duration::ZERO;

    for frame in 0..FRAMES {
        let started = Instant::now();
        player.x += WALK_SPEED;

        let stats = world.tick(player, last_frame)?;
        if stats.unloads_started > 0 {
            debug!("frame {frame}: {stats:?}");
        }
        if frame % DIG_EVERY == DIG_EVERY / 2 {
            let removed = dig(&world, player)?;
            debug!("dug {removed} blocks under {player}");
        }

        world.process_uploads(&mut device);

        let phases: &dyn Display = world.store().metrics().as_ref();
        let flow: &dyn Display = world.flow_metrics();
        printer.batch_print(&[phases, flow]);

        last_frame = started.elapsed();
        if let Some(rest) = FRAME_TIME.checked_sub(last_frame) {
            thread::sleep(rest);
        }
    }

    info!(
        "walked to {player}: {} chunks loaded, {} entities, {} quads resident",
        world.store().loaded_count(),
        tracker.live(),
        device.resident_quads
    );

    let summary = world.shutdown()?;
    info!(
        "shut down: saved {} chunks, cancelled {} tasks and {} uploads",
        summary.saved_chunks, summary.cancelled_tasks, summary.cancelled_uploads
    );
    Ok(())
}

/// Carves a small pit into the ground below `at`.
fn dig(world: &ChunkWorld, at: Vec3) -> Result<usize, ChunkError> {
    let column = at.floor().as_ivec3();
    let Some(ground) = (0..CHUNK_HEIGHT).rev().find(|y| {
        world
            .get_block(IVec3::new(column.x, *y, column.z))
            .is_some_and(|b| !b.is_air())
    }) else {
        return Ok(0);
    };

    let mut removed = 0;
    for dy in -2..=0 {
        for dz in -1..=1 {
            for dx in -1..=1 {
                let wv = IVec3::new(column.x + dx, ground + dy, column.z + dz);
                match world.set_block(wv, BlockId::AIR) {
                    Ok(true) => removed += 1,
                    Ok(false) | Err(ChunkError::NotLoaded(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_tracks_resident_handles() {
        let mut device = CountingDevice::new(0);
        let mesh = ChunkMesh::default();
        let first = device.upload(ChunkPosition::ORIGIN, &mesh).unwrap();
        let second = device.upload(ChunkPosition::new(1, 0), &mesh).unwrap();
        assert_ne!(first, second);

        device.release(first);
        device.release(first);
        assert_eq!(device.resident.len(), 1);
        assert_eq!(device.resident_quads, 0);
    }

    #[test]
    fn tracker_despawns_with_the_chunk() {
        let tracker = EntityTracker::default();
        tracker.entities.insert(
            ChunkPosition::new(2, 3),
            vec![Entity {
                id: 0,
                position: Vec3::ZERO,
            }],
        );
        assert_eq!(tracker.live(), 1);
        assert_eq!(tracker.despawn(ChunkPosition::new(2, 3)), 1);
        assert_eq!(tracker.despawn(ChunkPosition::new(2, 3)), 0);
        assert_eq!(tracker.live(), 0);
    }
}
