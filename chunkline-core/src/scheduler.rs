use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender};
use fxhash::FxHashSet;
use log::{debug, warn};

use crate::{
    block::HORIZONTAL_FACES,
    chunk::Chunk,
    config::MeshSchedulerConfig,
    coords::ChunkPosition,
    error::MeshError,
    meshing::{ChunkMesh, MeshBuilder, MeshScratchPool, NeighborBoundaries},
    metrics::ChunkMetric,
    state::ChunkState,
    store::ChunkStore,
    upload::{UploadPriority, UploadRejected, UploadRequest},
};

struct MeshTaskResult {
    pos: ChunkPosition,
    chunk: Weak<Chunk>,
    built: Result<ChunkMesh, MeshError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshTickStats {
    pub completed: usize,
    pub failed: usize,
    pub dispatched: usize,
    /// Uploads submitted this tick, fresh and retried.
    pub submitted: usize,
    /// Uploads the queue turned away; they are retried next tick.
    pub rejected: usize,
}

/// Picks dirty chunks near the player, builds their meshes on the store's workers
/// and hands finished meshes to the uploader. Driven from the simulation thread.
pub struct MeshScheduler {
    config: MeshSchedulerConfig,
    builder: Arc<dyn MeshBuilder>,
    scratch: Arc<MeshScratchPool>,
    in_flight: FxHashSet<ChunkPosition>,
    results_tx: Sender<MeshTaskResult>,
    results_rx: Receiver<MeshTaskResult>,
    rejected: Vec<UploadRejected>,
}

impl MeshScheduler {
    pub fn new(config: MeshSchedulerConfig, builder: Arc<dyn MeshBuilder>) -> Self {
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        Self {
            scratch: Arc::new(MeshScratchPool::new(config.scratch_buffers)),
            config,
            builder,
            in_flight: FxHashSet::default(),
            results_tx,
            results_rx,
            rejected: Vec::new(),
        }
    }

    pub fn config(&self) -> &MeshSchedulerConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn awaiting_retry(&self) -> usize {
        self.rejected.len()
    }

    #[cfg_attr(feature = "profile", tracing::instrument(skip(self, store)))]
    pub fn tick(&mut self, store: &ChunkStore, player: ChunkPosition) -> MeshTickStats {
        let mut stats = MeshTickStats::default();
        self.retry_rejected(store, player, &mut stats);
        self.apply_results(store, player, &mut stats);
        self.dispatch(store, player, &mut stats);
        stats
    }

    /// Drops retry state for a chunk that is leaving.
    pub fn forget(&mut self, pos: ChunkPosition) {
        self.rejected.retain(|rejected| rejected.request.pos != pos);
    }

    fn submit(
        &mut self,
        store: &ChunkStore,
        request: UploadRequest,
        priority: UploadPriority,
        stats: &mut MeshTickStats,
    ) {
        match store.uploader().submit(request, priority) {
            Ok(_) => stats.submitted += 1,
            Err(rejected) => {
                stats.rejected += 1;
                self.rejected.push(rejected);
            }
        }
    }

    fn priority_for(&self, pos: ChunkPosition, player: ChunkPosition) -> UploadPriority {
        UploadPriority::from_distance(pos.chebyshev_distance(player), self.config.render_distance)
    }

    fn retry_rejected(
        &mut self,
        store: &ChunkStore,
        player: ChunkPosition,
        stats: &mut MeshTickStats,
    ) {
        for rejected in std::mem::take(&mut self.rejected) {
            let request = rejected.request;
            // superseded by a newer build, or gone
            let current = request.chunk.upgrade().is_some_and(|chunk| {
                !chunk.state().has_any(ChunkState::UNLOADING) && chunk.is_current_mesh(&request.mesh)
            });
            if !current {
                continue;
            }
            let priority = self.priority_for(request.pos, player);
            self.submit(store, request, priority, stats);
        }
    }

    fn apply_results(
        &mut self,
        store: &ChunkStore,
        player: ChunkPosition,
        stats: &mut MeshTickStats,
    ) {
        while let Ok(result) = self.results_rx.try_recv() {
            let pos = result.pos;
            self.in_flight.remove(&pos);

            let Some(chunk) = result.chunk.upgrade() else {
                continue;
            };
            if chunk.state().has_any(ChunkState::UNLOADING) {
                continue;
            }

            match result.built {
                Ok(mesh) => {
                    let mesh = Arc::new(mesh);
                    // the uploaded mesh keeps rendering until this one replaces it
                    chunk.store_mesh(mesh.clone());
                    chunk.state().complete_mesh_build();
                    stats.completed += 1;

                    let priority = self.priority_for(pos, player);
                    self.submit(store, UploadRequest::new(&chunk, mesh), priority, stats);
                }
                Err(e) => {
                    warn!("meshing chunk {pos} failed: {e}");
                    chunk.state().fail_mesh_build();
                    chunk.dirty().mark_mesh_dirty_only();
                    stats.failed += 1;
                }
            }
        }
    }

    fn dispatch(&mut self, store: &ChunkStore, player: ChunkPosition, stats: &mut MeshTickStats) {
        let started = Instant::now();
        let budget = self.config.dispatch_budget();

        for (pos, chunk) in store.get_chunks_in_render_distance(player, self.config.border_distance)
        {
            if stats.dispatched >= self.config.max_dispatch_per_tick
                || self.in_flight.len() >= self.config.max_in_flight
                || started.elapsed() > budget
            {
                break;
            }
            if self.in_flight.contains(&pos) || !chunk.state().begin_mesh_build() {
                continue;
            }
            chunk.dirty().check_and_clear_mesh();

            let blocks = chunk.read().blocks().clone();
            let mut seams = NeighborBoundaries::default();
            for face in HORIZONTAL_FACES {
                if let Some(neighbor) = store.get_chunk(pos.across(face)) {
                    seams.capture(face, neighbor.read().blocks());
                }
            }

            self.in_flight.insert(pos);
            stats.dispatched += 1;

            let builder = self.builder.clone();
            let scratch_pool = self.scratch.clone();
            let metrics = store.metrics().clone();
            let results = self.results_tx.clone();
            let weak = Arc::downgrade(&chunk);
            store.spawn(move || {
                let mut scratch = scratch_pool.acquire();
                let built = panic::catch_unwind(AssertUnwindSafe(|| {
                    metrics
                        .get(ChunkMetric::Mesh)
                        .time(|| builder.build_mesh(pos, &blocks, &seams, &mut scratch))
                }));
                let built = match built {
                    Ok(built) => {
                        scratch_pool.release(scratch);
                        built
                    }
                    Err(_) => Err(MeshError::Panicked),
                };
                results
                    .send(MeshTaskResult {
                        pos,
                        chunk: weak,
                        built,
                    })
                    .ok();
            });
        }

        if stats.dispatched > 0 {
            debug!(
                "dispatched {} mesh builds ({} in flight)",
                stats.dispatched,
                self.in_flight.len()
            );
        }
    }
}
