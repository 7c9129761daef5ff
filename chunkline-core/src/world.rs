use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use glam::Vec3;
use log::info;

use crate::{
    block::BlockId,
    config::WorldConfig,
    coords::{ChunkPosition, WorldVector, camera_vec3_to_cp},
    error::ChunkResult,
    features::FeatureBatchStats,
    meshing::MeshBuilder,
    metrics::{ChunkMetrics, FlowMetric, FlowMetrics},
    scheduler::{MeshScheduler, MeshTickStats},
    store::{ChunkStore, ChunkStoreBuilder, ShutdownReport},
    task::UnloadHandle,
    upload::{AsyncUploader, GraphicsDevice, UploadStats},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldTickStats {
    pub requested: usize,
    pub became_live: usize,
    pub unloads_started: usize,
    pub unloads_finished: usize,
    pub autosaves: usize,
    pub features: FeatureBatchStats,
    pub mesh: MeshTickStats,
}

/// Streams chunks around a moving player: requests what is in range, unloads what
/// fell out of it, decorates, meshes and queues uploads. `tick` runs on the
/// simulation thread, `process_uploads` on the render thread.
pub struct ChunkWorld {
    config: WorldConfig,
    store: ChunkStore,
    scheduler: MeshScheduler,
    unloading: Vec<UnloadHandle>,
    last_autosave: Instant,
    flow: FlowMetrics,
}

impl ChunkWorld {
    /// Builds the store from `builder`, overriding its config, uploader and
    /// metrics with ones derived from `config`.
    pub fn new(
        config: WorldConfig,
        builder: ChunkStoreBuilder,
        mesher: Arc<dyn MeshBuilder>,
    ) -> ChunkResult<Self> {
        let metrics = Arc::new(ChunkMetrics::new());
        let uploader = Arc::new(AsyncUploader::new(config.upload.clone(), metrics.clone()));
        let store = builder
            .with_config(config.store.clone())
            .with_metrics(metrics)
            .with_uploader(uploader)
            .build()?;
        let scheduler = MeshScheduler::new(config.mesh.clone(), mesher);

        info!(
            "world up, render distance {} (mesh border {})",
            config.mesh.render_distance, config.mesh.border_distance
        );

        Ok(Self {
            config,
            store,
            scheduler,
            unloading: Vec::new(),
            last_autosave: Instant::now(),
            flow: FlowMetrics::new(),
        })
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn flow_metrics(&self) -> &FlowMetrics {
        &self.flow
    }

    pub fn unloads_in_progress(&self) -> usize {
        self.unloading.len()
    }

    pub fn get_block(&self, wv: WorldVector) -> Option<BlockId> {
        self.store.get_block(wv)
    }

    pub fn set_block(&self, wv: WorldVector, block: BlockId) -> ChunkResult<bool> {
        self.store.set_block(wv, block)
    }

    /// Loads the chunks around `spawn` before the first frame.
    pub fn bootstrap(&self, spawn: Vec3, radius: u32) -> ChunkResult<usize> {
        let center = camera_vec3_to_cp(spawn);
        let mut loaded = 0;
        for pos in ring_order(center, radius) {
            self.store.get_or_create_chunk_blocking(pos)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    #[cfg_attr(feature = "profile", tracing::instrument(skip(self)))]
    pub fn tick(&mut self, player: Vec3, last_frame: Duration) -> ChunkResult<WorldTickStats> {
        let center = camera_vec3_to_cp(player);
        let render = self.config.mesh.render_distance;
        let mut stats = WorldTickStats::default();

        self.reap_unloads(&mut stats);

        let keep = render + self.config.unload_margin;
        for pos in self.store.loaded_positions() {
            if pos.chebyshev_distance(center) <= keep {
                continue;
            }
            if let Some(handle) = self.store.unload_chunk(pos) {
                self.scheduler.forget(pos);
                self.unloading.push(handle);
                stats.unloads_started += 1;
            }
        }

        let unloaded = self.flow.get(FlowMetric::Unloaded);
        unloaded.record(stats.unloads_finished as u64);
        if self.unloading.is_empty() {
            unloaded.end();
        } else {
            unloaded.start();
        }

        for pos in ring_order(center, render) {
            if self.store.has_chunk(pos) {
                continue;
            }
            stats.requested += 1;
            // a failed load or generate stops the world with its position and cause
            if self.store.get_or_create_chunk(pos)?.is_some() {
                stats.became_live += 1;
            }
        }

        let streamed = self.flow.get(FlowMetric::Streamed);
        if stats.requested > 0 {
            streamed.start();
        }
        streamed.record(stats.became_live as u64);
        if self.store.pending_count() == 0 {
            streamed.end();
        }

        stats.features = self.store.process_pending_feature_population(last_frame);
        stats.mesh = self.scheduler.tick(&self.store, center);

        if let Some(interval) = self.config.store.autosave_interval()
            && self.last_autosave.elapsed() >= interval
        {
            stats.autosaves = self.store.save_dirty_chunks();
            self.last_autosave = Instant::now();
        }

        Ok(stats)
    }

    fn reap_unloads(&mut self, stats: &mut WorldTickStats) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .unloading
            .drain(..)
            .partition(|handle| handle.is_finished());
        self.unloading = running;

        for handle in finished {
            // failures were already logged when the unload completed
            let _ = handle.wait();
            stats.unloads_finished += 1;
        }
    }

    /// Render thread only.
    pub fn process_uploads(&self, device: &mut dyn GraphicsDevice) -> UploadStats {
        self.store.uploader().process_uploads(device)
    }

    /// Waits for every unload started so far, then shuts the store down.
    pub fn shutdown(&mut self) -> ChunkResult<ShutdownReport> {
        let mut first_error = None;
        for handle in self.unloading.drain(..) {
            if let Err(e) = handle.wait() {
                first_error.get_or_insert(e);
            }
        }
        let summary = self.store.shutdown()?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// Positions within `radius` of `center`, nearest ring first.
pub fn ring_order(center: ChunkPosition, radius: u32) -> impl Iterator<Item = ChunkPosition> {
    let r = radius as i32;
    (0..=r).flat_map(move |ring| {
        (-ring..=ring).flat_map(move |dz| {
            (-ring..=ring).filter_map(move |dx| {
                (dx.abs() == ring || dz.abs() == ring).then(|| center.offset(dx, dz))
            })
        })
    })
}
