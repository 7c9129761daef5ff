use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use dashmap::mapref::entry::Entry;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    block::BlockId,
    cache::PositionCache,
    chunk::{Chunk, ChunkBlocks, ChunkMetadata, now_millis},
    config::{StoreConfig, UploaderConfig},
    coords::{ChunkPosition, WorldVector, edge_faces, lv_in_bounds, wv_to_cp, wv_to_lv},
    error::{ChunkError, ChunkResult, report},
    features::{FeatureBatchStats, FeaturePopulationQueue, FeatureStep, FeatureTask},
    generation::{FeatureContext, PersistPolicy, RegenerateOnLoad, TerrainGenerator},
    hasher::{PositionMap, position_map},
    metrics::{ChunkMetric, ChunkMetrics},
    state::ChunkState,
    storage::ChunkPersistence,
    task::{Completion, PendingTask, Populated, UnloadHandle},
    upload::AsyncUploader,
};

/// Hooks for systems that keep per-chunk state of their own (entities, simulations).
/// Called synchronously on the thread that finalizes the load or completes the unload.
pub trait ChunkListener: Send + Sync {
    fn on_chunk_loaded(&self, _chunk: &Arc<Chunk>) {}

    /// Runs after a dirty chunk's terminal save has captured its content. The blocks
    /// are still readable here; they are released once every listener returns.
    fn on_chunk_unloaded(&self, _chunk: &Arc<Chunk>) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Population tasks that never got to run.
    pub cancelled_tasks: usize,
    pub cancelled_uploads: usize,
    pub saved_chunks: usize,
}

pub struct ChunkStoreBuilder {
    generator: Arc<dyn TerrainGenerator>,
    persistence: Arc<dyn ChunkPersistence>,
    policy: Arc<dyn PersistPolicy>,
    config: StoreConfig,
    uploader: Option<Arc<AsyncUploader>>,
    metrics: Option<Arc<ChunkMetrics>>,
}

impl ChunkStoreBuilder {
    pub fn new(
        generator: Arc<dyn TerrainGenerator>,
        persistence: Arc<dyn ChunkPersistence>,
    ) -> Self {
        Self {
            generator,
            persistence,
            policy: Arc::new(RegenerateOnLoad),
            config: StoreConfig::default(),
            uploader: None,
            metrics: None,
        }
    }

    pub fn with_policy(mut self, policy: impl PersistPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<AsyncUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ChunkMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> ChunkResult<ChunkStore> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.worker_threads)
            .thread_name(|i| format!("chunkline-worker-{i}"))
            .build()?;
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(ChunkMetrics::new()));
        let uploader = self.uploader.unwrap_or_else(|| {
            Arc::new(AsyncUploader::new(
                UploaderConfig::default(),
                metrics.clone(),
            ))
        });

        info!(
            "chunk store up with {} workers",
            pool.current_num_threads()
        );

        Ok(ChunkStore {
            inner: Arc::new(StoreInner {
                chunks: position_map(),
                pending: position_map(),
                saving: position_map(),
                autosaving: position_map(),
                generator: self.generator,
                persistence: self.persistence,
                policy: self.policy,
                listeners: RwLock::new(Vec::new()),
                features: FeaturePopulationQueue::new(&self.config),
                uploader,
                cache: PositionCache::default(),
                metrics,
                pool,
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

struct StoreInner {
    chunks: PositionMap<Arc<Chunk>>,
    pending: PositionMap<Arc<PendingTask>>,
    // terminal saves of unloading chunks; the position stays unavailable until done
    saving: PositionMap<Arc<Completion<ChunkResult<()>>>>,
    autosaving: PositionMap<()>,
    generator: Arc<dyn TerrainGenerator>,
    persistence: Arc<dyn ChunkPersistence>,
    policy: Arc<dyn PersistPolicy>,
    listeners: RwLock<Vec<Arc<dyn ChunkListener>>>,
    features: FeaturePopulationQueue,
    uploader: Arc<AsyncUploader>,
    cache: PositionCache,
    metrics: Arc<ChunkMetrics>,
    pool: ThreadPool,
    shut_down: AtomicBool,
}

/// Owns every loaded chunk. Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<StoreInner>,
}

impl ChunkStore {
    const UNLOAD_SAVE_ATTEMPTS: usize = 3;

    pub fn builder(
        generator: Arc<dyn TerrainGenerator>,
        persistence: Arc<dyn ChunkPersistence>,
    ) -> ChunkStoreBuilder {
        ChunkStoreBuilder::new(generator, persistence)
    }

    pub fn add_listener(&self, listener: Arc<dyn ChunkListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn get_chunk(&self, pos: ChunkPosition) -> Option<Arc<Chunk>> {
        self.inner.chunks.get(&pos).map(|entry| entry.value().clone())
    }

    pub fn has_chunk(&self, pos: ChunkPosition) -> bool {
        self.inner.chunks.contains_key(&pos)
    }

    pub fn loaded_count(&self) -> usize {
        self.inner.chunks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn loaded_positions(&self) -> Vec<ChunkPosition> {
        self.inner.chunks.iter().map(|entry| *entry.key()).collect()
    }

    pub fn metrics(&self) -> &Arc<ChunkMetrics> {
        &self.inner.metrics
    }

    pub fn uploader(&self) -> &Arc<AsyncUploader> {
        &self.inner.uploader
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn feature_queue_len(&self) -> usize {
        self.inner.features.len()
    }

    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.inner.pool.spawn(job);
    }

    /// Non-blocking. `Ok(None)` means "not ready yet, ask again next tick". A failed
    /// load or generation is returned once, after which the position may be retried.
    pub fn get_or_create_chunk(&self, pos: ChunkPosition) -> ChunkResult<Option<Arc<Chunk>>> {
        if let Some(chunk) = self.get_chunk(pos) {
            return Ok(Some(chunk));
        }
        if self.is_shut_down() {
            return Err(ChunkError::ShutDown);
        }
        // loading now could read what the terminal save is about to overwrite
        if self.inner.saving.contains_key(&pos) {
            return Ok(None);
        }

        let task = match self.inner.pending.entry(pos) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // finalized between the map lookup and the entry lock
                if let Some(chunk) = self.get_chunk(pos) {
                    return Ok(Some(chunk));
                }
                let task = Arc::new(PendingTask::new(pos));
                entry.insert(task.clone());
                self.spawn_population(task);
                return Ok(None);
            }
        };

        self.try_finalize(&task)
    }

    /// Waits for the chunk. Bootstrap only; never call this from a frame loop.
    pub fn get_or_create_chunk_blocking(&self, pos: ChunkPosition) -> ChunkResult<Arc<Chunk>> {
        loop {
            if let Some(chunk) = self.get_or_create_chunk(pos)? {
                return Ok(chunk);
            }

            let task = self.inner.pending.get(&pos).map(|e| e.value().clone());
            if let Some(task) = task {
                task.result.wait_done();
                continue;
            }

            let save = self.inner.saving.get(&pos).map(|e| e.value().clone());
            if let Some(save) = save {
                save.wait_done();
                continue;
            }

            // another thread is mid-finalize
            thread::yield_now();
        }
    }

    fn spawn_population(&self, task: Arc<PendingTask>) {
        let store = self.clone();
        self.inner.pool.spawn(move || {
            let pos = task.pos;
            if !task.begin() {
                task.result.complete(Err(ChunkError::Cancelled(pos)));
                return;
            }
            let populated = panic::catch_unwind(AssertUnwindSafe(|| store.populate(pos)))
                .unwrap_or_else(|_| {
                    error!("population task for chunk {pos} panicked");
                    Err(ChunkError::TaskPanicked(pos))
                });
            task.result.complete(populated);
        });
    }

    #[cfg_attr(feature = "profile", tracing::instrument(skip(self)))]
    fn populate(&self, pos: ChunkPosition) -> ChunkResult<Populated> {
        let inner = &self.inner;

        let loaded = inner
            .metrics
            .get(ChunkMetric::Load)
            .time(|| inner.persistence.load_chunk(pos))
            .map_err(|source| ChunkError::Load { pos, source })?;
        if let Some(persisted) = loaded {
            return Ok(Populated::Loaded(persisted));
        }

        let mut blocks = ChunkBlocks::default();
        let info = inner
            .metrics
            .get(ChunkMetric::Generate)
            .time(|| inner.generator.generate_terrain(pos, &mut blocks))
            .map_err(|source| ChunkError::Generate { pos, source })?;
        let must_persist = inner.policy.must_persist(pos, &blocks, &info);

        let now = now_millis();
        Ok(Populated::Generated {
            blocks,
            metadata: ChunkMetadata {
                created_at: now,
                last_modified: now,
                seed: inner.generator.seed(),
                has_structures: info.has_structures,
                needs_decoration: info.needs_decoration,
                has_entities: info.has_entities,
            },
            must_persist,
        })
    }

    fn try_finalize(&self, task: &Arc<PendingTask>) -> ChunkResult<Option<Arc<Chunk>>> {
        let pos = task.pos;
        // unfinished, or another caller is finalizing it right now
        let Some(outcome) = task.result.take() else {
            return Ok(None);
        };

        let populated = match outcome {
            Ok(populated) => populated,
            Err(e) => {
                self.inner
                    .pending
                    .remove_if(&pos, |_, pending| Arc::ptr_eq(pending, task));
                return Err(e);
            }
        };

        let chunk = Arc::new(Self::build_chunk(pos, populated));
        chunk.mark_mesh_dirty_only();
        chunk.state.add(ChunkState::ACTIVE);

        // visible in the map before the pending entry goes, so nobody spawns a duplicate
        self.inner.chunks.insert(pos, chunk.clone());
        self.inner
            .pending
            .remove_if(&pos, |_, pending| Arc::ptr_eq(pending, task));

        for neighbor in self.inner.cache.get(pos).neighbors {
            if let Some(neighbor) = self.get_chunk(neighbor) {
                neighbor.mark_mesh_dirty_only();
            }
        }

        let listeners = self.inner.listeners.read().clone();
        for listener in &listeners {
            listener.on_chunk_loaded(&chunk);
        }

        if !chunk.features_populated() {
            self.inner.features.enqueue(pos);
        }

        debug!("chunk {pos} is live");
        Ok(Some(chunk))
    }

    fn build_chunk(pos: ChunkPosition, populated: Populated) -> Chunk {
        match populated {
            Populated::Loaded(persisted) => {
                let chunk = Chunk::from_persisted(pos, persisted);
                if chunk.features_populated() {
                    chunk
                        .state
                        .add(ChunkState::FEATURES_POPULATED | ChunkState::READY);
                }
                chunk
            }
            Populated::Generated {
                blocks,
                metadata,
                must_persist,
            } => {
                let decorate = metadata.needs_decoration;
                let chunk = Chunk::new(
                    pos,
                    blocks,
                    metadata,
                    !decorate,
                    ChunkState::CREATED | ChunkState::BLOCKS_POPULATED,
                );
                if !decorate {
                    chunk
                        .state
                        .add(ChunkState::FEATURES_POPULATED | ChunkState::READY);
                }
                if must_persist {
                    chunk.dirty.mark_data_dirty_only();
                    chunk.state.add(ChunkState::DATA_MODIFIED);
                }
                chunk
            }
        }
    }

    /// Starts unloading `pos`. Returns `None` if it isn't loaded or is already leaving.
    /// A data-dirty chunk is saved on the worker pool first; listeners and resource
    /// release follow the save.
    pub fn unload_chunk(&self, pos: ChunkPosition) -> Option<UnloadHandle> {
        let chunk = self.get_chunk(pos)?;
        if !chunk.state.begin_unload() {
            return None;
        }

        let done = Arc::new(Completion::new());
        self.inner.saving.insert(pos, done.clone());
        self.inner
            .chunks
            .remove_if(&pos, |_, loaded| Arc::ptr_eq(loaded, &chunk));
        self.inner.features.remove(pos);

        if chunk.is_data_dirty() {
            let store = self.clone();
            let finished = done.clone();
            self.inner.pool.spawn(move || {
                let saved = panic::catch_unwind(AssertUnwindSafe(|| store.save_until_clean(&chunk)))
                    .unwrap_or_else(|_| Err(ChunkError::TaskPanicked(pos)));
                store.finish_unload(&chunk, saved, &finished);
            });
        } else {
            self.finish_unload(&chunk, Ok(()), &done);
        }

        Some(UnloadHandle::new(pos, done))
    }

    // A writer still holding the chunk may slip an edit in after the capture.
    fn save_until_clean(&self, chunk: &Chunk) -> ChunkResult<()> {
        for _ in 0..Self::UNLOAD_SAVE_ATTEMPTS {
            if self.save_chunk(chunk)? {
                return Ok(());
            }
        }
        warn!(
            "chunk {} kept changing during its final save",
            chunk.position()
        );
        Ok(())
    }

    /// Saves one chunk now. `true` if the save cleared the data-dirty flag or there
    /// was nothing left to write.
    fn save_chunk(&self, chunk: &Chunk) -> ChunkResult<bool> {
        let pos = chunk.position();
        let _guard = chunk.save_guard();
        // a queued autosave can outlive the unload; its released blocks must not
        // replace what the terminal save wrote
        if chunk.state.has_any(ChunkState::UNLOADED)
            || chunk.read().blocks().is_released()
            || !chunk.is_data_dirty()
        {
            return Ok(true);
        }
        let (persisted, epoch) = chunk.capture_for_save();
        self.inner
            .metrics
            .get(ChunkMetric::Save)
            .time(|| self.inner.persistence.save_chunk(pos, &persisted))
            .map_err(|source| ChunkError::Save { pos, source })?;
        Ok(chunk.acknowledge_save(epoch))
    }

    fn finish_unload(
        &self,
        chunk: &Arc<Chunk>,
        saved: ChunkResult<()>,
        done: &Completion<ChunkResult<()>>,
    ) {
        let pos = chunk.position();
        if let Err(e) = &saved {
            error!("chunk {pos} unloaded without a successful save: {}", report(e));
        }

        let listeners = self.inner.listeners.read().clone();
        for listener in &listeners {
            listener.on_chunk_unloaded(chunk);
        }

        {
            // in-flight autosaves finish capturing before the blocks go
            let _guard = chunk.save_guard();
            if let Some(handle) = chunk.release_resources() {
                self.inner.uploader.release(handle);
            }
            chunk.state.finish_unload();
        }

        self.inner.cache.remove(pos);
        let pruned = self
            .inner
            .cache
            .prune(self.inner.chunks.len(), |p| self.inner.chunks.contains_key(&p));
        if pruned > 0 {
            debug!("pruned {pruned} position cache entries");
        }

        self.inner.saving.remove(&pos);
        debug!("chunk {pos} unloaded");
        done.complete(saved);
    }

    pub fn get_block(&self, wv: WorldVector) -> Option<BlockId> {
        let lv = wv_to_lv(wv);
        if !lv_in_bounds(lv) {
            return None;
        }
        self.get_chunk(wv_to_cp(wv)).map(|chunk| chunk.get_block(lv))
    }

    /// World-coordinate edit. An edit on a column edge re-meshes the neighbour that
    /// shares the seam. Returns whether anything changed.
    pub fn set_block(&self, wv: WorldVector, block: BlockId) -> ChunkResult<bool> {
        let pos = wv_to_cp(wv);
        let lv = wv_to_lv(wv);
        if !lv_in_bounds(lv) {
            return Ok(false);
        }
        let chunk = self
            .get_chunk(pos)
            .filter(|chunk| !chunk.state.has_any(ChunkState::UNLOADING))
            .ok_or(ChunkError::NotLoaded(pos))?;

        if !chunk.write().set_lv(lv, block) {
            return Ok(false);
        }
        for face in edge_faces(lv).into_iter().flatten() {
            if let Some(neighbor) = self.get_chunk(pos.across(face)) {
                neighbor.mark_mesh_dirty_only();
            }
        }
        Ok(true)
    }

    pub fn get_dirty_chunks(&self) -> Vec<Arc<Chunk>> {
        self.inner
            .chunks
            .iter()
            .filter(|entry| entry.value().is_data_dirty())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Loaded chunks within `distance` (Chebyshev) of `center`, nearest first.
    pub fn get_chunks_in_render_distance(
        &self,
        center: ChunkPosition,
        distance: u32,
    ) -> Vec<(ChunkPosition, Arc<Chunk>)> {
        let mut chunks: Vec<_> = self
            .inner
            .chunks
            .iter()
            .filter(|entry| entry.key().chebyshev_distance(center) <= distance)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        chunks.sort_by_key(|(pos, _)| (pos.chebyshev_distance(center), *pos));
        chunks
    }

    /// Queues a background save for every data-dirty chunk that isn't already being
    /// saved. Returns how many were scheduled.
    pub fn save_dirty_chunks(&self) -> usize {
        let mut scheduled = 0;
        for chunk in self.get_dirty_chunks() {
            let pos = chunk.position();
            if chunk.state.has_any(ChunkState::UNLOADING)
                || self.inner.autosaving.insert(pos, ()).is_some()
            {
                continue;
            }

            let store = self.clone();
            self.inner.pool.spawn(move || {
                let saved = panic::catch_unwind(AssertUnwindSafe(|| store.save_chunk(&chunk)))
                    .unwrap_or_else(|_| Err(ChunkError::TaskPanicked(pos)));
                if let Err(e) = saved {
                    error!("autosave failed: {}", report(&e));
                }
                store.inner.autosaving.remove(&pos);
            });
            scheduled += 1;
        }
        if scheduled > 0 {
            debug!("autosaving {scheduled} chunks");
        }
        scheduled
    }

    /// Runs one adaptive batch of deferred decoration. Call once per tick.
    #[cfg_attr(feature = "profile", tracing::instrument(skip(self)))]
    pub fn process_pending_feature_population(&self, last_frame: Duration) -> FeatureBatchStats {
        let started = Instant::now();
        let stats = self
            .inner
            .features
            .process(last_frame, |task| self.decorate(task));
        if stats.decorated > 0 || stats.failed > 0 {
            debug!(
                "decorated {} chunks ({} failed, batch {}) in {:?}",
                stats.decorated,
                stats.failed,
                stats.batch_size,
                started.elapsed()
            );
        }
        stats
    }

    fn decorate(&self, task: &FeatureTask) -> FeatureStep {
        let pos = task.pos;
        let Some(chunk) = self.get_chunk(pos) else {
            return FeatureStep::Skipped;
        };
        if chunk.features_populated() || chunk.state.has_any(ChunkState::UNLOADING) {
            return FeatureStep::Skipped;
        }

        let ready = |p: ChunkPosition| {
            self.get_chunk(p)
                .filter(|c| !c.state.has_any(ChunkState::UNLOADING))
        };
        let (Some(east), Some(south), Some(south_east)) =
            (ready(pos.east()), ready(pos.south()), ready(pos.south_east()))
        else {
            return FeatureStep::NotReady;
        };

        let touched: Vec<ChunkPosition> = {
            // (z, x) order, the same for every window, so concurrent passes can't deadlock
            let writers = [chunk.write(), east.write(), south.write(), south_east.write()];
            let mut ctx = FeatureContext::new(pos, self.inner.generator.seed(), writers);
            let populated = self
                .inner
                .metrics
                .get(ChunkMetric::Decorate)
                .time(|| self.inner.generator.populate_features(&mut ctx));
            if let Err(e) = populated {
                warn!("decorating chunk {pos} failed: {e}");
                return FeatureStep::Failed;
            }
            ctx.touched().collect()
        };

        chunk.set_features_populated();
        chunk
            .state
            .add(ChunkState::FEATURES_POPULATED | ChunkState::READY);
        // the flag itself has to reach disk
        chunk.dirty.mark_data_dirty_only();
        chunk.state.add(ChunkState::DATA_MODIFIED);

        for changed in touched {
            for neighbor in self.inner.cache.get(changed).neighbors {
                if let Some(neighbor) = self.get_chunk(neighbor) {
                    neighbor.mark_mesh_dirty_only();
                }
            }
        }
        FeatureStep::Decorated
    }

    /// Cancels queued population, waits for terminal saves, then saves every dirty
    /// chunk still loaded and flushes storage. Returns the first save error.
    pub fn shutdown(&self) -> ChunkResult<ShutdownReport> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(ShutdownReport::default());
        }
        let mut summary = ShutdownReport::default();

        let pending: Vec<_> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        summary.cancelled_tasks = pending.iter().filter(|task| task.cancel()).count();
        self.inner.pending.clear();
        self.inner.features.clear();
        summary.cancelled_uploads = self.inner.uploader.cancel_all();

        let in_flight: Vec<_> = self
            .inner
            .saving
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for save in in_flight {
            save.wait_done();
        }

        // autosaves still running hold the per-chunk save lock, so these queue behind them
        let mut first_error = None;
        for chunk in self.get_dirty_chunks() {
            match self.save_chunk(&chunk) {
                Ok(_) => summary.saved_chunks += 1,
                Err(e) => {
                    error!("{}", report(&e));
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.inner.persistence.flush() {
            error!("flushing chunk storage failed: {e}");
            first_error.get_or_insert(ChunkError::Storage(e));
        }

        info!(
            "chunk store shut down: {} saved, {} tasks and {} uploads cancelled",
            summary.saved_chunks, summary.cancelled_tasks, summary.cancelled_uploads
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}
